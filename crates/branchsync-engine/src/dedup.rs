//! Transaction-id dedup tracker.
//!
//! Keeps a bounded FIFO history of transaction ids per `(branch, module)` and
//! the mutation ids acknowledged under each. A transaction found here has
//! already been applied and must only be re-acknowledged.
//!
//! [`TransactionTracker::begin`] serializes work on one transaction id, so a
//! recall and the matching remember cannot interleave with a second publish
//! of the same transaction.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use branchsync_core::json::now_millis;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

/// Remembered outcome of one applied transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TransRecord {
    /// When the transaction was first applied (epoch millis).
    pub ts: i64,
    /// Result payload of the first application.
    pub payload: Value,
    /// Mutation ids acknowledged under this transaction, oldest first.
    pub mutation_ids: VecDeque<String>,
    /// Most recently acknowledged mutation id.
    pub last_ack_mutation_id: Option<String>,
}

impl TransRecord {
    fn track(&mut self, mutation_id: Option<String>, limit: usize) {
        let Some(id) = mutation_id else {
            return;
        };
        if !self.mutation_ids.contains(&id) {
            self.mutation_ids.push_back(id.clone());
            while self.mutation_ids.len() > limit {
                let _ = self.mutation_ids.pop_front();
            }
        }
        self.last_ack_mutation_id = Some(id);
    }
}

#[derive(Default)]
struct History {
    order: VecDeque<String>,
    records: HashMap<String, TransRecord>,
}

/// Bounded per-`(branch, module)` transaction history.
pub struct TransactionTracker {
    history_limit: usize,
    mutation_limit: usize,
    histories: Mutex<HashMap<String, History>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive claim on one transaction id, released on drop.
pub struct InFlight<'a> {
    tracker: &'a TransactionTracker,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.tracker.in_flight.lock();
        // The map and this claim hold the only references when nobody waits.
        if in_flight.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) <= 2) {
            let _ = in_flight.remove(&self.key);
        }
        drop(self.guard.take());
    }
}

impl TransactionTracker {
    /// Create a tracker keeping at most `history_limit` transactions per key
    /// and `mutation_limit` mutation ids per transaction.
    pub fn new(history_limit: usize, mutation_limit: usize) -> Self {
        Self {
            history_limit: history_limit.max(1),
            mutation_limit: mutation_limit.max(1),
            histories: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until no other caller works on `trans_id` for this key, then claim it.
    pub async fn begin(&self, branch_id: &str, module_id: &str, trans_id: &str) -> InFlight<'_> {
        let key = format!("{}::{trans_id}", trans_history_key(branch_id, module_id));
        let lock = self.in_flight.lock().entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        InFlight {
            tracker: self,
            key,
            guard: Some(guard),
        }
    }

    /// Transaction ids currently claimed or awaited.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Record a successful application, or merge the payload's mutation id
    /// into an existing record. The first payload is never replaced.
    pub fn remember(&self, branch_id: &str, module_id: &str, trans_id: &str, payload: &Value) {
        let mutation_id = payload.get("mutationId").and_then(normalize_trans_id);
        let mut histories = self.histories.lock();
        let history = histories
            .entry(trans_history_key(branch_id, module_id))
            .or_default();

        if let Some(record) = history.records.get_mut(trans_id) {
            record.track(mutation_id, self.mutation_limit);
            return;
        }

        let mut record = TransRecord {
            ts: now_millis(),
            payload: payload.clone(),
            mutation_ids: VecDeque::new(),
            last_ack_mutation_id: None,
        };
        record.track(mutation_id, self.mutation_limit);
        let _ = history.records.insert(trans_id.to_owned(), record);
        history.order.push_back(trans_id.to_owned());
        while history.order.len() > self.history_limit {
            if let Some(evicted) = history.order.pop_front() {
                let _ = history.records.remove(&evicted);
            }
        }
    }

    /// The remembered record, if the transaction was applied and not evicted.
    pub fn recall(&self, branch_id: &str, module_id: &str, trans_id: &str) -> Option<TransRecord> {
        self.histories
            .lock()
            .get(&trans_history_key(branch_id, module_id))?
            .records
            .get(trans_id)
            .cloned()
    }

    /// Note that `mutation_id` was acknowledged under an existing transaction.
    ///
    /// Returns `false` when the transaction is unknown.
    pub fn record_mutation_ack(
        &self,
        branch_id: &str,
        module_id: &str,
        trans_id: &str,
        mutation_id: Option<&str>,
    ) -> bool {
        let mut histories = self.histories.lock();
        let Some(record) = histories
            .get_mut(&trans_history_key(branch_id, module_id))
            .and_then(|h| h.records.get_mut(trans_id))
        else {
            return false;
        };
        record.track(mutation_id.map(str::to_owned), self.mutation_limit);
        true
    }

    /// Transactions currently remembered for a key.
    pub fn history_len(&self, branch_id: &str, module_id: &str) -> usize {
        self.histories
            .lock()
            .get(&trans_history_key(branch_id, module_id))
            .map_or(0, |h| h.order.len())
    }
}

/// History key of a `(branch, module)` pair.
pub fn trans_history_key(branch_id: &str, module_id: &str) -> String {
    format!("{branch_id}::{module_id}")
}

/// Normalize a transaction or mutation id.
///
/// Strings are trimmed (blank is absent), finite numbers are stringified,
/// anything else is absent.
pub fn normalize_trans_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64().filter(|f| f.is_finite()).map(|f| f.to_string())
            }
        }
        _ => None,
    }
}

/// Transaction id of a publish frame: `trans_id`, then `transId`, then `mutationId`.
pub fn resolve_trans_id(frame: &Value) -> Option<String> {
    ["trans_id", "transId", "mutationId"]
        .iter()
        .filter_map(|key| frame.get(*key))
        .find_map(normalize_trans_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remember_then_recall() {
        let tracker = TransactionTracker::new(50, 20);
        tracker.remember("b1", "pos", "t1", &json!({"mutationId": "m1", "version": 2}));
        let record = tracker.recall("b1", "pos", "t1").unwrap();
        assert_eq!(record.payload["version"], 2);
        assert_eq!(record.mutation_ids, VecDeque::from(["m1".to_string()]));
        assert_eq!(record.last_ack_mutation_id.as_deref(), Some("m1"));
        assert!(tracker.recall("b1", "kds", "t1").is_none());
    }

    #[test]
    fn second_remember_keeps_first_payload() {
        let tracker = TransactionTracker::new(50, 20);
        tracker.remember("b1", "pos", "t1", &json!({"mutationId": "m1", "version": 2}));
        tracker.remember("b1", "pos", "t1", &json!({"mutationId": "m2", "version": 9}));
        let record = tracker.recall("b1", "pos", "t1").unwrap();
        assert_eq!(record.payload["version"], 2);
        assert_eq!(record.mutation_ids.len(), 2);
        assert_eq!(record.last_ack_mutation_id.as_deref(), Some("m2"));
        assert_eq!(tracker.history_len("b1", "pos"), 1);
    }

    #[test]
    fn history_evicts_oldest_beyond_limit() {
        let limit = 50;
        let tracker = TransactionTracker::new(limit, 20);
        for i in 0..=limit {
            tracker.remember("b1", "pos", &format!("t{i}"), &json!({}));
        }
        assert_eq!(tracker.history_len("b1", "pos"), limit);
        assert!(tracker.recall("b1", "pos", "t0").is_none());
        assert!(tracker.recall("b1", "pos", "t1").is_some());
        assert!(tracker.recall("b1", "pos", &format!("t{limit}")).is_some());
    }

    #[test]
    fn mutation_ids_are_bounded() {
        let tracker = TransactionTracker::new(5, 3);
        tracker.remember("b1", "pos", "t1", &json!({"mutationId": "m0"}));
        for i in 1..6 {
            assert!(tracker.record_mutation_ack("b1", "pos", "t1", Some(&format!("m{i}"))));
        }
        let record = tracker.recall("b1", "pos", "t1").unwrap();
        assert_eq!(
            record.mutation_ids,
            VecDeque::from(["m3".to_string(), "m4".to_string(), "m5".to_string()])
        );
    }

    #[test]
    fn repeated_mutation_id_is_not_duplicated() {
        let tracker = TransactionTracker::new(5, 3);
        tracker.remember("b1", "pos", "t1", &json!({"mutationId": "m1"}));
        assert!(tracker.record_mutation_ack("b1", "pos", "t1", Some("m1")));
        assert_eq!(tracker.recall("b1", "pos", "t1").unwrap().mutation_ids.len(), 1);
    }

    #[test]
    fn ack_for_unknown_transaction() {
        let tracker = TransactionTracker::new(5, 3);
        assert!(!tracker.record_mutation_ack("b1", "pos", "nope", Some("m1")));
    }

    #[test]
    fn trans_id_normalization() {
        assert_eq!(normalize_trans_id(&json!("  t1 ")).as_deref(), Some("t1"));
        assert_eq!(normalize_trans_id(&json!("   ")), None);
        assert_eq!(normalize_trans_id(&json!(42)).as_deref(), Some("42"));
        assert_eq!(normalize_trans_id(&json!(1.5)).as_deref(), Some("1.5"));
        assert_eq!(normalize_trans_id(&json!(true)), None);
        assert_eq!(normalize_trans_id(&Value::Null), None);
    }

    #[test]
    fn trans_id_resolution_order() {
        assert_eq!(
            resolve_trans_id(&json!({"trans_id": "a", "transId": "b", "mutationId": "c"})).as_deref(),
            Some("a")
        );
        assert_eq!(
            resolve_trans_id(&json!({"trans_id": " ", "transId": "b"})).as_deref(),
            Some("b")
        );
        assert_eq!(resolve_trans_id(&json!({"mutationId": 7})).as_deref(), Some("7"));
        assert_eq!(resolve_trans_id(&json!({})), None);
    }

    #[tokio::test]
    async fn begin_serializes_same_transaction() {
        let tracker = Arc::new(TransactionTracker::new(5, 3));
        let first = tracker.begin("b1", "pos", "t1").await;

        let waiter = tracker.clone();
        let second = tokio::spawn(async move {
            let _claim = waiter.begin("b1", "pos", "t1").await;
            waiter.recall("b1", "pos", "t1").is_some()
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        tracker.remember("b1", "pos", "t1", &json!({}));
        drop(first);
        assert!(second.await.unwrap());
        assert_eq!(tracker.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn begin_does_not_block_other_transactions() {
        let tracker = TransactionTracker::new(5, 3);
        let _t1 = tracker.begin("b1", "pos", "t1").await;
        let t2 = tokio::time::timeout(std::time::Duration::from_secs(1), tracker.begin("b1", "pos", "t2")).await;
        assert!(t2.is_ok());
        assert_eq!(tracker.in_flight_len(), 2);
        drop(t2);
        assert_eq!(tracker.in_flight_len(), 1);
    }

    #[test]
    fn histories_are_scoped_per_key() {
        let tracker = TransactionTracker::new(1, 1);
        tracker.remember("b1", "pos", "t1", &json!({}));
        tracker.remember("b2", "pos", "t2", &json!({}));
        assert!(tracker.recall("b1", "pos", "t1").is_some());
        assert!(tracker.recall("b2", "pos", "t2").is_some());
        assert_eq!(trans_history_key("b1", "pos"), "b1::pos");
    }
}
