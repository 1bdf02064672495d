//! Gateway shutdown: one token stops the listener and every session, then a
//! bounded drain waits for sessions to release their subscriptions.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::websocket::clients::SessionManager;

/// How often the drain re-checks the session count.
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The listener stopped and every session disconnected.
    Drained,
    /// The grace period ran out; the listener task was aborted.
    TimedOut {
        /// Sessions still registered at the deadline.
        sessions: usize,
    },
}

/// Shutdown signal shared by the listener and all sessions.
#[derive(Debug, Clone, Default)]
pub struct GatewayShutdown {
    token: CancellationToken,
}

impl GatewayShutdown {
    /// Untriggered shutdown signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that resolves once shutdown is triggered.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger shutdown. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether shutdown was triggered.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown, then wait up to `grace` for the serve task to return
    /// and for `sessions` to empty.
    pub async fn drain(
        &self,
        serve: JoinHandle<()>,
        sessions: &SessionManager,
        grace: Duration,
    ) -> DrainOutcome {
        self.trigger();
        info!(sessions = sessions.connection_count(), ?grace, "draining gateway");

        let abort = serve.abort_handle();
        let drained = tokio::time::timeout(grace, async {
            let _ = serve.await;
            while sessions.connection_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;

        if drained.is_ok() {
            DrainOutcome::Drained
        } else {
            abort.abort();
            let remaining = sessions.connection_count();
            warn!(sessions = remaining, ?grace, "drain timed out");
            DrainOutcome::TimedOut { sessions: remaining }
        }
    }
}
