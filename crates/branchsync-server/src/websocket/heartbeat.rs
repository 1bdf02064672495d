//! Session liveness.
//!
//! Every inbound frame refreshes [`ClientConnection::mark_alive`]. The outbound
//! task asks [`Heartbeat::pulse`] what to do on each ping tick: ping the client
//! again, or evict it once it has been silent for the timeout.

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};

use super::connection::ClientConnection;
use crate::config::ServerConfig;

/// What the outbound task does on a ping tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    /// The client spoke recently; send another ping.
    Ping,
    /// The client has been silent past the timeout.
    Evict {
        /// How long nothing arrived.
        silent_for: Duration,
    },
}

/// Ping cadence and silence budget of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
}

impl Heartbeat {
    /// Heartbeat with whole-second bounds. The timeout is never shorter than
    /// one interval.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let interval = interval.max(Duration::from_secs(1));
        Self {
            interval,
            timeout: timeout.max(interval),
        }
    }

    /// Heartbeat configured for the gateway.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.heartbeat_interval_secs),
            Duration::from_secs(config.heartbeat_timeout_secs),
        )
    }

    /// Time between pings.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Silence tolerated before eviction.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ping ticker whose first tick fires one interval from now.
    pub fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Decide the next step for `connection`.
    pub fn pulse(&self, connection: &ClientConnection) -> Pulse {
        let silent_for = connection.silent_for();
        if silent_for >= self.timeout {
            Pulse::Evict { silent_for }
        } else {
            Pulse::Ping
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_connection() -> ClientConnection {
        let (tx, _rx) = mpsc::channel(32);
        ClientConnection::new("hb_conn".into(), tx)
    }

    #[test]
    fn bounds_are_clamped() {
        let hb = Heartbeat::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(hb.interval(), Duration::from_secs(1));
        assert_eq!(hb.timeout(), Duration::from_secs(1));

        let hb = Heartbeat::new(Duration::from_secs(30), Duration::from_secs(10));
        assert_eq!(hb.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn from_config_uses_heartbeat_settings() {
        let hb = Heartbeat::from_config(&ServerConfig {
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 15,
            ..ServerConfig::default()
        });
        assert_eq!(hb, Heartbeat::new(Duration::from_secs(5), Duration::from_secs(15)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_evicted_after_timeout() {
        let hb = Heartbeat::new(Duration::from_secs(1), Duration::from_secs(3));
        let conn = make_connection();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(hb.pulse(&conn), Pulse::Ping);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(hb.pulse(&conn), Pulse::Evict { silent_for: Duration::from_secs(3) });
    }

    #[tokio::test(start_paused = true)]
    async fn activity_postpones_eviction() {
        let hb = Heartbeat::new(Duration::from_secs(1), Duration::from_secs(3));
        let conn = make_connection();
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(2)).await;
            conn.mark_alive();
            assert_eq!(hb.pulse(&conn), Pulse::Ping);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_waits_one_interval() {
        let hb = Heartbeat::new(Duration::from_secs(2), Duration::from_secs(6));
        let start = tokio::time::Instant::now();
        let mut ticker = hb.ticker();
        let _ = ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        let _ = ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }
}
