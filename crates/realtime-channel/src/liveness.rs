//! Ping/pong liveness monitor.
//!
//! Built only on the public [`RealtimeChannel`] API: it pings on a fixed
//! interval while connected, remembers when the last `pong` arrived, and
//! reports the connection as stale once the server has been silent for too
//! long. Staleness is advisory unless `force_reconnect` is set.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::channel::RealtimeChannel;
use crate::registry::Subscription;
use crate::types::event_type;

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(75);
const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Time between pings.
    pub interval: Duration,
    /// Silence after which the connection counts as stale.
    pub stale_after: Duration,
    /// Cycle the connection (disconnect + connect) once per stale episode.
    pub force_reconnect: bool,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PING_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            force_reconnect: false,
        }
    }
}

/// Handle to a running monitor. Dropping it stops the monitor.
pub struct LivenessMonitor {
    stale: watch::Receiver<bool>,
    pong_sub: Subscription,
    task: JoinHandle<()>,
}

impl LivenessMonitor {
    /// Start monitoring. An `interval` below one millisecond is raised to it.
    pub fn spawn(channel: RealtimeChannel, mut config: LivenessConfig) -> Self {
        if config.interval < MIN_PING_INTERVAL {
            tracing::warn!(interval = ?config.interval, "Ping interval too small, using 1ms");
            config.interval = MIN_PING_INTERVAL;
        }
        let last_pong = Arc::new(Mutex::new(Instant::now()));
        let pong_seen = Arc::clone(&last_pong);
        let pong_sub = channel.subscribe(event_type::PONG, move |_| {
            *pong_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        });

        let (stale_tx, stale) = watch::channel(false);
        let task = tokio::spawn(run_monitor(channel, config, last_pong, stale_tx));

        Self {
            stale,
            pong_sub,
            task,
        }
    }

    pub fn is_stale(&self) -> bool {
        *self.stale.borrow()
    }

    /// Stream of staleness changes.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.stale.clone()
    }

    pub fn stop(self) {
        drop(self);
    }
}

async fn run_monitor(
    channel: RealtimeChannel,
    config: LivenessConfig,
    last_pong: Arc<Mutex<Instant>>,
    stale_tx: watch::Sender<bool>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut was_connected = false;

    loop {
        ticker.tick().await;
        if !channel.is_connected() {
            was_connected = false;
            continue;
        }

        let silent_for = {
            let mut last = last_pong.lock().unwrap_or_else(PoisonError::into_inner);
            if !was_connected {
                // Fresh connection: the silence clock starts now.
                *last = Instant::now();
                was_connected = true;
            }
            last.elapsed()
        };

        if silent_for >= config.stale_after {
            if !*stale_tx.borrow() {
                tracing::warn!(
                    silent = ?silent_for,
                    "No pong received, connection is stale"
                );
                stale_tx.send_replace(true);
                if config.force_reconnect {
                    tracing::info!("Cycling stale connection");
                    channel.disconnect();
                    channel.connect();
                    was_connected = false;
                    continue;
                }
            }
        } else if *stale_tx.borrow() {
            tracing::info!("Connection is live again");
            stale_tx.send_replace(false);
        }

        channel.ping();
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.task.abort();
        self.pong_sub.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;

    #[tokio::test]
    async fn idle_channel_is_never_stale() {
        let channel = RealtimeChannel::new(ChannelConfig::new("ws://127.0.0.1:9/ws").unwrap());
        let monitor = LivenessMonitor::spawn(
            channel.clone(),
            LivenessConfig {
                interval: Duration::from_millis(5),
                stale_after: Duration::from_millis(10),
                force_reconnect: true,
            },
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!monitor.is_stale());
        assert_eq!(channel.subscriber_count(), 1);

        monitor.stop();
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn zero_interval_is_clamped_and_keeps_running() {
        let channel = RealtimeChannel::new(ChannelConfig::new("ws://127.0.0.1:9/ws").unwrap());
        let monitor = LivenessMonitor::spawn(
            channel,
            LivenessConfig {
                interval: Duration::ZERO,
                ..LivenessConfig::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!monitor.task.is_finished());
        assert!(!monitor.is_stale());
    }
}
