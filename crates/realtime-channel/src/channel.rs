//! Public entry point: [`RealtimeChannel`].

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, watch};

use crate::config::ChannelConfig;
use crate::connection::{Command, Driver, Shared};
use crate::registry::Subscription;
use crate::types::{ConnectionState, Envelope, Error, TypeFilter, event_type};

static GLOBAL: OnceLock<RealtimeChannel> = OnceLock::new();

struct Handle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

/// Client side of the push connection: one WebSocket, many subscribers.
///
/// There is one channel per process, created by
/// [`install`](Self::install) and reached through [`global`](Self::global).
/// Cloning is cheap and every clone talks to the same connection. None of the
/// methods fail: transport problems surface only as `connection_status`
/// envelopes and through [`is_connected`](Self::is_connected).
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<Handle>,
}

impl RealtimeChannel {
    /// Create a channel in the `disconnected` state and spawn its driver task.
    /// Must run inside a Tokio runtime.
    pub(crate) fn new(config: ChannelConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(config));
        tokio::spawn(Driver::new(Arc::clone(&shared), commands_rx).run());
        Self {
            inner: Arc::new(Handle { commands, shared }),
        }
    }

    /// A channel outside the process-wide slot, for test suites that need a
    /// fresh connection per case.
    #[cfg(feature = "test-util")]
    #[doc(hidden)]
    pub fn new_isolated(config: ChannelConfig) -> Self {
        Self::new(config)
    }

    /// Create the process-wide channel. Fails if one was already installed.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn install(config: ChannelConfig) -> Result<&'static RealtimeChannel, Error> {
        let mut created = false;
        let channel = GLOBAL.get_or_init(|| {
            created = true;
            RealtimeChannel::new(config)
        });
        if created {
            Ok(channel)
        } else {
            Err(Error::AlreadyInstalled)
        }
    }

    /// The process-wide channel, if [`install`](Self::install) has run.
    pub fn global() -> Option<&'static RealtimeChannel> {
        GLOBAL.get()
    }

    /// Open the connection. No-op while connecting or connected.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the connection, cancel any scheduled reconnect and reset the
    /// attempt counter.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Register `callback` for envelopes matching `filter` (`"*"` matches all).
    ///
    /// Registrations are additive; the returned handle removes exactly this
    /// one.
    pub fn subscribe<F>(&self, filter: impl Into<TypeFilter>, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner
            .shared
            .registry
            .subscribe(filter.into(), Arc::new(callback))
    }

    /// Send `{type, data}` if connected; otherwise the message is dropped.
    pub fn send_message(&self, kind: &str, data: serde_json::Value) {
        if !self.is_connected() {
            tracing::debug!(kind, "Dropping outbound message: not connected");
            return;
        }
        match Envelope::new(kind, data).to_json() {
            Ok(text) => self.command(Command::Send(text)),
            Err(e) => tracing::warn!(kind, "Failed to serialize outbound message: {e}"),
        }
    }

    /// Liveness probe; the server answers with a `pong` envelope.
    pub fn ping(&self) {
        self.send_message(event_type::PING, serde_json::json!({}));
    }

    /// Ask the server to stream updates for one campaign.
    pub fn subscribe_campaign(&self, campaign_id: &str) {
        self.send_message(
            event_type::SUBSCRIBE,
            serde_json::json!({ "campaign_id": campaign_id }),
        );
    }

    pub fn unsubscribe_campaign(&self, campaign_id: &str) {
        self.send_message(
            event_type::UNSUBSCRIBE,
            serde_json::json!({ "campaign_id": campaign_id }),
        );
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// Stream of state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// Automatic reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.shared.attempts.load(Ordering::Acquire)
    }

    /// Live registrations, for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.inner.shared.registry.len()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.shared.config
    }

    fn command(&self, cmd: Command) {
        if self.inner.commands.send(cmd).is_err() {
            tracing::warn!("Connection driver is not running");
        }
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("url", &self.inner.shared.config.url)
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
