//! Client-side realtime event channel.
//!
//! Keeps one WebSocket connection to a backend push endpoint and fans each
//! inbound JSON envelope out to any number of independent subscribers.
//!
//! # Features
//! - Open-ended type routing: subscribe to a type tag or to `"*"`
//! - FIFO delivery, registration-ordered fan-out, panicking callbacks isolated
//! - Bounded automatic reconnect (fixed delay by default, optional backoff)
//! - Best-effort sends: dropped silently while disconnected
//! - Optional ping/pong [`LivenessMonitor`]
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), realtime_channel::Error> {
//! use realtime_channel::{ChannelConfig, RealtimeChannel, event_type};
//!
//! let channel = RealtimeChannel::install(ChannelConfig::from_env()?)?;
//!
//! let status = channel.subscribe(event_type::CONNECTION_STATUS, |env| {
//!     println!("online: {}", env.data["connected"]);
//! });
//! let _feed = channel.subscribe("*", |env| println!("{}: {}", env.kind, env.data));
//!
//! channel.connect();
//! channel.subscribe_campaign("campaign-42");
//!
//! // later
//! status.unsubscribe();
//! channel.disconnect();
//! # Ok(())
//! # }
//! ```

mod channel;
mod config;
mod connection;
mod liveness;
mod registry;
mod types;

pub use channel::RealtimeChannel;
pub use config::{
    Backoff, ChannelConfig, ENV_MAX_RECONNECT_ATTEMPTS, ENV_RECONNECT_DELAY_MS, ENV_URL,
    ReconnectPolicy,
};
pub use liveness::{LivenessConfig, LivenessMonitor};
pub use registry::Subscription;
pub use types::{ConnectionState, Envelope, Error, TypeFilter, event_type};
