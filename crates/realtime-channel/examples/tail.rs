//! Connect to a realtime endpoint and print every envelope as JSON lines.
//!
//! ```sh
//! cargo run -p realtime-channel --example tail -- --url ws://localhost:8000/ws
//! ```
//!
//! Or configure through the environment:
//! ```sh
//! REALTIME_WS_URL=wss://api.example.com/ws cargo run -p realtime-channel --example tail \
//!     -- --campaign campaign-42 --ping-secs 30
//! ```
//!
//! Envelopes are printed to stdout (pipe to `jq` for formatting); logs go to
//! stderr and follow `RUST_LOG`.

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use realtime_channel::{
    Backoff, ChannelConfig, LivenessConfig, LivenessMonitor, RealtimeChannel, ReconnectPolicy,
    event_type,
};

#[derive(Parser)]
#[command(name = "tail", about = "Print live events from a realtime endpoint")]
struct Args {
    /// WebSocket endpoint
    #[arg(long, env = "REALTIME_WS_URL", default_value = "ws://localhost:8000/ws")]
    url: String,

    /// Only print envelopes of this type ("*" for all)
    #[arg(long, default_value = "*")]
    filter: String,

    /// Campaign to request live updates for once connected
    #[arg(long)]
    campaign: Option<String>,

    /// Automatic reconnect attempts after an unplanned close
    #[arg(long, env = "REALTIME_MAX_RECONNECT_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Delay before each reconnect attempt, in milliseconds
    #[arg(long, env = "REALTIME_RECONNECT_DELAY_MS", default_value_t = 3000)]
    delay_ms: u64,

    /// Double the delay per attempt, capped at this many milliseconds
    #[arg(long)]
    backoff_max_ms: Option<u64>,

    /// Ping interval in seconds (0 disables the liveness monitor)
    #[arg(long, default_value_t = 0)]
    ping_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let backoff = match args.backoff_max_ms {
        Some(ms) => Backoff::Exponential {
            max_delay: Duration::from_millis(ms),
        },
        None => Backoff::Fixed,
    };
    let config = ChannelConfig::new(args.url)?.with_reconnect(ReconnectPolicy {
        max_attempts: args.max_attempts,
        delay: Duration::from_millis(args.delay_ms),
        backoff,
    });

    let channel = RealtimeChannel::install(config)?;

    let _printer = channel.subscribe(args.filter, |env| match serde_json::to_string(env) {
        Ok(line) => println!("{line}"),
        Err(e) => eprintln!("unprintable envelope: {e}"),
    });

    if let Some(campaign) = args.campaign {
        let requester = channel.clone();
        let _follow = channel.subscribe(event_type::CONNECTION_STATUS, move |env| {
            if env.data["connected"] == true {
                requester.subscribe_campaign(&campaign);
            }
        });
    }

    let _monitor = (args.ping_secs > 0).then(|| {
        let interval = Duration::from_secs(args.ping_secs);
        LivenessMonitor::spawn(
            channel.clone(),
            LivenessConfig {
                interval,
                stale_after: interval * 2 + interval / 2,
                force_reconnect: true,
            },
        )
    });

    channel.connect();
    tokio::signal::ctrl_c().await?;
    channel.disconnect();
    // Give the driver a moment to send the close frame.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
