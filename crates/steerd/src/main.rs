//! steerd — the steer control-plane daemon.
//!
//! Loads the switch configuration, connects to the master switch's
//! management daemon, installs the configured forwarding state and serves
//! the admin API until SIGINT/SIGTERM, then clears the managed tables.
//!
//! # Usage
//!
//! ```text
//! steerd --config switches.json --listen 127.0.0.1:5000
//! ```

mod daemon;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use steer_bfrt::{ConnectOptions, SubscribeOptions};
use steer_core::SwitchConfig;

#[derive(Parser, Debug)]
#[command(name = "steerd", about = "steer load-balancer control plane")]
struct Cli {
    /// Switch configuration file (JSON array, one entry per switch).
    #[arg(long)]
    config: PathBuf,

    /// Admin API listen address.
    #[arg(long, default_value = "127.0.0.1:5000")]
    listen: SocketAddr,

    /// Connection attempts before giving up.
    #[arg(long, default_value = "5")]
    connect_attempts: u32,

    /// Delay between connection attempts in milliseconds.
    #[arg(long, default_value = "1000")]
    retry_delay_ms: u64,

    /// Per-attempt subscribe acknowledgement timeout in milliseconds.
    #[arg(long, default_value = "1000")]
    subscribe_timeout_ms: u64,

    /// Subscribe attempts per connection.
    #[arg(long, default_value = "5")]
    subscribe_attempts: u32,

    /// Dataplane program to bind; overrides the config `name`.
    #[arg(long)]
    program: Option<String>,
}

impl Cli {
    fn connect_options(&self, switch: &SwitchConfig) -> ConnectOptions {
        let mut options = ConnectOptions::new(switch.addr.clone(), switch.client_id, switch.id);
        options.max_attempts = self.connect_attempts;
        options.retry_delay = Duration::from_millis(self.retry_delay_ms);
        options.subscribe = SubscribeOptions {
            attempts: self.subscribe_attempts,
            timeout: Duration::from_millis(self.subscribe_timeout_ms),
            ..SubscribeOptions::default()
        };
        options
    }

    /// Program to bind, `None` to take whatever the switch has loaded.
    fn program<'a>(&'a self, switch: &'a SwitchConfig) -> Option<&'a str> {
        self.program
            .as_deref()
            .or(Some(switch.name.as_str()))
            .filter(|name| !name.is_empty())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,steer=debug")),
        )
        .init();

    let cli = Cli::parse();
    daemon::run(&cli).await
}
