//! obsbus hub - TCP broker routing calls, events and presence between modules.

use clap::Parser;
use obsbus::comm::Hub;
use obsbus::TransportConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Message hub for obsbus modules.
#[derive(Parser, Debug)]
#[command(name = "obsbus-hub")]
#[command(about = "Route calls and events between obsbus modules")]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "OBSBUS_HUB_ADDR", default_value = "127.0.0.1:7420")]
    listen: SocketAddr,

    /// Maximum simultaneous module connections
    #[arg(long, default_value_t = 256)]
    max_connections: usize,

    /// Maximum frame size in bytes
    #[arg(long, default_value_t = 5 * 1024 * 1024)]
    max_frame_bytes: u32,

    /// Drop a module that stays silent this long (seconds)
    #[arg(long, default_value_t = 60)]
    read_timeout: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    obsbus::observability::init_tracing();

    let config = TransportConfig {
        hub_addr: args.listen.to_string(),
        max_connections: args.max_connections,
        max_frame_bytes: args.max_frame_bytes,
        ..TransportConfig::default()
    }
    .with_read_timeout(Duration::from_secs(args.read_timeout));
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let hub = Hub::bind(args.listen, config).await?;
        tracing::info!("obsbus hub listening on {}", hub.local_addr()?);

        let token = hub.shutdown_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
            token.cancel();
        });

        hub.serve().await?;
        tracing::info!("obsbus hub stopped");
        Ok::<_, Box<dyn std::error::Error>>(())
    })
}
