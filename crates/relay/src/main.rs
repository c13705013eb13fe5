use anyhow::Result;
use std::{env, path::PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_relay::{config, Relay};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path =
        PathBuf::from(env::var("RELAY_CONFIG").unwrap_or_else(|_| "relay.toml".to_string()));
    let cfg = config::load(&config_path)?;

    // ── Relay ───────────────────────────────────────────────────────
    let relay = Relay::start(&cfg);

    let mut report = cfg.relay.report_interval().map(|every| {
        // The connect path already sends the first request.
        let start = tokio::time::Instant::now() + every;
        let mut ticker = tokio::time::interval_at(start, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
    });
    if let Some(every) = cfg.relay.report_interval() {
        info!(every = ?every, "periodic measurement requests enabled");
    }

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("failed to listen for ctrl-c: {e}");
                }
                break;
            }
            _ = tick(&mut report) => {
                let devices = relay.all_measurements().await.len();
                info!(devices, state = %relay.connection_state(), "requesting measurements");
                relay.request_measurements();
            }
        }
    }

    info!("shutting down");
    relay.shutdown().await;
    Ok(())
}

/// Next tick of the optional ticker; never resolves when there is none.
async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}
