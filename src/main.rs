//! IndriyaIO - sensor broker daemon
//!
//! One privileged process sits between the sensor chip set (reached through
//! a pluggable backend) and many client processes. Clients subscribe
//! through the control surface; the hub arbitrates their sampling requests
//! into one hardware configuration per sensor and streams fixed-size
//! sample records back over per-client socketpair channels.

use indriya_io::backends::create_backend;
use indriya_io::config::Config;
use indriya_io::error::Result;
use indriya_io::hub::SensorHub;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Parse config path from command line arguments.
///
/// Supports:
/// - `indriya-io <path>` (positional)
/// - `indriya-io --config <path>` (flag-based)
/// - `indriya-io -c <path>` (short flag)
///
/// Defaults to `/etc/indriyaio.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    "/etc/indriyaio.toml".to_string()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("IndriyaIO v0.3.0 starting...");

    let config_path = parse_config_path();
    let config = match Config::from_file(&config_path) {
        Ok(config) => {
            log::info!("Using config: {}", config_path);
            config
        }
        Err(e) => {
            // Stay functional standalone: fall back to the simulated
            // backend when no config is deployed yet
            log::warn!("Config {} unusable ({}), using defaults", config_path, e);
            Config::defaults()
        }
    };

    log::info!("Backend: {}", config.backend.kind);
    let backend = create_backend(&config)?;
    let mut hub = SensorHub::new(backend, config);
    hub.start()?;

    // Set up shutdown signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| {
        indriya_io::Error::Other(format!("Error setting Ctrl-C handler: {}", e))
    })?;

    log::info!("IndriyaIO running. Press Ctrl-C to stop.");

    let mut last_stats = Instant::now();
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));

        if last_stats.elapsed().as_secs() >= 10 {
            let (delivered, dropped) = hub.delivery_stats();
            log::info!(
                "Clients: {}, samples delivered: {}, dropped: {}",
                hub.client_count(),
                delivered,
                dropped
            );
            last_stats = Instant::now();
        }
    }

    log::info!("Shutting down...");
    hub.stop();
    log::info!("IndriyaIO stopped");
    Ok(())
}
