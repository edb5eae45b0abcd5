use bookied::{Bookie, ServerConfig};
use env_logger::Env;
use log::{error, info};
use std::env;
use std::error::Error;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "bookie.conf.json".to_string());
    let config = ServerConfig::load(&config_path)?;
    info!(
        "event=bookie_starting config={config_path} port={}",
        config.bookie_port
    );

    // Without an external metadata store there is nothing authoritative to
    // garbage-collect ledgers against; only compaction runs.
    let bookie = match Bookie::start(config, None) {
        Ok(bookie) => bookie,
        Err(err) => {
            error!("event=bookie_start_failed error={err}");
            return Err(err.into());
        }
    };
    if let Some(addr) = bookie.local_addr() {
        info!("event=bookie_serving addr={addr}");
    }

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
