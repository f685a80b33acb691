use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

pub struct Logger;

impl Logger {
    /// Install the global subscriber. `log_level` follows the bundler option:
    /// 0 = off, 1 = errors, 2 = warnings, 3 = info, anything above = debug.
    /// `RUST_LOG` takes precedence when set.
    pub fn init(log_level: u8) {
        let directive = match log_level {
            0 => "kiln=off",
            1 => "kiln=error",
            2 => "kiln=warn",
            3 => "kiln=info",
            _ => "kiln=debug",
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

        // A second init (tests, embedding) keeps the first subscriber
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }

    pub fn build_start(entry: &str, out_dir: &str) {
        info!("Entry: {}", entry);
        info!("Output: {}", out_dir);
    }

    pub fn loading_asset(name: &str) {
        debug!("Loading asset: {}", name);
    }

    pub fn cache_hit(name: &str) {
        debug!("Cache hit: {}", name);
    }

    pub fn pass_complete(assets: usize, bundles: usize, build_time: std::time::Duration) {
        info!(
            "Pass complete: {} assets in {} bundles ({:.2?})",
            assets, bundles, build_time
        );
    }

    pub fn info(msg: &str) {
        info!("{}", msg);
    }

    pub fn debug(msg: &str) {
        debug!("{}", msg);
    }

    pub fn error(msg: &str) {
        error!("{}", msg);
    }

    pub fn warn(msg: &str) {
        warn!("{}", msg);
    }
}

pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    pub fn start(name: &str) -> Self {
        debug!("Starting: {}", name);
        Self {
            start: Instant::now(),
            name: name.to_string(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!("Completed: {} in {:.2?}", self.name, self.elapsed());
    }
}
