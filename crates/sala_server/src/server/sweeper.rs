#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::server::relay::Relay;
use crate::util::time::unix_ms_now;

/// Inactivity sweeper timing.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
	pub period: Duration,
}

impl Default for SweeperConfig {
	fn default() -> Self {
		Self {
			period: Duration::from_secs(30),
		}
	}
}

/// Spawn the periodic inactivity sweep over the relay's sessions.
///
/// The eviction threshold lives in the relay's own config; the sweeper
/// only decides how often to ask.
pub fn spawn_sweeper(relay: Arc<Relay>, cfg: SweeperConfig) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(cfg.period);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		// The first tick fires immediately; skip it so a fresh start
		// never sweeps an empty registry.
		ticker.tick().await;

		loop {
			ticker.tick().await;
			let evicted = relay.sweep(unix_ms_now()).await;
			if evicted > 0 {
				debug!(evicted, "inactivity sweep finished");
			}
		}
	})
}
