#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use sala_domain::ConnId;
use sala_protocol::ServerEvent;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Fan-out hub that routes outbound events to registered connections.
///
/// The relay resolves target connections from the roster under its own
/// lock and hands them to the hub; the hub itself only knows about
/// connection handles and their outbound queues.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued events per connection.
	pub queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a connection and obtain its outbound event stream.
	pub async fn register(&self, conn: ConnId) -> mpsc::Receiver<ServerEvent> {
		let (tx, rx) = mpsc::channel(self.cfg.queue_capacity);

		let mut inner = self.inner.lock().await;
		prune_closed(&mut inner);
		inner.conns.insert(conn, tx);

		if self.cfg.debug_logs {
			debug!(conn = %conn, total = inner.conns.len(), "room hub: registered");
		}

		rx
	}

	/// Drop a connection's outbound queue, closing its event stream.
	pub async fn unregister(&self, conn: ConnId) {
		let mut inner = self.inner.lock().await;
		inner.conns.remove(&conn);
	}

	/// Send one event to one connection. Returns false if the
	/// connection is gone or its queue is full (the event is dropped).
	pub async fn send_to(&self, conn: ConnId, event: ServerEvent) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(tx) = inner.conns.get(&conn) else {
			return false;
		};

		match tx.try_send(event) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("sala_server_events_dropped_total").increment(1);

				if self.cfg.debug_logs {
					debug!(conn = %conn, "room hub: dropped event, queue full");
				}
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				inner.conns.remove(&conn);
				false
			}
		}
	}

	/// Fan an event out to a set of connections.
	pub async fn broadcast(&self, targets: &[ConnId], event: ServerEvent) {
		let mut inner = self.inner.lock().await;
		let mut dropped: u64 = 0;
		let mut closed: Vec<ConnId> = Vec::new();

		for conn in targets {
			let Some(tx) = inner.conns.get(conn) else {
				continue;
			};

			match tx.try_send(event.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped += 1;
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					closed.push(*conn);
				}
			}
		}

		for conn in closed {
			inner.conns.remove(&conn);
		}

		if dropped > 0 {
			metrics::counter!("sala_server_events_dropped_total").increment(dropped);

			if self.cfg.debug_logs {
				debug!(dropped, "room hub: dropped events due to full queues");
			}
		}
	}

	/// Number of live registered connections.
	pub async fn connection_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.conns.values().filter(|tx| !tx.is_closed()).count()
	}
}

#[derive(Debug, Default)]
struct Inner {
	conns: HashMap<ConnId, mpsc::Sender<ServerEvent>>,
}

fn prune_closed(inner: &mut Inner) {
	inner.conns.retain(|_, tx| !tx.is_closed());
}
