#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use sala_domain::{ConnId, Identity};
use sala_protocol::framing::DEFAULT_MAX_FRAME_SIZE;
use sala_protocol::{ClientEvent, ServerEvent, encode_frame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::relay::{Relay, RelayError, SendMeta};
use crate::util::time::unix_ms_now;

/// Drive one client connection end to end.
///
/// A reader task decodes inbound frames into a channel; the main loop
/// interleaves those client events with outbound events from the hub.
/// When the relay evicts this connection (replacement, kick, idle
/// sweep) its hub queue closes and the loop winds down through the
/// same disconnect path as a transport close.
pub async fn handle_connection(conn: ConnId, connection: quinn::Connection, relay: Arc<Relay>) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("sala_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("sala_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut event_send, mut event_recv) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<ClientEvent>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match event_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("stream read failed")),
			};

			metrics::counter!("sala_server_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match sala_protocol::decode_frame::<ClientEvent>(&buf, DEFAULT_MAX_FRAME_SIZE) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("sala_server_events_in_total").increment(1);

						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(sala_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("sala_server_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode inbound frame"));
					}
				}
			}
		}
	});

	let mut outbound = relay.hub().register(conn).await;

	// Set once a join succeeds; every later event acts as this identity.
	let mut identity: Option<Identity> = None;

	loop {
		tokio::select! {
			inbound = ctrl_rx.recv() => {
				let Some(event) = inbound else {
					debug!(conn = %conn, "client stream ended");
					break;
				};
				dispatch_event(conn, &relay, &mut identity, event).await;
			}
			out = outbound.recv() => {
				let Some(event) = out else {
					debug!(conn = %conn, "hub queue closed, evicting connection");
					break;
				};

				let terminal = matches!(
					event,
					ServerEvent::SessionReplaced | ServerEvent::Kicked { .. } | ServerEvent::InactivityDisconnect
				);

				let frame = encode_frame(&event, DEFAULT_MAX_FRAME_SIZE).context("encode outbound frame")?;
				if let Err(e) = event_send.write_all(&frame).await {
					debug!(conn = %conn, error = %e, "outbound write failed");
					break;
				}

				if terminal {
					info!(conn = %conn, "connection evicted");
					break;
				}
			}
		}
	}

	reader_task.abort();
	relay.hub().unregister(conn).await;
	relay.disconnect(conn, unix_ms_now()).await;

	let _ = event_send.finish();
	connection.close(0u32.into(), b"closed");

	Ok(())
}

async fn dispatch_event(conn: ConnId, relay: &Relay, identity: &mut Option<Identity>, event: ClientEvent) {
	let now_ms = unix_ms_now();

	match event {
		ClientEvent::Join { pin, identity: who } => match relay.join(&who, conn, &pin, now_ms).await {
			Ok(_room) => {
				*identity = Some(who);
			}
			Err(RelayError::RejectedJoin(reason)) => {
				debug!(conn = %conn, reason = reason.as_str(), "join rejected");
				relay.hub().send_to(conn, ServerEvent::JoinError { reason }).await;
			}
			Err(err) => {
				warn!(conn = %conn, error = %err, "join failed");
				relay.hub().send_to(conn, ServerEvent::Error { message: err.to_string() }).await;
			}
		},

		ClientEvent::Send {
			room_id,
			content,
			kind,
			file_name,
			message_id,
		} => {
			let Some(who) = identity.as_ref() else {
				relay
					.hub()
					.send_to(
						conn,
						ServerEvent::Error {
							message: "join a room before sending".to_string(),
						},
					)
					.await;
				return;
			};

			let meta = SendMeta { file_name, message_id };
			if let Err(err) = relay.send(who, conn, room_id, content, kind, meta, now_ms).await {
				report_failure(conn, relay, "send", err).await;
			}
		}

		ClientEvent::Edit {
			message_id,
			room_id,
			new_content,
		} => {
			let Some(who) = identity.as_ref() else {
				return;
			};
			if let Err(err) = relay.edit(who, conn, room_id, message_id, new_content).await {
				report_failure(conn, relay, "edit", err).await;
			}
		}

		ClientEvent::Delete { message_id, room_id } => {
			let Some(who) = identity.as_ref() else {
				return;
			};
			if let Err(err) = relay.delete(who, conn, room_id, message_id).await {
				report_failure(conn, relay, "delete", err).await;
			}
		}

		ClientEvent::Kick { room_id, target } => {
			let Some(who) = identity.as_ref() else {
				return;
			};
			if let Err(err) = relay.kick(who, conn, room_id, &target).await {
				report_failure(conn, relay, "kick", err).await;
			}
		}

		ClientEvent::ActivityPing => {
			if let Some(who) = identity.as_ref() {
				relay.touch_activity(who, now_ms).await;
			}
		}
	}
}

async fn report_failure(conn: ConnId, relay: &Relay, op: &'static str, err: RelayError) {
	match &err {
		RelayError::Persistence(cause) => {
			warn!(conn = %conn, op, error = %cause, "operation failed on persistence");
		}
		RelayError::Codec(cause) => {
			warn!(conn = %conn, op, error = %cause, "operation failed on codec");
		}
		other => {
			debug!(conn = %conn, op, error = %other, "operation rejected");
		}
	}

	relay
		.hub()
		.send_to(conn, ServerEvent::Error { message: err.to_string() })
		.await;
}
