//! Remote endpoint server (spec §4.4, §4.5 dial handler's "serve" side):
//! reads [`Request`] frames off a transport and drives a local
//! [`LocalEndpoint`], one connection per session/side.
//!
//! Grounded on the teacher's `serve.rs` main command loop, generalized from
//! its fixed LIST/WRITE/READ/COMMIT phase machine to this crate's six
//! uniform endpoint operations. `Poll` is spawned onto its own task so a
//! `CancelPoll` frame arriving on the same connection can still be read and
//! acted on while the poll is outstanding (spec §4.2 op 1 "cancel ...
//! without waiting for an actual change").

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use super::wire::{read_frame, write_frame, Request, Response};
use crate::cancel::CancellationToken;
use crate::config::{Configuration, ConfigurationSource};
use crate::endpoint::local::LocalEndpoint;
use crate::endpoint::{Endpoint, Receiver};
use crate::error::{Result, SyncError};
use crate::paths::Paths;
use crate::session::{Side, SESSION_RECORD_VERSION};
use crate::transfer::RsyncOperation;

fn failure_response(error: SyncError) -> Response {
	Response::Failed { message: error.to_string(), try_again: error.is_try_again() }
}

/// Validate an `Initialize` request under the session-record validation
/// rules (spec §4.4 "Server validates: non-empty session, supported
/// version, non-empty root, valid configuration under the session-record
/// validation rules"). Boundary scenario 6 pins the exact message for an
/// empty root.
fn validate_initialize(
	session_id: &str,
	version: u32,
	root: &str,
	configuration: &Configuration,
) -> std::result::Result<(), String> {
	if session_id.is_empty() {
		return Err("invalid initialization request: empty session identifier".to_string());
	}
	if version != SESSION_RECORD_VERSION {
		return Err(format!("invalid initialization request: unsupported version {version}"));
	}
	if root.is_empty() {
		return Err("invalid initialization request: empty root path".to_string());
	}
	configuration
		.validate(ConfigurationSource::File)
		.map_err(|e| format!("invalid initialization request: invalid configuration: {e}"))
}

/// Run one server connection to completion. Returns once the client sends
/// `Shutdown` or closes the transport. `paths` resolves this host's own
/// per-user data directory (spec §6) — independent of whatever directory
/// structure the dialing side uses.
pub async fn serve<R, W>(mut reader: R, writer: W, paths: Paths) -> Result<()>
where
	R: AsyncRead + Unpin + Send,
	W: AsyncWrite + Unpin + Send + 'static,
{
	let writer = Arc::new(Mutex::new(writer));

	let (session_id, version, root, configuration, alpha) = match read_frame::<_, Request>(&mut reader).await? {
		Some(Request::Initialize { session_id, version, root, configuration, alpha }) => {
			(session_id, version, root, configuration, alpha)
		}
		Some(_) => return Err(SyncError::Wire { message: "expected Initialize as first frame".to_string() }),
		None => return Err(SyncError::endpoint("remote endpoint server", "connection closed before handshake")),
	};

	if let Err(message) = validate_initialize(&session_id, version, &root, &configuration) {
		let mut w = writer.lock().await;
		write_frame(&mut *w, &Response::Failed { message, try_again: false }).await?;
		return Ok(());
	}

	let side = if alpha { Side::Alpha } else { Side::Beta };
	let resolved = configuration.resolve_defaults(version);
	let endpoint = match LocalEndpoint::new(
		root.into(),
		&paths.cache_path(&session_id, side),
		paths.staging_root(&session_id, side),
		&resolved,
	) {
		Ok(endpoint) => Arc::new(endpoint),
		Err(e) => {
			let mut w = writer.lock().await;
			write_frame(&mut *w, &failure_response(e)).await?;
			return Ok(());
		}
	};

	{
		let mut w = writer.lock().await;
		write_frame(&mut *w, &Response::Initialized).await?;
	}

	let mut stage_receiver: Option<Box<dyn Receiver>> = None;
	let poll_cancel: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));

	loop {
		let request = match read_frame::<_, Request>(&mut reader).await? {
			Some(request) => request,
			None => return Ok(()),
		};

		match request {
			Request::Initialize { .. } => {
				return Err(SyncError::Wire { message: "unexpected second Initialize".to_string() });
			}

			Request::Poll => {
				let token = CancellationToken::new();
				*poll_cancel.lock().await = Some(token.clone());
				let endpoint = Arc::clone(&endpoint);
				let writer = Arc::clone(&writer);
				let poll_cancel = Arc::clone(&poll_cancel);
				tokio::spawn(async move {
					let result = endpoint.poll(token).await;
					*poll_cancel.lock().await = None;
					let response = match result {
						Ok(()) => Response::Polled,
						Err(e) => failure_response(e),
					};
					let mut w = writer.lock().await;
					let _ = write_frame(&mut *w, &response).await;
				});
			}

			Request::CancelPoll => {
				if let Some(token) = poll_cancel.lock().await.clone() {
					token.cancel();
				}
			}

			Request::Scan { base_signature, force_full } => {
				// The server never sees the client's ancestor tree itself
				// (spec §4.4): `base_signature` is enough to compute a delta
				// against the freshly scanned snapshot's encoded bytes.
				let ancestor = crate::fs::entry::empty_directory();
				let response = match endpoint.scan(&ancestor, force_full).await {
					Ok(outcome) => {
						let snapshot_bytes = outcome.snapshot.encode_deterministic();
						let snapshot_delta = crate::transfer::compute_delta(&base_signature, &snapshot_bytes);
						Response::Scanned { snapshot_delta, preserves_executability: outcome.preserves_executability }
					}
					Err(e) => failure_response(e),
				};
				let mut w = writer.lock().await;
				write_frame(&mut *w, &response).await?;
			}

			Request::Stage { paths: request_paths, digests } => {
				let response = match endpoint.stage(&request_paths, &digests).await {
					Ok(outcome) => {
						let has_receiver = outcome.receiver.is_some();
						stage_receiver = outcome.receiver;
						Response::Staged { filtered_paths: outcome.filtered_paths, signatures: outcome.signatures, has_receiver }
					}
					Err(e) => failure_response(e),
				};
				let mut w = writer.lock().await;
				write_frame(&mut *w, &response).await?;
			}

			Request::SupplyPush { path, ops } => {
				let response = match stage_receiver.as_mut() {
					Some(receiver) => match receiver.receive(&path, ops).await {
						Ok(()) => Response::SupplyPushed,
						Err(e) => failure_response(e),
					},
					None => Response::Failed { message: "no stage in progress".to_string(), try_again: false },
				};
				let mut w = writer.lock().await;
				write_frame(&mut *w, &response).await?;
			}

			Request::SupplyFinish => {
				let response = match stage_receiver.take() {
					Some(receiver) => match receiver.finish().await {
						Ok(()) => Response::Supplied,
						Err(e) => failure_response(e),
					},
					None => Response::Failed { message: "no stage in progress".to_string(), try_again: false },
				};
				let mut w = writer.lock().await;
				write_frame(&mut *w, &response).await?;
			}

			Request::Supply { paths: request_paths, signatures } => {
				let adapter = WireSupplyReceiver { writer: Arc::clone(&writer) };
				if let Err(e) = endpoint.supply(&request_paths, &signatures, Box::new(adapter)).await {
					let mut w = writer.lock().await;
					write_frame(&mut *w, &failure_response(e)).await?;
				}
			}

			Request::Transition { transitions } => {
				let response = match endpoint.transition(&transitions).await {
					Ok(outcome) => Response::Transitioned {
						results: outcome.results.into_iter().map(|r| (r.path, r.new)).collect(),
						problems: outcome.problems.into_iter().map(|p| (p.path, p.error)).collect(),
						missing_files: outcome.missing_files,
					},
					Err(e) => failure_response(e),
				};
				let mut w = writer.lock().await;
				write_frame(&mut *w, &response).await?;
			}

			Request::Shutdown => {
				let response = match endpoint.shutdown().await {
					Ok(()) => Response::ShutDown,
					Err(e) => failure_response(e),
				};
				let mut w = writer.lock().await;
				write_frame(&mut *w, &response).await?;
				return Ok(());
			}
		}
	}
}

/// Adapter handed to [`LocalEndpoint::supply`] when this server is acting as
/// the content source: each reconstruction op is forwarded to the client as
/// a `SuppliedPush` frame rather than written to a local stager.
struct WireSupplyReceiver<W> {
	writer: Arc<Mutex<W>>,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Receiver for WireSupplyReceiver<W> {
	async fn receive(&mut self, path: &str, ops: Vec<RsyncOperation>) -> Result<()> {
		let mut w = self.writer.lock().await;
		write_frame(&mut *w, &Response::SuppliedPush { path: path.to_string(), ops }).await
	}

	async fn finish(self: Box<Self>) -> Result<()> {
		let mut w = self.writer.lock().await;
		write_frame(&mut *w, &Response::SupplyComplete).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Configuration;
	use tempfile::TempDir;

	#[tokio::test]
	async fn handshake_rejects_empty_root_with_the_mandated_message() {
		let data_dir = TempDir::new().unwrap();
		let paths = Paths::new(data_dir.path().to_path_buf());
		paths.ensure_directories().await.unwrap();

		let (server_stream, client_stream) = tokio::io::duplex(8192);
		let (server_read, server_write) = tokio::io::split(server_stream);
		let server = tokio::spawn(async move { serve(server_read, server_write, paths).await });

		let (mut client_read, mut client_write) = tokio::io::split(client_stream);
		write_frame(
			&mut client_write,
			&Request::Initialize {
				session_id: "sess".to_string(),
				version: 1,
				root: String::new(),
				configuration: Configuration::default(),
				alpha: true,
			},
		)
		.await
		.unwrap();
		let response: Response = read_frame(&mut client_read).await.unwrap().unwrap();
		match response {
			Response::Failed { message, try_again } => {
				assert_eq!(message, "invalid initialization request: empty root path");
				assert!(!try_again);
			}
			other => panic!("unexpected response: {other:?}"),
		}
		server.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn handshake_then_scan_round_trips() {
		let root = TempDir::new().unwrap();
		std::fs::write(root.path().join("a.txt"), b"hi").unwrap();
		let data_dir = TempDir::new().unwrap();
		let paths = Paths::new(data_dir.path().to_path_buf());
		paths.ensure_directories().await.unwrap();

		let (server_stream, client_stream) = tokio::io::duplex(8192);
		let (server_read, server_write) = tokio::io::split(server_stream);
		let server = tokio::spawn(async move { serve(server_read, server_write, paths).await });

		let (mut client_read, mut client_write) = tokio::io::split(client_stream);
		write_frame(
			&mut client_write,
			&Request::Initialize {
				session_id: "sess".to_string(),
				version: 1,
				root: root.path().to_string_lossy().into_owned(),
				configuration: Configuration { watch_mode: crate::config::WatchMode::NoWatch, ..Default::default() },
				alpha: true,
			},
		)
		.await
		.unwrap();
		let response: Response = read_frame(&mut client_read).await.unwrap().unwrap();
		assert!(matches!(response, Response::Initialized));

		let ancestor_bytes = crate::fs::entry::empty_directory().encode_deterministic();
		let base_signature = crate::transfer::compute_signature(&ancestor_bytes);
		write_frame(&mut client_write, &Request::Scan { base_signature, force_full: true }).await.unwrap();
		let response: Response = read_frame(&mut client_read).await.unwrap().unwrap();
		match response {
			Response::Scanned { snapshot_delta, .. } => {
				let mut writer = crate::transfer::DeltaWriter::new(ancestor_bytes, Vec::new());
				for op in &snapshot_delta {
					writer.apply(op).unwrap();
				}
				let snapshot = crate::fs::entry::Entry::decode_deterministic(&writer.into_inner()).unwrap();
				assert!(matches!(snapshot, crate::fs::entry::Entry::Directory { .. }));
			}
			other => panic!("unexpected response: {other:?}"),
		}

		write_frame(&mut client_write, &Request::Shutdown).await.unwrap();
		let response: Response = read_frame(&mut client_read).await.unwrap().unwrap();
		assert!(matches!(response, Response::ShutDown));
		server.await.unwrap().unwrap();
	}
}

// vim: ts=4
