//! Remote endpoint client (spec §4.4): drives the [`Endpoint`] contract by
//! framing requests to, and responses from, a peer reached over whatever
//! transport [`crate::dial`] established.
//!
//! Grounded on the teacher's `protocol/v3.rs` (`ProtocolV3`), which holds
//! its stdin/stdout halves each behind their own `Arc<Mutex<..>>` so a
//! `close()`/cancellation request can be written while a read is still
//! pending — the same shape this client uses for [`RemoteEndpointClient::poll`]
//! and, independently, for the [`RemoteStageReceiver`] it hands back from
//! `stage()`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use super::wire::{read_frame, write_frame, Request, Response};
use crate::cancel::CancellationToken;
use crate::endpoint::{Endpoint, EndpointParams, Receiver, ScanOutcome, StageOutcome, TransitionOutcome};
use crate::error::{Result, SyncError};
use crate::fs::entry::Entry;
use crate::fs::reconcile::{Change, Problem};
use crate::fs::transition::TransitionResult;
use crate::transfer::{self, RsyncOperation, Signature};

const STAGE: &str = "remote endpoint";

/// Client half of the remote endpoint protocol, generic over the
/// transport's read/write halves so it works equally over an SSH-spawned
/// child process's stdio or an in-process duplex stream (tests).
pub struct RemoteEndpointClient<W, R> {
	writer: Arc<Mutex<W>>,
	reader: Arc<Mutex<R>>,
}

impl<W, R> RemoteEndpointClient<W, R>
where
	W: AsyncWrite + Unpin + Send + 'static,
	R: AsyncRead + Unpin + Send + 'static,
{
	/// Perform the handshake (spec §4.4 `initialize`) and return a ready
	/// client.
	pub async fn connect(mut writer: W, mut reader: R, params: EndpointParams) -> Result<Self> {
		write_frame(
			&mut writer,
			&Request::Initialize {
				session_id: params.session_id,
				version: params.version,
				root: params.root,
				configuration: params.configuration,
				alpha: params.alpha,
			},
		)
		.await?;
		match read_frame::<_, Response>(&mut reader).await? {
			Some(Response::Initialized) => {
				Ok(RemoteEndpointClient { writer: Arc::new(Mutex::new(writer)), reader: Arc::new(Mutex::new(reader)) })
			}
			Some(Response::Failed { message, .. }) => {
				Err(SyncError::endpoint(STAGE, format!("unable to create remote endpoint: remote error: {message}")))
			}
			Some(_) => Err(SyncError::Wire { message: "unexpected response to initialize".to_string() }),
			None => Err(SyncError::endpoint(STAGE, "connection closed during handshake")),
		}
	}

	async fn send(&self, request: &Request) -> Result<()> {
		let mut writer = self.writer.lock().await;
		write_frame(&mut *writer, request).await
	}

	async fn recv(&self) -> Result<Response> {
		let mut reader = self.reader.lock().await;
		match read_frame::<_, Response>(&mut *reader).await? {
			Some(response) => Ok(response),
			None => Err(SyncError::endpoint(STAGE, "connection closed while awaiting response")),
		}
	}

	fn map_failure(response: Response) -> SyncError {
		match response {
			Response::Failed { message, try_again: true } => SyncError::endpoint_try_again(STAGE, message),
			Response::Failed { message, try_again: false } => SyncError::endpoint(STAGE, message),
			_ => SyncError::Wire { message: "unexpected response variant".to_string() },
		}
	}
}

#[async_trait]
impl<W, R> Endpoint for RemoteEndpointClient<W, R>
where
	W: AsyncWrite + Unpin + Send + 'static,
	R: AsyncRead + Unpin + Send + 'static,
{
	async fn poll(&self, cancel: CancellationToken) -> Result<()> {
		self.send(&Request::Poll).await?;
		tokio::select! {
			_ = cancel.cancelled() => {
				self.send(&Request::CancelPoll).await?;
				let _ = self.recv().await;
				Ok(())
			}
			response = self.recv() => match response? {
				Response::Polled => Ok(()),
				other => Err(Self::map_failure(other)),
			},
		}
	}

	async fn scan(&self, ancestor: &Entry, force_full: bool) -> Result<ScanOutcome> {
		// Spec §4.4 "Scan protocol": marshal the ancestor deterministically,
		// send only its signature, then patch those same bytes with
		// whatever delta the server computes against them -- the unchanged
		// majority of a snapshot never crosses the wire.
		let ancestor_bytes = ancestor.encode_deterministic();
		let base_signature = transfer::compute_signature(&ancestor_bytes);
		self.send(&Request::Scan { base_signature, force_full }).await?;
		match self.recv().await? {
			Response::Scanned { snapshot_delta, preserves_executability } => {
				let mut writer = transfer::DeltaWriter::new(ancestor_bytes, Vec::new());
				for op in &snapshot_delta {
					writer.apply(op).map_err(|e| SyncError::io("remote scan: apply delta", e))?;
				}
				let snapshot = Entry::decode_deterministic(&writer.into_inner())
					.map_err(|e| SyncError::Wire { message: format!("scan response decode failure: {e}") })?;
				snapshot.validate().map_err(|e| SyncError::endpoint(STAGE, e.to_string()))?;
				Ok(ScanOutcome { snapshot, preserves_executability })
			}
			other => Err(Self::map_failure(other)),
		}
	}

	async fn stage(&self, paths: &[String], digests: &[Vec<u8>]) -> Result<StageOutcome> {
		self.send(&Request::Stage { paths: paths.to_vec(), digests: digests.to_vec() }).await?;
		match self.recv().await? {
			Response::Staged { filtered_paths, signatures, has_receiver } => {
				let receiver: Option<Box<dyn Receiver>> = if has_receiver {
					Some(Box::new(RemoteStageReceiver {
						writer: Arc::clone(&self.writer),
						reader: Arc::clone(&self.reader),
					}))
				} else {
					None
				};
				Ok(StageOutcome { filtered_paths, signatures, receiver })
			}
			other => Err(Self::map_failure(other)),
		}
	}

	async fn supply(
		&self,
		paths: &[String],
		signatures: &[Signature],
		mut receiver: Box<dyn Receiver>,
	) -> Result<()> {
		self.send(&Request::Supply { paths: paths.to_vec(), signatures: signatures.to_vec() }).await?;
		loop {
			match self.recv().await? {
				Response::SuppliedPush { path, ops } => receiver.receive(&path, ops).await?,
				Response::SupplyComplete => return receiver.finish().await,
				other => return Err(Self::map_failure(other)),
			}
		}
	}

	async fn transition(&self, transitions: &[Change]) -> Result<TransitionOutcome> {
		self.send(&Request::Transition { transitions: transitions.to_vec() }).await?;
		match self.recv().await? {
			Response::Transitioned { results, problems, missing_files } => Ok(TransitionOutcome {
				results: results.into_iter().map(|(path, new)| TransitionResult { path, new }).collect(),
				problems: problems.into_iter().map(|(path, error)| Problem { path, error }).collect(),
				missing_files,
			}),
			other => Err(Self::map_failure(other)),
		}
	}

	async fn shutdown(&self) -> Result<()> {
		self.send(&Request::Shutdown).await?;
		match self.recv().await {
			Ok(Response::ShutDown) => Ok(()),
			_ => Ok(()),
		}
	}
}

/// Receiver returned by [`RemoteEndpointClient::stage`] when the server
/// reported filtered paths still needing content: each `receive` call
/// forwards one path's operations over the same wire as a `SupplyPush`
/// request, so the server (which is physically staging) can write them
/// into its own [`Stager`](crate::stager::Stager) (spec §4.4 "operations
/// stream client to server").
struct RemoteStageReceiver<W, R> {
	writer: Arc<Mutex<W>>,
	reader: Arc<Mutex<R>>,
}

#[async_trait]
impl<W, R> Receiver for RemoteStageReceiver<W, R>
where
	W: AsyncWrite + Unpin + Send,
	R: AsyncRead + Unpin + Send,
{
	async fn receive(&mut self, path: &str, ops: Vec<RsyncOperation>) -> Result<()> {
		{
			let mut writer = self.writer.lock().await;
			write_frame(&mut *writer, &Request::SupplyPush { path: path.to_string(), ops }).await?;
		}
		let mut reader = self.reader.lock().await;
		match read_frame::<_, Response>(&mut *reader).await? {
			Some(Response::SupplyPushed) => Ok(()),
			Some(Response::Failed { message, try_again }) => {
				if try_again {
					Err(SyncError::endpoint_try_again(STAGE, message))
				} else {
					Err(SyncError::endpoint(STAGE, message))
				}
			}
			Some(_) => Err(SyncError::Wire { message: "unexpected response to supply push".to_string() }),
			None => Err(SyncError::endpoint(STAGE, "connection closed while staging")),
		}
	}

	async fn finish(self: Box<Self>) -> Result<()> {
		{
			let mut writer = self.writer.lock().await;
			write_frame(&mut *writer, &Request::SupplyFinish).await?;
		}
		let mut reader = self.reader.lock().await;
		match read_frame::<_, Response>(&mut *reader).await? {
			Some(Response::Supplied) => Ok(()),
			Some(Response::Failed { message, try_again }) => {
				if try_again {
					Err(SyncError::endpoint_try_again(STAGE, message))
				} else {
					Err(SyncError::endpoint(STAGE, message))
				}
			}
			Some(_) => Err(SyncError::Wire { message: "unexpected response to supply finish".to_string() }),
			None => Err(SyncError::endpoint(STAGE, "connection closed while staging")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Configuration;

	fn params() -> EndpointParams {
		EndpointParams {
			session_id: "s1".to_string(),
			version: 1,
			root: "/tmp".to_string(),
			configuration: Configuration::default(),
			alpha: true,
		}
	}

	#[tokio::test]
	async fn connect_succeeds_and_completes_handshake() {
		let (client_stream, mut server_stream) = tokio::io::duplex(8192);
		let (client_read, client_write) = tokio::io::split(client_stream);
		tokio::spawn(async move {
			let _req: Request = read_frame(&mut server_stream).await.unwrap().unwrap();
			write_frame(&mut server_stream, &Response::Initialized).await.unwrap();
		});
		RemoteEndpointClient::connect(client_write, client_read, params()).await.unwrap();
	}

	#[tokio::test]
	async fn connect_fails_on_handshake_error_response() {
		let (client_stream, mut server_stream) = tokio::io::duplex(8192);
		let (client_read, client_write) = tokio::io::split(client_stream);
		tokio::spawn(async move {
			let _req: Request = read_frame(&mut server_stream).await.unwrap().unwrap();
			write_frame(
				&mut server_stream,
				&Response::Failed {
					message: "invalid initialization request: empty root path".to_string(),
					try_again: false,
				},
			)
			.await
			.unwrap();
		});
		let result = RemoteEndpointClient::connect(client_write, client_read, params()).await;
		let err = result.unwrap_err();
		assert_eq!(
			err.to_string(),
			"remote endpoint: unable to create remote endpoint: remote error: invalid initialization request: empty root path"
		);
	}

	#[tokio::test]
	async fn scan_round_trips_a_snapshot_via_delta_against_the_ancestor() {
		let (client_stream, mut server_stream) = tokio::io::duplex(8192);
		let (client_read, client_write) = tokio::io::split(client_stream);

		let ancestor = crate::fs::entry::empty_directory();
		let mut fresh_contents = std::collections::BTreeMap::new();
		fresh_contents.insert("f".to_string(), crate::fs::entry::Entry::File { executable: false, digest: vec![1, 2, 3] });
		let fresh = crate::fs::entry::Entry::Directory { contents: fresh_contents };
		let fresh_bytes = fresh.encode_deterministic();

		tokio::spawn(async move {
			let _req: Request = read_frame(&mut server_stream).await.unwrap().unwrap();
			write_frame(&mut server_stream, &Response::Initialized).await.unwrap();
			let req: Request = read_frame(&mut server_stream).await.unwrap().unwrap();
			let base_signature = match req {
				Request::Scan { base_signature, force_full: true } => base_signature,
				_ => panic!("unexpected request"),
			};
			let snapshot_delta = crate::transfer::compute_delta(&base_signature, &fresh_bytes);
			write_frame(&mut server_stream, &Response::Scanned { snapshot_delta, preserves_executability: true }).await.unwrap();
		});
		let client = RemoteEndpointClient::connect(client_write, client_read, params()).await.unwrap();
		let outcome = client.scan(&ancestor, true).await.unwrap();
		assert!(outcome.preserves_executability);
		assert_eq!(outcome.snapshot, fresh);
	}
}

// vim: ts=4
