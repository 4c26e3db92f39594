//! Wire framing and message shapes for the remote endpoint (spec §4.4).
//!
//! Grounded on the teacher's tagged-enum internal protocol
//! (`protocol/messages.rs`'s `ProtocolCommand`/`ProtocolResponse`), but
//! carries this crate's own six-operation contract instead of the teacher's
//! list/write/read/commit phases, and is framed as length-prefixed `bincode`
//! rather than newline-delimited JSON5, since this crate's ambient stack
//! already standardizes on `bincode` for on-disk persistence (`fs::cache`).
//! Every frame is a 4-byte little-endian length prefix followed by that many
//! bytes of `bincode`-encoded payload.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Configuration;
use crate::error::{Result, SyncError};
use crate::fs::entry::Entry;
use crate::fs::reconcile::Change;
use crate::transfer::{RsyncOperation, Signature};

/// Handshake parameters and every subsequent request a client may send a
/// remote endpoint server (spec §4.4 "initialize", §4.2 operations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
	/// Sent once, first, over a freshly dialed connection.
	Initialize { session_id: String, version: u32, root: String, configuration: Configuration, alpha: bool },
	Poll,
	CancelPoll,
	/// `base_signature` is the client's signature of its deterministically
	/// encoded ancestor bytes (spec §4.4 "Client marshals the ancestor
	/// deterministically to bytes, computes a signature of those bytes");
	/// the server uses it only to compute `snapshot_delta`, never to read
	/// the ancestor itself.
	Scan { base_signature: Signature, force_full: bool },
	Stage { paths: Vec<String>, digests: Vec<Vec<u8>> },
	/// One path's reconstruction operations, sent in the same order `Stage`
	/// or `Supply` listed that endpoint's `filtered_paths`/`paths`.
	SupplyPush { path: String, ops: Vec<RsyncOperation> },
	SupplyFinish,
	Supply { paths: Vec<String>, signatures: Vec<Signature> },
	Transition { transitions: Vec<Change> },
	Shutdown,
}

/// Every reply a remote endpoint server may send back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
	Initialized,
	/// A change event fired, `CancelPoll` was honored, or the connection is
	/// being torn down (spec §4.2 op 1 "spurious wakeups are allowed").
	Polled,
	/// `snapshot_delta` reconstructs the fresh snapshot's deterministically
	/// encoded bytes when applied against the client's own ancestor bytes
	/// (spec §4.4 "so only *changes* traverse the wire").
	Scanned { snapshot_delta: Vec<RsyncOperation>, preserves_executability: bool },
	/// `filtered_paths`/`signatures` per spec §4.2 op 3. `has_receiver` is
	/// false iff `filtered_paths` is empty, mirroring
	/// [`StageOutcome::receiver`](crate::endpoint::StageOutcome::receiver).
	Staged { filtered_paths: Vec<String>, signatures: Vec<Signature>, has_receiver: bool },
	SupplyPushed,
	Supplied,
	/// Server-initiated, sent in reply to a `Supply` request: one path's
	/// reconstruction operations, pushed server-to-client (spec §4.4
	/// "server immediately writes reconstruction operations into the
	/// channel" for a remote *source* endpoint).
	SuppliedPush { path: String, ops: Vec<RsyncOperation> },
	SupplyComplete,
	Transitioned { results: Vec<(String, Option<Entry>)>, problems: Vec<(String, String)>, missing_files: bool },
	ShutDown,
	/// Carries a rendered [`SyncError`] message plus whether it was a
	/// try-again endpoint error (spec §4.2 `tryAgainFlag`).
	Failed { message: String, try_again: bool },
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
	let payload = bincode::serialize(value).map_err(|e| SyncError::Wire { message: e.to_string() })?;
	let len = payload.len() as u32;
	writer.write_all(&len.to_le_bytes()).await.map_err(|e| SyncError::io("wire: write length", e))?;
	writer.write_all(&payload).await.map_err(|e| SyncError::io("wire: write payload", e))?;
	writer.flush().await.map_err(|e| SyncError::io("wire: flush", e))?;
	Ok(())
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean EOF at a
/// frame boundary (the other side closed the connection).
pub async fn read_frame<R: AsyncRead + Unpin, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<Option<T>> {
	let mut len_buf = [0u8; 4];
	match reader.read_exact(&mut len_buf).await {
		Ok(()) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(SyncError::io("wire: read length", e)),
	}
	let len = u32::from_le_bytes(len_buf) as usize;
	const MAX_FRAME_BYTES: usize = 1 << 30;
	if len > MAX_FRAME_BYTES {
		return Err(SyncError::Wire { message: format!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit") });
	}
	let mut payload = vec![0u8; len];
	reader.read_exact(&mut payload).await.map_err(|e| SyncError::io("wire: read payload", e))?;
	let value = bincode::deserialize(&payload).map_err(|e| SyncError::Wire { message: e.to_string() })?;
	Ok(Some(value))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn frame_round_trips_through_an_in_memory_pipe() {
		let (mut client, mut server) = tokio::io::duplex(4096);
		let request = Request::Scan { base_signature: Signature::default(), force_full: true };
		write_frame(&mut client, &request).await.unwrap();
		let received: Request = read_frame(&mut server).await.unwrap().unwrap();
		match received {
			Request::Scan { force_full, .. } => assert!(force_full),
			_ => panic!("unexpected variant"),
		}
	}

	#[tokio::test]
	async fn read_frame_on_clean_close_returns_none() {
		let (client, mut server) = tokio::io::duplex(4096);
		drop(client);
		let result: Option<Request> = read_frame(&mut server).await.unwrap();
		assert!(result.is_none());
	}
}

// vim: ts=4
