//! The (consumed, narrowly implemented) differential-transfer primitive
//! (spec §1: "rsync-style block signatures/deltas; the core *uses* its
//! interface"), grounded on the teacher's content-defined chunking
//! (`chunk_tracker.rs`, `protocol/file_operations.rs`): a `rollsum::Bup`
//! rolling checksum finds chunk boundaries, `blake3` is the strong
//! per-chunk digest used both to identify chunks and to detect which ones
//! the other side can already supply from a prior version.

use std::collections::HashMap;
use std::io::Write;

use rollsum::Bup;
use serde::{Deserialize, Serialize};

/// Average chunk size is `2^CHUNK_BITS` bytes; matches the teacher's own
/// default (`chunking::CHUNK_BITS`).
pub const CHUNK_BITS: u32 = 16;
const MAX_CHUNK_SIZE: usize = (1 << CHUNK_BITS) * 4;

/// One content-defined chunk's position and strong hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
	pub offset: u64,
	pub size: u32,
	pub hash: [u8; 32],
}

/// A full-content signature: an ordered list of chunk boundaries and
/// hashes, computed by whichever side holds a candidate base version
/// (spec §4.4 "Client marshals the ancestor ... computes a signature").
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature {
	pub blocks: Vec<BlockSignature>,
}

/// One instruction for reconstructing new content from a base plus
/// freshly transmitted bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RsyncOperation {
	/// Reuse `size` bytes from the base content starting at `offset`.
	Copy { offset: u64, size: u32 },
	/// Literal bytes not present in the base content.
	Data(Vec<u8>),
}

/// Split `bytes` into content-defined chunks and hash each one.
pub fn compute_signature(bytes: &[u8]) -> Signature {
	let mut blocks = Vec::new();
	let mut remaining = bytes;
	let mut offset: u64 = 0;
	while !remaining.is_empty() {
		let window_end = remaining.len().min(MAX_CHUNK_SIZE);
		let mut bup = Bup::new_with_chunk_bits(CHUNK_BITS);
		let count = match bup.find_chunk_edge(&remaining[..window_end]) {
			Some((edge, _)) => edge,
			None => window_end,
		};
		let chunk = &remaining[..count];
		let hash = *blake3::hash(chunk).as_bytes();
		blocks.push(BlockSignature { offset, size: count as u32, hash });
		offset += count as u64;
		remaining = &remaining[count..];
	}
	Signature { blocks }
}

/// Compute the operations needed to reconstruct `new_bytes` given that the
/// receiver already holds content matching `base`. Chunks of `new_bytes`
/// whose strong hash matches a `base` chunk become `Copy` references into
/// the base; everything else is transmitted as literal `Data`.
pub fn compute_delta(base: &Signature, new_bytes: &[u8]) -> Vec<RsyncOperation> {
	let mut known: HashMap<[u8; 32], (u64, u32)> = HashMap::new();
	for block in &base.blocks {
		known.entry(block.hash).or_insert((block.offset, block.size));
	}

	let new_signature = compute_signature(new_bytes);
	let mut ops = Vec::with_capacity(new_signature.blocks.len());
	for block in &new_signature.blocks {
		if let Some(&(offset, size)) = known.get(&block.hash) {
			ops.push(RsyncOperation::Copy { offset, size });
		} else {
			let start = block.offset as usize;
			let end = start + block.size as usize;
			ops.push(RsyncOperation::Data(new_bytes[start..end].to_vec()));
		}
	}
	ops
}

/// Reconstructs content by applying a stream of [`RsyncOperation`]s against
/// an in-memory base, writing the result into an arbitrary [`Write`] sink
/// (spec §4.3 Supply target: the stager's [`Sink`](crate::stager::Sink)).
pub struct DeltaWriter<W: Write> {
	base: Vec<u8>,
	writer: W,
}

impl<W: Write> DeltaWriter<W> {
	pub fn new(base: Vec<u8>, writer: W) -> Self {
		DeltaWriter { base, writer }
	}

	pub fn apply(&mut self, op: &RsyncOperation) -> std::io::Result<()> {
		match op {
			RsyncOperation::Copy { offset, size } => {
				let start = *offset as usize;
				let end = start + *size as usize;
				self.writer.write_all(&self.base[start..end])
			}
			RsyncOperation::Data(bytes) => self.writer.write_all(bytes),
		}
	}

	pub fn into_inner(self) -> W {
		self.writer
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn delta_against_identical_content_is_all_copies() {
		let content = b"the quick brown fox jumps over the lazy dog".repeat(100);
		let base = compute_signature(&content);
		let ops = compute_delta(&base, &content);
		assert!(ops.iter().all(|op| matches!(op, RsyncOperation::Copy { .. })));
	}

	#[test]
	fn delta_against_empty_base_is_all_data() {
		let base = Signature::default();
		let content = b"brand new content".to_vec();
		let ops = compute_delta(&base, &content);
		assert!(ops.iter().all(|op| matches!(op, RsyncOperation::Data(_))));
	}

	#[test]
	fn apply_reconstructs_original_bytes() {
		let original = b"hello rsync world, this text repeats a little bit a little bit".to_vec();
		let base = compute_signature(&original);
		let modified = {
			let mut v = original.clone();
			v.extend_from_slice(b" and some new trailing content");
			v
		};
		let ops = compute_delta(&base, &modified);

		let mut writer = DeltaWriter::new(original.clone(), Vec::new());
		for op in &ops {
			writer.apply(op).unwrap();
		}
		assert_eq!(writer.into_inner(), modified);
	}
}

// vim: ts=4
