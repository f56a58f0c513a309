//! Chunk bookkeeping: where each FILE_DATA chunk lands and how much of a file has arrived.

use std::collections::BTreeSet;

use crate::protocol::CHUNK_SIZE;

/// Byte offset of chunk `seq` in the reassembled file.
pub fn chunk_offset(seq: u32, chunk_size: usize) -> u64 {
    u64::from(seq) * chunk_size as u64
}

/// Number of chunks needed for `total_len` bytes.
pub fn chunk_count(total_len: u64, chunk_size: usize) -> u64 {
    let size = chunk_size.max(1) as u64;
    total_len.div_ceil(size)
}

/// Where to write one received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub offset: u64,
    /// Bytes of the chunk to write; trailing bytes past the declared size are dropped.
    pub len: usize,
    /// Sequence already seen; the write is harmless but not counted twice.
    pub duplicate: bool,
}

/// Per-reception state: which sequences arrived and how many bytes they carried.
/// Placement is by sequence number, so arrival order does not matter.
#[derive(Debug, Clone)]
pub struct Reassembly {
    total_length: u64,
    chunk_size: usize,
    received: BTreeSet<u32>,
    received_bytes: u64,
}

impl Reassembly {
    pub fn new(total_length: u64) -> Self {
        Self::with_chunk_size(total_length, CHUNK_SIZE)
    }

    pub fn with_chunk_size(total_length: u64, chunk_size: usize) -> Self {
        Self {
            total_length,
            chunk_size: chunk_size.max(1),
            received: BTreeSet::new(),
            received_bytes: 0,
        }
    }

    /// Compute where chunk `seq` of `len` bytes goes and record it.
    pub fn place(&mut self, seq: u32, len: usize) -> Result<Placement, ChunkError> {
        let offset = chunk_offset(seq, self.chunk_size);
        if offset >= self.total_length {
            return Err(ChunkError::OutOfRange {
                seq,
                total: self.total_length,
            });
        }
        let len = (self.total_length - offset).min(len as u64) as usize;
        let duplicate = !self.received.insert(seq);
        if !duplicate {
            self.received_bytes += len as u64;
        }
        Ok(Placement {
            offset,
            len,
            duplicate,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn is_complete(&self) -> bool {
        self.received_bytes >= self.total_length
    }

    /// Sequences never received. Lost chunks are not re-requested; this is for reporting.
    pub fn missing(&self) -> Vec<u32> {
        let count = chunk_count(self.total_length, self.chunk_size);
        (0..count)
            .map(|s| s as u32)
            .filter(|s| !self.received.contains(s))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk {seq} lies beyond the declared size of {total} bytes")]
    OutOfRange { seq: u32, total: u64 },
}
