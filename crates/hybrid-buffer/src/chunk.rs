// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unit of transfer between the processing pipeline and the upstream
//! collector.
//!
//! A chunk is a batch of already-serialized log records with a sortable
//! string identifier. The identifier embeds a zero-padded timestamp and a
//! sequence number, so lexicographic filename order equals creation order
//! and the identifier doubles as the on-disk filename.
//!
//! A chunk's payload may be released from memory once it has been written
//! to disk. The one invariant every chunk upholds: the payload is never
//! absent while the chunk is also unpersisted, since that state would mean
//! the data is gone. The constructors and mutators below make that state
//! unrepresentable.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sortable chunk identifier, also used as the chunk's filename.
///
/// Format: `"{secs:010}.{nanos:09}.{seq:06}"`, zero-padded so that
/// lexicographic order equals generation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(String);

/// Fixed length of a well-formed chunk ID: 10 + 1 + 9 + 1 + 6.
const CHUNK_ID_LEN: usize = 27;

impl ChunkId {
    pub fn new(id: impl Into<String>) -> Self {
        ChunkId(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `name` looks like an identifier produced by
    /// [`ChunkIdGenerator`]. Used as the default filename predicate when
    /// scanning a queue directory, so a restart with a different naming
    /// convention does not pick up stale files.
    #[must_use]
    pub fn is_valid_name(name: &str) -> bool {
        if name.len() != CHUNK_ID_LEN {
            return false;
        }
        name.char_indices().all(|(i, c)| match i {
            10 | 20 => c == '.',
            _ => c.is_ascii_digit(),
        })
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Predicate deciding which filenames in a queue directory belong to the
/// current chunk-naming convention.
pub type ChunkIdMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// The matcher accepting [`ChunkIdGenerator`]-style identifiers.
#[must_use]
pub fn default_chunk_matcher() -> ChunkIdMatcher {
    Arc::new(ChunkId::is_valid_name)
}

/// Generates monotonically ordered chunk identifiers.
///
/// Identifiers embed the wall-clock generation time plus a process-wide
/// sequence number that breaks ties within one nanosecond tick.
#[derive(Debug, Default)]
pub struct ChunkIdGenerator {
    seq: AtomicU64,
}

impl ChunkIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ChunkId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        ChunkId(format!(
            "{:010}.{:09}.{:06}",
            now.as_secs(),
            now.subsec_nanos(),
            seq
        ))
    }
}

/// One forwarding unit: identifier, optional in-memory payload, and a flag
/// recording whether the payload has been durably written to disk.
#[derive(Debug)]
pub struct Chunk {
    id: ChunkId,
    payload: Option<Vec<u8>>,
    persisted: bool,
}

impl Chunk {
    /// A freshly produced chunk: payload in memory, nothing on disk yet.
    #[must_use]
    pub fn new(id: ChunkId, payload: Vec<u8>) -> Self {
        Chunk {
            id,
            payload: Some(payload),
            persisted: false,
        }
    }

    /// A reference to a chunk found on disk: no payload in memory.
    #[must_use]
    pub(crate) fn persisted_ref(id: ChunkId) -> Self {
        Chunk {
            id,
            payload: None,
            persisted: true,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.payload.is_some()
    }

    /// Marks the chunk persisted and releases the in-memory payload,
    /// returning the bytes that were written. Panics if the payload is
    /// already gone; releasing twice is a lifecycle bug.
    pub(crate) fn release_payload(&mut self) -> Vec<u8> {
        self.persisted = true;
        self.payload
            .take()
            .unwrap_or_else(|| panic!("chunk {} released with no payload", self.id))
    }

    /// Restores a payload read back from disk.
    pub(crate) fn restore_payload(&mut self, payload: Vec<u8>) {
        self.payload = Some(payload);
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_sortable_and_valid() {
        let generator = ChunkIdGenerator::new();
        let a = generator.next_id();
        let b = generator.next_id();
        let c = generator.next_id();

        assert!(ChunkId::is_valid_name(a.as_str()));
        assert!(ChunkId::is_valid_name(b.as_str()));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn valid_name_rejects_foreign_files() {
        assert!(!ChunkId::is_valid_name(""));
        assert!(!ChunkId::is_valid_name("chunk-000001"));
        assert!(!ChunkId::is_valid_name(".hybrid-buffer"));
        assert!(!ChunkId::is_valid_name("0000000000-000000000-000000"));
        // Right shape, wrong separator positions.
        assert!(!ChunkId::is_valid_name("00000000.00000000000.000000"));
        assert!(ChunkId::is_valid_name("1722800000.123456789.000001"));
    }

    #[test]
    fn new_chunk_is_loaded_and_unpersisted() {
        let chunk = Chunk::new(ChunkId::new("1722800000.000000000.000000"), b"abc".to_vec());
        assert!(chunk.is_loaded());
        assert!(!chunk.is_persisted());
        assert_eq!(chunk.payload(), Some(&b"abc"[..]));
    }

    #[test]
    fn persisted_ref_has_no_payload() {
        let chunk = Chunk::persisted_ref(ChunkId::new("1722800000.000000000.000000"));
        assert!(!chunk.is_loaded());
        assert!(chunk.is_persisted());
        assert_eq!(chunk.payload_len(), 0);
    }

    #[test]
    #[should_panic(expected = "released with no payload")]
    fn double_release_panics() {
        let mut chunk =
            Chunk::new(ChunkId::new("1722800000.000000000.000000"), b"abc".to_vec());
        chunk.release_payload();
        chunk.release_payload();
    }
}
