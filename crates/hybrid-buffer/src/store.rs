// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw per-chunk file I/O against one queue directory.
//!
//! Every buffer owns one subdirectory under the configured root. Files
//! inside are named by chunk ID and contain the raw chunk bytes, so a
//! directory listing in filename order is the recovery queue in creation
//! order.
//!
//! # Degraded mode
//!
//! A store without a usable directory is not an error: the buffer keeps
//! running memory-only and simply cannot persist. Every operation here
//! converts failures into a `bool` plus an I/O-error counter at the point
//! of occurrence; disk trouble never crosses this module's boundary as an
//! error value, and never takes the process down.
//!
//! # Directory naming
//!
//! The subdirectory name is the sanitized buffer ID plus the first eight
//! hex characters of its MD5, which keeps two IDs that sanitize to the same
//! string apart. The unsanitized ID is stored in the
//! `user.hybridbufferID` extended attribute so buffers are enumerated by
//! identifier, not by directory name, across restarts.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use md5::{Digest, Md5};
use tracing::{debug, warn};

use crate::chunk::{Chunk, ChunkId, ChunkIdMatcher};

/// Extended attribute on a queue directory holding the unsanitized buffer ID.
pub const BUFFER_ID_XATTR: &str = "user.hybridbufferID";

/// Reserved marker filename identifying a queue directory; ignored by scans.
pub const BUFFER_MARKER_FILE: &str = ".hybrid-buffer";

/// Builds the on-disk directory name for a buffer ID: sanitized ID plus an
/// 8-hex-char MD5 suffix.
#[must_use]
pub fn directory_name_for(buffer_id: &str) -> String {
    let sanitized: String = buffer_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = Md5::digest(buffer_id.as_bytes());
    let mut suffix = String::with_capacity(8);
    for byte in &digest[..4] {
        suffix.push_str(&format!("{byte:02x}"));
    }
    format!("{sanitized}.{suffix}")
}

/// Enumerates the buffer IDs that have queue directories under `root`.
///
/// IDs come from the `user.hybridbufferID` attribute; a directory missing
/// the attribute (foreign filesystem, older agent) falls back to its
/// directory name with a warning. Non-buffer directories (no marker file)
/// are skipped.
#[must_use]
pub fn list_buffer_ids(root: &Path) -> Vec<String> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(root = %root.display(), error = %e, "buffer root not readable");
            return Vec::new();
        }
    };

    let mut ids = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || !path.join(BUFFER_MARKER_FILE).exists() {
            continue;
        }
        match xattr::get(&path, BUFFER_ID_XATTR) {
            Ok(Some(raw)) => match String::from_utf8(raw) {
                Ok(id) => ids.push(id),
                Err(_) => warn!(dir = %path.display(), "buffer ID attribute is not UTF-8, skipping"),
            },
            Ok(None) | Err(_) => {
                warn!(
                    dir = %path.display(),
                    "buffer directory has no ID attribute, falling back to directory name"
                );
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    ids.push(name.to_string());
                }
            }
        }
    }
    ids.sort();
    ids
}

/// File store for one buffer's queue directory.
///
/// All byte/count accounting lives here; the quota check in [`unload`]
/// reads the same counter that [`on_recovered`] seeds after a restart, so
/// pre-crash chunks count against the quota from the first write.
///
/// [`unload`]: ChunkStore::unload
/// [`on_recovered`]: ChunkStore::on_recovered
#[derive(Debug)]
pub struct ChunkStore {
    dir: Option<PathBuf>,
    quota_bytes: u64,
    persisted_bytes: AtomicU64,
    persisted_chunks: AtomicU64,
    io_errors: AtomicU64,
}

impl ChunkStore {
    /// Opens (creating if needed) the queue directory for `buffer_id` under
    /// `root`. Any failure degrades to a store without a directory rather
    /// than erroring: the buffer still works, it just cannot persist.
    pub fn open(root: &Path, buffer_id: &str, quota_bytes: u64) -> Self {
        let dir = root.join(directory_name_for(buffer_id));
        match Self::prepare_directory(&dir, buffer_id) {
            Ok(()) => Self::with_dir(Some(dir), quota_bytes),
            Err(e) => {
                warn!(
                    dir = %dir.display(),
                    error = %e,
                    "cannot set up queue directory, running without persistence"
                );
                Self::with_dir(None, quota_bytes)
            }
        }
    }

    /// A store that never persists. Used when no root is configured.
    #[must_use]
    pub fn degraded(quota_bytes: u64) -> Self {
        Self::with_dir(None, quota_bytes)
    }

    fn with_dir(dir: Option<PathBuf>, quota_bytes: u64) -> Self {
        ChunkStore {
            dir,
            quota_bytes,
            persisted_bytes: AtomicU64::new(0),
            persisted_chunks: AtomicU64::new(0),
            io_errors: AtomicU64::new(0),
        }
    }

    fn prepare_directory(dir: &Path, buffer_id: &str) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        let marker = dir.join(BUFFER_MARKER_FILE);
        if !marker.exists() {
            fs::write(&marker, [])?;
        }
        // Missing xattr support degrades enumeration, not operation: the
        // deterministic directory name still maps the same ID to the same
        // directory on the next start.
        if let Err(e) = xattr::set(dir, BUFFER_ID_XATTR, buffer_id.as_bytes()) {
            warn!(
                dir = %dir.display(),
                error = %e,
                "cannot store buffer ID attribute, enumeration will use directory names"
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn has_dir(&self) -> bool {
        self.dir.is_some()
    }

    /// Lists chunk files accepted by `matcher`, oldest first, as
    /// persisted-only refs. The marker file and files from other naming
    /// conventions are ignored. Returns empty in degraded mode.
    #[must_use]
    pub fn scan_existing(&self, matcher: &ChunkIdMatcher) -> Vec<Chunk> {
        let Some(dir) = &self.dir else {
            return Vec::new();
        };
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.record_io_error("scan", &e);
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.as_str() != BUFFER_MARKER_FILE && matcher(name))
            .collect();
        // Zero-padded IDs: filename order is creation order.
        names.sort();
        names
            .into_iter()
            .map(|name| Chunk::persisted_ref(ChunkId::new(name)))
            .collect()
    }

    /// Reads the chunk's file back into memory. No-op success when the
    /// payload is already present. Fails in degraded mode or on read error.
    pub fn load(&self, chunk: &mut Chunk) -> bool {
        if chunk.is_loaded() {
            return true;
        }
        let Some(dir) = &self.dir else {
            warn!(chunk = %chunk.id(), "cannot load chunk, queue directory unavailable");
            return false;
        };
        match fs::read(dir.join(chunk.id().as_str())) {
            Ok(payload) => {
                chunk.restore_payload(payload);
                true
            }
            Err(e) => {
                self.record_io_error("load", &e);
                warn!(chunk = %chunk.id(), error = %e, "failed to read chunk file");
                false
            }
        }
    }

    /// Writes the payload to a file named by the chunk ID and releases it
    /// from memory. Refuses (with a warning) when the write would push the
    /// persisted-byte total over the quota, and fails closed on I/O errors:
    /// no file, chunk unchanged.
    pub fn unload(&self, chunk: &mut Chunk) -> bool {
        if chunk.is_persisted() {
            // Already on disk; at most the payload needs releasing.
            if chunk.is_loaded() {
                chunk.release_payload();
            }
            return true;
        }
        let Some(dir) = &self.dir else {
            debug!(chunk = %chunk.id(), "cannot persist chunk, queue directory unavailable");
            return false;
        };
        let len = chunk.payload_len() as u64;
        let used = self.persisted_bytes.load(Ordering::Acquire);
        if used.saturating_add(len) > self.quota_bytes {
            warn!(
                chunk = %chunk.id(),
                chunk_bytes = len,
                used_bytes = used,
                quota_bytes = self.quota_bytes,
                "persisting chunk would exceed disk quota"
            );
            return false;
        }

        let path = dir.join(chunk.id().as_str());
        let Some(payload) = chunk.payload() else {
            // Unreachable: an unpersisted chunk always carries its payload.
            return false;
        };
        if let Err(e) = fs::write(&path, payload) {
            self.record_io_error("unload", &e);
            warn!(chunk = %chunk.id(), error = %e, "failed to write chunk file");
            // A partial file would be picked up at the next start.
            let _ = fs::remove_file(&path);
            return false;
        }

        self.persisted_bytes.fetch_add(len, Ordering::AcqRel);
        self.persisted_chunks.fetch_add(1, Ordering::AcqRel);
        chunk.mark_persisted();
        chunk.release_payload();
        true
    }

    /// Deletes the chunk's file (if any) and releases its accounting.
    pub fn remove(&self, chunk: &Chunk) {
        if !chunk.is_persisted() {
            return;
        }
        let Some(dir) = &self.dir else {
            return;
        };
        let path = dir.join(chunk.id().as_str());
        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => chunk.payload_len() as u64,
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                let _ = self.persisted_bytes.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |v| Some(v.saturating_sub(len)),
                );
                let _ = self.persisted_chunks.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |v| Some(v.saturating_sub(1)),
                );
            }
            Err(e) => {
                self.record_io_error("remove", &e);
                warn!(chunk = %chunk.id(), error = %e, "failed to delete chunk file");
            }
        }
    }

    /// Accounting-only hook for a chunk discarded under overflow or quota
    /// pressure. Callers delete the file first (via [`remove`]) when the
    /// chunk was persisted.
    ///
    /// [`remove`]: ChunkStore::remove
    pub fn on_dropped(&self, chunk: &Chunk) {
        debug!(
            chunk = %chunk.id(),
            persisted = chunk.is_persisted(),
            "chunk dropped"
        );
    }

    /// Seeds the byte-quota counter for a chunk recovered from a previous
    /// process: its file predates this process's accounting, so re-stat it.
    pub fn on_recovered(&self, chunk: &Chunk) {
        let Some(dir) = &self.dir else {
            return;
        };
        match fs::metadata(dir.join(chunk.id().as_str())) {
            Ok(meta) => {
                self.persisted_bytes.fetch_add(meta.len(), Ordering::AcqRel);
                self.persisted_chunks.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => {
                self.record_io_error("stat", &e);
                warn!(chunk = %chunk.id(), error = %e, "failed to stat recovered chunk");
            }
        }
    }

    #[must_use]
    pub fn persisted_bytes(&self) -> u64 {
        self.persisted_bytes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn persisted_chunks(&self) -> u64 {
        self.persisted_chunks.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn io_errors(&self) -> u64 {
        self.io_errors.load(Ordering::Acquire)
    }

    fn record_io_error(&self, op: &str, err: &std::io::Error) {
        self.io_errors.fetch_add(1, Ordering::AcqRel);
        debug!(op, error = %err, "chunk store i/o error");
    }
}
