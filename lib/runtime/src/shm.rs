// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Page-aligned staging buffers.
//!
//! Contexts own their staging memory: either a named shared-memory segment
//! visible to all local ranks (the `BytePS_ShM_*` compatibility namespace) or
//! a private heap allocation. Stage workers address disjoint
//! `offset..offset+len` windows of a buffer concurrently, so the accessors
//! take `&self`; the partitioner guarantees windows never overlap.

use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::path::PathBuf;

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::config::page_size;

enum Storage {
    Heap(Box<[UnsafeCell<u8>]>),
    Mmap(UnsafeCell<MmapMut>),
}

/// A fixed-size staging buffer shared between stage threads.
pub struct SharedBuffer {
    storage: Storage,
    len: usize,
}

// Disjoint-window discipline: every concurrent accessor owns a distinct byte
// range, enforced by the scheduler, not the type system.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Allocate a private, zeroed buffer rounded up to whole pages.
    pub fn alloc(len: usize) -> Self {
        let aligned = len.div_ceil(page_size()) * page_size();
        let storage: Vec<UnsafeCell<u8>> = (0..aligned).map(|_| UnsafeCell::new(0)).collect();
        Self { storage: Storage::Heap(storage.into_boxed_slice()), len: aligned }
    }

    fn from_mmap(map: MmapMut) -> Self {
        let len = map.len();
        Self { storage: Storage::Mmap(UnsafeCell::new(map)), len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn base(&self) -> *mut u8 {
        match &self.storage {
            Storage::Heap(cells) => cells.as_ptr() as *mut u8,
            // SAFETY: the map lives as long as self and is never remapped.
            Storage::Mmap(map) => unsafe { (*map.get()).as_mut_ptr() },
        }
    }

    /// Copy `src` into the buffer at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len);
        // SAFETY: callers hold exclusive scheduling ownership of this window.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(offset), src.len());
        }
    }

    /// Copy `dst.len()` bytes out of the buffer at `offset`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len);
        // SAFETY: as for write_at.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Run `f` over a mutable view of one window.
    ///
    /// The window must not be scheduled to any other thread while `f` runs;
    /// the per-stage queues guarantee that for partition windows.
    pub fn with_range_mut<R>(&self, offset: usize, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        assert!(offset + len <= self.len);
        // SAFETY: exclusive window, see above.
        let slice = unsafe { std::slice::from_raw_parts_mut(self.base().add(offset), len) };
        f(slice)
    }

    /// Run `f` over a read-only view of one window.
    pub fn with_range<R>(&self, offset: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        assert!(offset + len <= self.len);
        // SAFETY: exclusive window, see above.
        let slice = unsafe { std::slice::from_raw_parts(self.base().add(offset), len) };
        f(slice)
    }
}

/// Opens named shared-memory segments under `/dev/shm`.
///
/// Segment names are `<prefix><first_routing_key>`; the prefixes
/// (`BytePS_ShM_<job>_`, `BytePS_P2P_ShM_<job>_<worker>_`, `BytePS_Pcie_<job>`)
/// are a persisted format shared with sibling ranks and are kept verbatim.
pub struct ShmManager {
    base_dir: PathBuf,
    /// Segments created by this process, unlinked on drop.
    owned: Mutex<Vec<PathBuf>>,
}

impl ShmManager {
    pub fn new() -> Self {
        Self::with_base_dir(PathBuf::from("/dev/shm"))
    }

    /// Tests point this at a tempdir so parallel test runs cannot collide.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir, owned: Mutex::new(Vec::new()) }
    }

    /// Open (rank 0 of the segment creates) a shared segment of `size` bytes,
    /// rounded up to whole pages.
    pub fn open_shared(&self, prefix: &str, key: u64, size: usize) -> anyhow::Result<SharedBuffer> {
        let aligned = size.div_ceil(page_size()) * page_size();
        let path = self.base_dir.join(format!("{prefix}{key}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let created = file.metadata()?.len() < aligned as u64;
        if created {
            file.set_len(aligned as u64)?;
            self.owned.lock().push(path.clone());
        }
        // SAFETY: the segment is only resized before the first map.
        let map = unsafe { MmapMut::map_mut(&file)? };
        tracing::trace!(path = %path.display(), size = aligned, "opened shared memory");
        Ok(SharedBuffer::from_mmap(map))
    }

    /// One segment per PCIe switch plus the local one, for cross-switch
    /// staging.
    pub fn open_pcie_shared(
        &self,
        prefix: &str,
        key: u64,
        size: usize,
        num_switch: usize,
    ) -> anyhow::Result<Vec<SharedBuffer>> {
        (0..num_switch)
            .map(|i| self.open_shared(&format!("{prefix}_Switch_{i}_"), key, size))
            .collect()
    }
}

impl Default for ShmManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShmManager {
    fn drop(&mut self) {
        for path in self.owned.lock().drain(..) {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_page_aligned() {
        let buf = SharedBuffer::alloc(100);
        assert_eq!(buf.len() % page_size(), 0);
        assert!(buf.len() >= 100);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let buf = SharedBuffer::alloc(4096);
        buf.write_at(10, b"hello");
        let mut out = [0u8; 5];
        buf.read_at(10, &mut out);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_with_range_mut() {
        let buf = SharedBuffer::alloc(64);
        buf.with_range_mut(0, 8, |w| w.copy_from_slice(&[7u8; 8]));
        buf.with_range(4, 4, |r| assert_eq!(r, &[7u8; 4]));
    }

    #[test]
    fn test_shared_segment_visible_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ShmManager::with_base_dir(dir.path().to_path_buf());
        let a = mgr.open_shared("BytePS_ShM_test_", 42, 1000).unwrap();
        a.write_at(0, b"xyz");
        let b = mgr.open_shared("BytePS_ShM_test_", 42, 1000).unwrap();
        let mut out = [0u8; 3];
        b.read_at(0, &mut out);
        assert_eq!(&out, b"xyz");
    }
}
