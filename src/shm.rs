//! Fixed-slot shared-memory pool (§3, §4.A).
//!
//! A pool is identified by a `prefix`; it allocates fixed-size items out of
//! a chain of segments named `{prefix}_{segment_index}`. Each segment holds
//! whole items only (no item straddles a segment boundary), items are
//! 8-byte aligned, and a segment never exceeds [`MAX_SEGMENT_BYTES`]. This
//! crate does not map real POSIX shared memory (no cross-process use here);
//! segments are plain heap buffers keyed by name, which preserves the
//! allocator's slot/free-set behavior for a single process's worker and
//! agent tasks to share tensors without copying.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::ShmError;

const ITEM_ALIGN: u64 = 8;
pub const MAX_SEGMENT_BYTES: u64 = 4 * 1024 * 1024 * 1024;

fn align_up(size: u64, align: u64) -> u64 {
    (size + align - 1) / align * align
}

struct Segment {
    buf: Arc<Vec<u8>>,
    free_slots: HashSet<u64>,
}

struct PoolInner {
    item_size: u64,
    items_per_segment: u64,
    segments: Vec<Segment>,
}

/// One named pool of fixed-size shared slots.
pub struct ShmAllocator {
    prefix: String,
    item_size: u64,
    item_count: u64,
    inner: Mutex<PoolInner>,
}

/// A handle to one allocated slot. Dropping it does not free the slot —
/// callers release explicitly via [`ShmAllocator::free`] once all
/// consumers are done, mirroring the source's explicit free-on-Detach
/// discipline rather than implicit Drop-based reclamation.
#[derive(Debug, Clone)]
pub struct ShmSlot {
    pub segment_index: usize,
    pub slot_index: u64,
    pub buf: Arc<Vec<u8>>,
    pub offset: u64,
    pub len: u64,
}

impl ShmSlot {
    pub fn segment_name(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.segment_index)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.offset as usize..(self.offset + self.len) as usize]
    }
}

impl ShmAllocator {
    /// Create a pool. `item_size` is the per-item payload size before
    /// alignment; `item_count` is a hint for how many items to preallocate
    /// per segment (clamped so a segment never exceeds [`MAX_SEGMENT_BYTES`]).
    pub fn new(prefix: impl Into<String>, item_size: u64, item_count: u64) -> Result<Self, ShmError> {
        let prefix = prefix.into();
        if item_size == 0 || item_count == 0 {
            return Err(ShmError::InvalidItemSizing {
                prefix,
                item_size,
                item_count,
            });
        }
        let aligned_item = align_up(item_size, ITEM_ALIGN);
        let max_per_segment = (MAX_SEGMENT_BYTES / aligned_item).max(1);
        let items_per_segment = item_count.min(max_per_segment);

        Ok(ShmAllocator {
            prefix,
            item_size: aligned_item,
            item_count,
            inner: Mutex::new(PoolInner {
                item_size: aligned_item,
                items_per_segment,
                segments: Vec::new(),
            }),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn alloc_segment(inner: &mut PoolInner) -> usize {
        let bytes = inner.item_size * inner.items_per_segment;
        let free_slots = (0..inner.items_per_segment).collect();
        inner.segments.push(Segment {
            buf: Arc::new(vec![0u8; bytes as usize]),
            free_slots,
        });
        inner.segments.len() - 1
    }

    /// Reserve one item-sized slot, growing the pool with a new segment if
    /// every existing segment is full.
    pub fn allocate(&self) -> ShmSlot {
        let mut inner = self.inner.lock().unwrap();

        let seg_idx = inner
            .segments
            .iter()
            .position(|s| !s.free_slots.is_empty())
            .unwrap_or_else(|| Self::alloc_segment(&mut inner));

        let item_size = inner.item_size;
        let segment = &mut inner.segments[seg_idx];
        let slot_index = *segment.free_slots.iter().next().unwrap();
        segment.free_slots.remove(&slot_index);

        ShmSlot {
            segment_index: seg_idx,
            slot_index,
            buf: segment.buf.clone(),
            offset: slot_index * item_size,
            len: item_size,
        }
    }

    /// Release a slot back to its segment's free set. Freeing an
    /// already-free slot is a double-free and is fatal to the pool, per
    /// the source's `munmap` safety guarantee, not a silently-ignored
    /// no-op.
    pub fn free(&self, slot: &ShmSlot) -> Result<(), ShmError> {
        let mut inner = self.inner.lock().unwrap();
        let seg = inner
            .segments
            .get_mut(slot.segment_index)
            .ok_or_else(|| ShmError::DoubleFree(slot.segment_name(&self.prefix)))?;
        if !seg.free_slots.insert(slot.slot_index) {
            return Err(ShmError::DoubleFree(slot.segment_name(&self.prefix)));
        }
        Ok(())
    }

    pub fn item_size(&self) -> u64 {
        self.item_size
    }

    pub fn item_count_hint(&self) -> u64 {
        self.item_count
    }
}

/// Tracks reference counts for shared-memory segments attached by name, so
/// multiple tensor views over the same segment can share one attach and
/// only the last detach actually drops the mapping. Resolves the spec's
/// Open Question on Detach semantics conservatively: refcounted rather
/// than the source's single-shot detach.
#[derive(Default)]
pub struct ShmAttachManager {
    attached: Mutex<HashMap<String, (Arc<Vec<u8>>, u64)>>,
}

impl ShmAttachManager {
    pub fn new() -> Self {
        ShmAttachManager::default()
    }

    /// Attach to a named segment, validating that `data_offset + data_size`
    /// falls within the segment. Bumps the refcount if already attached.
    pub fn attach(
        &self,
        name: &str,
        buf: Arc<Vec<u8>>,
        data_offset: u64,
        data_size: u64,
    ) -> Result<Arc<Vec<u8>>, ShmError> {
        let bytes_size = buf.len() as u64;
        if data_offset + data_size > bytes_size {
            return Err(ShmError::InvalidAttachRange {
                bytes_size,
                data_offset,
                data_size,
            });
        }
        let mut attached = self.attached.lock().unwrap();
        let entry = attached
            .entry(name.to_string())
            .or_insert_with(|| (buf.clone(), 0));
        entry.1 += 1;
        Ok(entry.0.clone())
    }

    /// Decrement the refcount for `name`, removing the entry once it hits
    /// zero. Detaching a name that was never attached is an error.
    pub fn detach(&self, name: &str) -> Result<(), ShmError> {
        let mut attached = self.attached.lock().unwrap();
        match attached.get_mut(name) {
            Some(entry) => {
                entry.1 -= 1;
                if entry.1 == 0 {
                    attached.remove(name);
                }
                Ok(())
            }
            None => Err(ShmError::NotAttached(name.to_string())),
        }
    }

    pub fn refcount(&self, name: &str) -> u64 {
        self.attached
            .lock()
            .unwrap()
            .get(name)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_roundtrip() {
        let pool = ShmAllocator::new("test", 16, 4).unwrap();
        let slot = pool.allocate();
        assert_eq!(slot.segment_index, 0);
        pool.free(&slot).unwrap();
    }

    #[test]
    fn double_free_is_fatal() {
        let pool = ShmAllocator::new("test", 16, 4).unwrap();
        let slot = pool.allocate();
        pool.free(&slot).unwrap();
        let err = pool.free(&slot).unwrap_err();
        assert!(matches!(err, ShmError::DoubleFree(_)));
    }

    #[test]
    fn pool_grows_a_new_segment_once_full() {
        let pool = ShmAllocator::new("test", 16, 2).unwrap();
        let a = pool.allocate();
        let b = pool.allocate();
        let c = pool.allocate();
        assert_eq!(a.segment_index, 0);
        assert_eq!(b.segment_index, 0);
        assert_eq!(c.segment_index, 1);
    }

    #[test]
    fn item_size_is_8byte_aligned() {
        let pool = ShmAllocator::new("test", 13, 1).unwrap();
        assert_eq!(pool.item_size(), 16);
    }

    #[test]
    fn zero_sizing_rejected() {
        assert!(matches!(
            ShmAllocator::new("test", 0, 4).unwrap_err(),
            ShmError::InvalidItemSizing { .. }
        ));
    }

    #[test]
    fn attach_refcounts_and_detach_releases() {
        let mgr = ShmAttachManager::new();
        let buf = Arc::new(vec![0u8; 32]);
        mgr.attach("seg_0", buf.clone(), 0, 16).unwrap();
        mgr.attach("seg_0", buf, 0, 16).unwrap();
        assert_eq!(mgr.refcount("seg_0"), 2);
        mgr.detach("seg_0").unwrap();
        assert_eq!(mgr.refcount("seg_0"), 1);
        mgr.detach("seg_0").unwrap();
        assert_eq!(mgr.refcount("seg_0"), 0);
    }

    #[test]
    fn attach_range_out_of_bounds_rejected() {
        let mgr = ShmAttachManager::new();
        let buf = Arc::new(vec![0u8; 16]);
        let err = mgr.attach("seg_0", buf, 8, 16).unwrap_err();
        assert!(matches!(err, ShmError::InvalidAttachRange { .. }));
    }

    #[test]
    fn detach_without_attach_errors() {
        let mgr = ShmAttachManager::new();
        assert!(matches!(mgr.detach("nope"), Err(ShmError::NotAttached(_))));
    }
}
