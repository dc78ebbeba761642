//! Snapshot ring buffer.
//!
//! Fixed-count ring of equally sized slices over a contiguous byte region
//! (heap-allocated, or POSIX shared memory so companions can map it). One
//! producer (the task's fastest sub-task) appends slices; one consumer (the
//! monitor server) drains them.
//!
//! ```text
//!          base                                       base + cap*slice_len
//!           │ slice 0 │ slice 1 │ slice 2 │ slice 3 │
//!                ▲                   ▲
//!                rp ── readable ──▶  wp
//! ```
//!
//! The write position is tri-state: `Active` while the producer runs,
//! `Paused` after an overflow (writes stop, reads report [`HostError::
//! Overflow`] until [`SliceRing::reset`]), `Closed` once the producer is
//! gone for good. Loss is never silent: a full ring pauses instead of
//! overwriting unread slices.
//!
//! Locking covers cursor updates only. Slice bytes are copied outside the
//! lock, which is sound because the readable range `[rp, wp)` excludes the
//! slot being written and only the consumer moves `rp`.

use crate::error::HostError;
use crate::shm::{Creator, SharedRegion};
use crate::trace::{debug, warn};
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::NonNull;
use std::sync::Mutex;
use std::time::Duration;

/// Result of a producer append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Slice stored, write position advanced.
    Written,
    /// Slice stored, but it filled the ring: the ring is now paused and the
    /// consumer will observe [`HostError::Overflow`].
    Overflowed,
    /// Ring paused or closed; nothing was written.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePos {
    Active(usize),
    Paused,
    Closed(usize),
}

#[derive(Debug)]
struct Cursors {
    wp: WritePos,
    rp: usize,
}

enum Backing {
    Heap { ptr: NonNull<u8>, layout: Layout },
    Shared(SharedRegion<Creator>),
}

impl Backing {
    fn base(&self) -> NonNull<u8> {
        match self {
            Backing::Heap { ptr, .. } => *ptr,
            Backing::Shared(region) => region.as_ptr(),
        }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Backing::Heap { ptr, layout } = self {
            // SAFETY: allocated with exactly this layout in `heap_backing`.
            unsafe { dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

// SAFETY: the raw base pointer refers to a stable allocation owned by the
// ring; slot access is serialized by the cursor protocol.
unsafe impl Send for Backing {}
// SAFETY: see above.
unsafe impl Sync for Backing {}

/// Ring of `capacity` slices of `slice_len` bytes each.
pub struct SliceRing {
    backing: Backing,
    slice_len: usize,
    capacity: usize,
    cursors: Mutex<Cursors>,
}

fn heap_backing(bytes: usize) -> Backing {
    // Layout is non-zero: constructors reject empty rings.
    let layout = match Layout::from_size_align(bytes, 1) {
        Ok(layout) => layout,
        Err(_) => handle_alloc_error(Layout::new::<u8>()),
    };
    // SAFETY: layout has non-zero size.
    let raw = unsafe { alloc_zeroed(layout) };
    let Some(ptr) = NonNull::new(raw) else {
        handle_alloc_error(layout);
    };
    Backing::Heap { ptr, layout }
}

impl SliceRing {
    /// Ring backed by process-private heap memory.
    pub fn in_memory(slice_len: usize, capacity: usize) -> Result<Self, HostError> {
        Self::validate(slice_len, capacity)?;
        Ok(Self {
            backing: heap_backing(slice_len * capacity),
            slice_len,
            capacity,
            cursors: Mutex::new(Cursors {
                wp: WritePos::Active(0),
                rp: 0,
            }),
        })
    }

    /// Ring backed by a shared memory region the host created. Capacity is
    /// however many whole slices fit in the region.
    pub fn in_shared(region: SharedRegion<Creator>, slice_len: usize) -> Result<Self, HostError> {
        let capacity = if slice_len == 0 {
            0
        } else {
            region.len() / slice_len
        };
        Self::validate(slice_len, capacity)?;
        Ok(Self {
            backing: Backing::Shared(region),
            slice_len,
            capacity,
            cursors: Mutex::new(Cursors {
                wp: WritePos::Active(0),
                rp: 0,
            }),
        })
    }

    fn validate(slice_len: usize, capacity: usize) -> Result<(), HostError> {
        if slice_len == 0 {
            return Err(HostError::out_of_range("slice length must be non-zero"));
        }
        if capacity == 0 {
            return Err(HostError::out_of_range(
                "ring must hold at least one slice",
            ));
        }
        Ok(())
    }

    /// Number of slices this ring holds.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes per slice.
    #[must_use]
    pub fn slice_len(&self) -> usize {
        self.slice_len
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cursors> {
        // Cursor updates never panic, so the lock cannot be poisoned.
        match self.cursors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Raw pointer to slot `index`. Exclusivity of the slot comes from the
    /// cursor protocol, not from this method.
    fn slot_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity, so the offset stays inside the backing.
        unsafe { self.backing.base().as_ptr().add(index * self.slice_len) }
    }

    /// Producer side: appends one slice assembled from `parts`, whose total
    /// length must equal the slice length.
    ///
    /// Single producer only. The slice bytes are copied without the cursor
    /// lock held; the lock is retaken to advance `wp`. If advancing would
    /// land on `rp` the ring pauses and the slice just written is, like
    /// everything else in the ring, unavailable until [`reset`](Self::reset).
    pub fn write(&self, parts: &[&[u8]]) -> Result<WriteOutcome, HostError> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total != self.slice_len {
            return Err(HostError::out_of_range(format!(
                "slice write of {total} bytes into {}-byte slots",
                self.slice_len
            )));
        }

        let slot = {
            let cur = self.lock();
            match cur.wp {
                WritePos::Active(w) => w,
                WritePos::Paused | WritePos::Closed(_) => return Ok(WriteOutcome::Skipped),
            }
        };

        let mut dst = self.slot_ptr(slot);
        for part in parts {
            // SAFETY: the destination slot lies outside the readable range
            // [rp, wp) so no reader touches it, and the parts sum to
            // slice_len so the copies stay inside the slot.
            unsafe {
                std::ptr::copy_nonoverlapping(part.as_ptr(), dst, part.len());
                dst = dst.add(part.len());
            }
        }

        let mut cur = self.lock();
        let next = (slot + 1) % self.capacity;
        if next == cur.rp {
            cur.wp = WritePos::Paused;
            warn!(capacity = self.capacity, "snapshot ring full, pausing writes");
            Ok(WriteOutcome::Overflowed)
        } else {
            cur.wp = WritePos::Active(next);
            Ok(WriteOutcome::Written)
        }
    }

    /// Stops the producer side permanently. Already-written slices remain
    /// drainable.
    pub fn close(&self) {
        let mut cur = self.lock();
        cur.wp = match cur.wp {
            WritePos::Active(w) => WritePos::Closed(w),
            WritePos::Paused => WritePos::Closed(cur.rp),
            closed @ WritePos::Closed(_) => closed,
        };
    }

    /// True once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.lock().wp, WritePos::Closed(_))
    }

    /// Consumer side: how far reads may proceed from the base.
    ///
    /// Returns the write offset in slices when it lies at or ahead of the
    /// read offset, or the ring capacity when the writer has wrapped past
    /// the end; the consumer then reads `[rp, returned)` and never crosses
    /// the wrap point in one pass. A paused ring yields
    /// [`HostError::Overflow`].
    pub fn current_write_offset(&self) -> Result<usize, HostError> {
        let cur = self.lock();
        match cur.wp {
            WritePos::Paused => Err(HostError::Overflow),
            WritePos::Active(w) | WritePos::Closed(w) => {
                Ok(if w >= cur.rp { w } else { self.capacity })
            }
        }
    }

    /// Consumer side: moves the read offset, wrapping an offset at or past
    /// the end back to the base. Returns the offset actually set.
    pub fn set_read_offset(&self, offset: usize) -> usize {
        let wrapped = if offset >= self.capacity { 0 } else { offset };
        self.lock().rp = wrapped;
        wrapped
    }

    /// Copies slice `index` into `dst`, which must be exactly one slice
    /// long. The index must lie in the currently readable range.
    pub fn read_slice(&self, index: usize, dst: &mut [u8]) -> Result<(), HostError> {
        if dst.len() != self.slice_len {
            return Err(HostError::out_of_range(format!(
                "read buffer of {} bytes for {}-byte slices",
                dst.len(),
                self.slice_len
            )));
        }
        {
            let cur = self.lock();
            let readable = match cur.wp {
                WritePos::Paused => return Err(HostError::Overflow),
                WritePos::Active(w) | WritePos::Closed(w) => {
                    if w >= cur.rp {
                        cur.rp <= index && index < w
                    } else {
                        index >= cur.rp || index < w
                    }
                }
            };
            if !readable {
                return Err(HostError::out_of_range(format!(
                    "slice {index} outside readable range"
                )));
            }
        }
        // SAFETY: the index was readable, only this consumer moves rp, and
        // the producer never writes into [rp, wp); dst length checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_ptr(index), dst.as_mut_ptr(), self.slice_len);
        }
        Ok(())
    }

    /// Discards everything and re-binds both cursors to the base. The only
    /// way out of the paused state; data lost to the overflow stays lost.
    pub fn reset(&self) -> usize {
        let mut cur = self.lock();
        match cur.wp {
            WritePos::Closed(_) => {
                // Producer is gone; just mark the ring drained.
                cur.wp = WritePos::Closed(0);
            }
            WritePos::Active(_) | WritePos::Paused => {
                cur.wp = WritePos::Active(0);
            }
        }
        cur.rp = 0;
        debug!("snapshot ring reset");
        0
    }

    /// Pending slices as a percentage of capacity; a paused ring reports
    /// 100.
    #[must_use]
    pub fn fill_percent(&self) -> u8 {
        let cur = self.lock();
        let pending = match cur.wp {
            WritePos::Paused => self.capacity,
            WritePos::Active(w) | WritePos::Closed(w) => {
                (w + self.capacity - cur.rp) % self.capacity
            }
        };
        ((pending * 100) / self.capacity) as u8
    }
}

/// Slices a ring should hold to cover `buffer_time` at one slice per
/// `period`, never fewer than one.
#[must_use]
pub fn capacity_for(buffer_time: Duration, period: Duration) -> usize {
    let period_ns = period.as_nanos().max(1);
    let slices = buffer_time.as_nanos() / period_ns;
    (slices.max(1)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice_of(byte: u8, len: usize) -> Vec<u8> {
        vec![byte; len]
    }

    fn drain(ring: &SliceRing, rp: &mut usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let limit = ring.current_write_offset().unwrap();
            if *rp == limit {
                break;
            }
            while *rp < limit {
                let mut buf = vec![0u8; ring.slice_len()];
                ring.read_slice(*rp, &mut buf).unwrap();
                out.push(buf);
                *rp = ring.set_read_offset(*rp + 1);
                if *rp == 0 {
                    // Wrapped; re-query the write offset.
                    break;
                }
            }
        }
        out
    }

    #[test]
    fn slices_arrive_in_order_without_gaps() {
        let ring = SliceRing::in_memory(4, 4).unwrap();
        let mut rp = 0usize;
        let mut produced = 0u8;
        let mut consumed = Vec::new();

        // Interleave production and consumption so the writer wraps several
        // times without ever filling the ring.
        for _ in 0..10 {
            for _ in 0..2 {
                let s = slice_of(produced, 4);
                assert_eq!(ring.write(&[&s]).unwrap(), WriteOutcome::Written);
                produced += 1;
            }
            consumed.extend(drain(&ring, &mut rp));
        }

        assert_eq!(consumed.len(), 20);
        for (i, slice) in consumed.iter().enumerate() {
            assert_eq!(slice[0] as usize, i, "slice {i} out of order");
        }
    }

    #[test]
    fn full_ring_pauses_and_reset_recovers() {
        let ring = SliceRing::in_memory(2, 4).unwrap();

        // rp = 0, so the fourth write lands on rp and pauses the ring.
        for i in 0..3u8 {
            assert_eq!(
                ring.write(&[&slice_of(i, 2)]).unwrap(),
                WriteOutcome::Written
            );
        }
        assert_eq!(
            ring.write(&[&slice_of(3, 2)]).unwrap(),
            WriteOutcome::Overflowed
        );

        assert!(matches!(
            ring.current_write_offset(),
            Err(HostError::Overflow)
        ));
        let mut buf = [0u8; 2];
        assert!(matches!(ring.read_slice(0, &mut buf), Err(HostError::Overflow)));
        assert_eq!(ring.write(&[&slice_of(9, 2)]).unwrap(), WriteOutcome::Skipped);
        assert_eq!(ring.fill_percent(), 100);

        assert_eq!(ring.reset(), 0);
        assert_eq!(
            ring.write(&[&slice_of(7, 2)]).unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(ring.current_write_offset().unwrap(), 1);
        ring.read_slice(0, &mut buf).unwrap();
        assert_eq!(buf, [7, 7]);
    }

    #[test]
    fn write_offset_is_wrap_limited() {
        let ring = SliceRing::in_memory(1, 4).unwrap();

        for i in 0..3u8 {
            ring.write(&[&[i]]).unwrap();
        }
        assert_eq!(ring.current_write_offset().unwrap(), 3);
        assert_eq!(ring.set_read_offset(3), 3);

        // Writer wraps: slots 3 and 0, so wp = 1 < rp = 3.
        ring.write(&[&[3]]).unwrap();
        ring.write(&[&[4]]).unwrap();
        assert_eq!(ring.current_write_offset().unwrap(), 4);

        let mut buf = [0u8];
        ring.read_slice(3, &mut buf).unwrap();
        assert_eq!(buf[0], 3);
        // Advancing past the end wraps to the base.
        assert_eq!(ring.set_read_offset(4), 0);
        assert_eq!(ring.current_write_offset().unwrap(), 1);
        ring.read_slice(0, &mut buf).unwrap();
        assert_eq!(buf[0], 4);
    }

    #[test]
    fn closed_ring_drains_then_skips() {
        let ring = SliceRing::in_memory(1, 4).unwrap();
        ring.write(&[&[1]]).unwrap();
        ring.write(&[&[2]]).unwrap();
        ring.close();

        assert_eq!(ring.write(&[&[3]]).unwrap(), WriteOutcome::Skipped);
        assert!(ring.is_closed());
        assert_eq!(ring.current_write_offset().unwrap(), 2);
        let mut buf = [0u8];
        ring.read_slice(0, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let ring = SliceRing::in_memory(4, 2).unwrap();
        assert!(matches!(
            ring.write(&[&[0u8; 3]]),
            Err(HostError::OutOfRange(_))
        ));
        let mut short = [0u8; 3];
        ring.write(&[&[0u8; 4]]).unwrap();
        assert!(matches!(
            ring.read_slice(0, &mut short),
            Err(HostError::OutOfRange(_))
        ));
    }

    #[test]
    fn capacity_covers_buffer_time() {
        let ms = Duration::from_millis(1);
        assert_eq!(capacity_for(Duration::from_millis(10), ms), 10);
        assert_eq!(capacity_for(Duration::ZERO, ms), 1);
        assert_eq!(capacity_for(Duration::from_micros(1500), ms), 1);
    }
}
