//! Bump-allocated young generation.
//!
//! Every allocation is the same size (`size_of::<GcBox>()`, the largest
//! `HeapObject` variant plus its header), so the nursery is a plain bump
//! allocator over a fixed-capacity byte buffer: no free list, no
//! coalescing, just a cursor that only ever moves forward until the next
//! minor collection discards or promotes everything behind it.

use crate::gc::header::{Generation, GcHeader};
use crate::gc::ptr::{GcBox, GcRef};
use crate::object::{HeapObject, ObjectKind};
use std::collections::HashSet;
use std::ptr::NonNull;

/// Default nursery size, matching the order of magnitude the design calls
/// for (a single-digit number of pages).
pub const DEFAULT_NURSERY_CAPACITY: usize = 64 * 1024;

pub struct Nursery {
    buffer: Box<[u8]>,
    cursor: usize,
    capacity: usize,
    head: *mut GcHeader,
    allocation_count: usize,
}

impl Nursery {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            cursor: 0,
            capacity,
            head: std::ptr::null_mut(),
            allocation_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_bytes(&self) -> usize {
        self.cursor
    }

    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    pub fn is_empty(&self) -> bool {
        self.allocation_count == 0
    }

    /// Whether a single allocation would currently fit, without requiring
    /// the caller to hand over a `HeapObject` it might not get back (every
    /// slot is the same size, so this needs no knowledge of what's being
    /// allocated).
    pub fn has_room(&self) -> bool {
        self.next_aligned_offset().is_some()
    }

    fn next_aligned_offset(&self) -> Option<usize> {
        let size = std::mem::size_of::<GcBox>();
        let align = std::mem::align_of::<GcBox>();
        let base = self.buffer.as_ptr() as usize;
        let aligned_start = (base + self.cursor + align - 1) & !(align - 1);
        let offset = aligned_start - base;
        (offset + size <= self.capacity).then_some(offset)
    }

    /// Bump-allocate one object. Returns `None` when the nursery doesn't
    /// have room — the caller (the collector) then runs a minor cycle and
    /// retries, or falls straight through to the old generation. Check
    /// [`Nursery::has_room`] first if `data` is expensive to reconstruct,
    /// since a failed call here drops `data`.
    pub fn allocate(&mut self, kind: ObjectKind, data: HeapObject) -> Option<GcRef> {
        let size = std::mem::size_of::<GcBox>();
        let offset = self.next_aligned_offset()?;
        let base = self.buffer.as_mut_ptr() as usize;
        let ptr = (base + offset) as *mut GcBox;
        let header = GcHeader::new(kind, Generation::Young);
        header.set_next(self.head);
        unsafe {
            ptr.write(GcBox { header, data });
        }
        self.head = unsafe { std::ptr::addr_of_mut!((*ptr).header) };
        self.cursor = offset + size;
        self.allocation_count += 1;

        let non_null = NonNull::new(ptr).expect("bump pointer is never null");
        Some(unsafe { GcRef::new(non_null) })
    }

    /// The intrusive list of every object currently allocated here,
    /// newest-first.
    pub fn iter_headers(&self) -> impl Iterator<Item = NonNull<GcHeader>> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let ptr = NonNull::new(cur)?;
            cur = unsafe { ptr.as_ref().next() };
            Some(ptr)
        })
    }

    /// Drop every object's payload whose address is *not* in `promoted`
    /// (those were copied out to the old generation and are owned there
    /// now), then discard the whole arena in one shot.
    ///
    /// # Safety
    /// `promoted` must contain exactly the set of header addresses that
    /// were forwarded elsewhere; anything else here is garbage.
    pub unsafe fn sweep_and_reset(&mut self, promoted: &HashSet<usize>) {
        let mut cur = self.head;
        while let Some(header_ptr) = NonNull::new(cur) {
            let next = header_ptr.as_ref().next();
            if !promoted.contains(&(header_ptr.as_ptr() as usize)) {
                let box_ptr = header_ptr.as_ptr() as *mut GcBox;
                std::ptr::drop_in_place(std::ptr::addr_of_mut!((*box_ptr).data));
            }
            cur = next;
        }
        self.cursor = 0;
        self.head = std::ptr::null_mut();
        self.allocation_count = 0;
    }
}

impl Drop for Nursery {
    fn drop(&mut self) {
        let empty = HashSet::new();
        unsafe { self.sweep_and_reset(&empty) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_until_capacity_then_refuses() {
        let box_size = std::mem::size_of::<GcBox>();
        let mut nursery = Nursery::new(box_size * 2 + std::mem::align_of::<GcBox>());
        let a = nursery.allocate(ObjectKind::Str, HeapObject::Str("a".into()));
        let b = nursery.allocate(ObjectKind::Str, HeapObject::Str("b".into()));
        assert!(a.is_some());
        assert!(b.is_some());
        let c = nursery.allocate(ObjectKind::Str, HeapObject::Str("c".into()));
        assert!(c.is_none(), "nursery should refuse once full");
    }

    #[test]
    fn sweep_and_reset_drops_unpromoted_and_empties_arena() {
        let mut nursery = Nursery::new(DEFAULT_NURSERY_CAPACITY);
        nursery.allocate(ObjectKind::Str, HeapObject::Str("garbage".into()));
        assert_eq!(nursery.allocation_count(), 1);
        unsafe { nursery.sweep_and_reset(&HashSet::new()) };
        assert_eq!(nursery.allocation_count(), 0);
        assert_eq!(nursery.used_bytes(), 0);
    }

    #[test]
    fn iter_headers_visits_every_live_allocation() {
        let mut nursery = Nursery::new(DEFAULT_NURSERY_CAPACITY);
        nursery.allocate(ObjectKind::Str, HeapObject::Str("a".into()));
        nursery.allocate(ObjectKind::Str, HeapObject::Str("b".into()));
        assert_eq!(nursery.iter_headers().count(), 2);
    }
}
