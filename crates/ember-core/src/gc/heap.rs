//! Old generation: a conventional `Box`-per-object heap, threaded through
//! the same intrusive allocation list shape as the nursery so the collector
//! can walk either with the same iterator pattern.

use crate::gc::header::{Generation, GcHeader};
use crate::gc::ptr::{GcBox, GcRef};
use crate::object::{HeapObject, ObjectKind};
use std::ptr::NonNull;

pub struct OldHeap {
    head: *mut GcHeader,
    allocated_bytes: usize,
    object_count: usize,
}

impl OldHeap {
    pub fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            allocated_bytes: 0,
            object_count: 0,
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    pub fn allocate(&mut self, kind: ObjectKind, data: HeapObject) -> GcRef {
        let header = GcHeader::new(kind, Generation::Old);
        header.set_next(self.head);
        let boxed = Box::new(GcBox { header, data });
        let raw = Box::into_raw(boxed);
        self.head = unsafe { std::ptr::addr_of_mut!((*raw).header) };
        self.allocated_bytes += std::mem::size_of::<GcBox>();
        self.object_count += 1;
        let non_null = NonNull::new(raw).expect("Box::into_raw is never null");
        unsafe { GcRef::new(non_null) }
    }

    /// Adopt an allocation that already exists elsewhere (used when
    /// promoting a surviving nursery object: its `GcBox` is moved, not
    /// re-allocated-and-copied field by field, so nested pointers inside it
    /// stay valid without a separate rewrite of their bits).
    pub fn adopt(&mut self, header: GcHeader, data: HeapObject) -> GcRef {
        header.set_generation(Generation::Old);
        header.set_next(self.head);
        let boxed = Box::new(GcBox { header, data });
        let raw = Box::into_raw(boxed);
        self.head = unsafe { std::ptr::addr_of_mut!((*raw).header) };
        self.allocated_bytes += std::mem::size_of::<GcBox>();
        self.object_count += 1;
        let non_null = NonNull::new(raw).expect("Box::into_raw is never null");
        unsafe { GcRef::new(non_null) }
    }

    pub fn iter_headers(&self) -> impl Iterator<Item = NonNull<GcHeader>> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let ptr = NonNull::new(cur)?;
            cur = unsafe { ptr.as_ref().next() };
            Some(ptr)
        })
    }

    /// Clear every mark bit ahead of a fresh trace.
    pub fn unmark_all(&self) {
        for header in self.iter_headers() {
            unsafe { header.as_ref().unmark() };
        }
    }

    /// Free every unmarked object, relinking the list around the survivors.
    /// Returns `(objects_freed, bytes_freed)`.
    pub fn sweep(&mut self) -> (usize, usize) {
        let mut freed = 0;
        let mut freed_bytes = 0;
        let mut new_head: *mut GcHeader = std::ptr::null_mut();
        let mut cur = self.head;

        // Walk oldest-link-order, rebuilding the list of survivors. Order
        // doesn't matter for correctness (the list has no other meaning),
        // only liveness does.
        let mut survivors: Vec<*mut GcHeader> = Vec::new();
        while let Some(header_ptr) = NonNull::new(cur) {
            let next = unsafe { header_ptr.as_ref().next() };
            if unsafe { header_ptr.as_ref().is_marked() } {
                survivors.push(header_ptr.as_ptr());
            } else {
                let box_ptr = header_ptr.as_ptr() as *mut GcBox;
                unsafe {
                    std::ptr::drop_in_place(box_ptr);
                    drop(Box::from_raw(box_ptr));
                }
                freed += 1;
                freed_bytes += std::mem::size_of::<GcBox>();
            }
            cur = next;
        }

        for &header_ptr in survivors.iter().rev() {
            unsafe { (*header_ptr).set_next(new_head) };
            new_head = header_ptr;
        }
        self.head = new_head;
        self.allocated_bytes -= freed_bytes;
        self.object_count -= freed;
        (freed, freed_bytes)
    }
}

impl Default for OldHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OldHeap {
    fn drop(&mut self) {
        let mut cur = self.head;
        while let Some(header_ptr) = NonNull::new(cur) {
            let next = unsafe { header_ptr.as_ref().next() };
            let box_ptr = header_ptr.as_ptr() as *mut GcBox;
            unsafe { drop(Box::from_raw(box_ptr)) };
            cur = next;
        }
    }
}
