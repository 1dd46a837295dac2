//! `GcRef`: a `Copy` handle to a heap-allocated [`GcBox`].

use crate::gc::header::GcHeader;
use crate::object::{HeapObject, ObjectKind};
use crate::value::Value;
use std::ptr::NonNull;

/// Header + payload, laid out so a `*mut GcHeader` and a `*mut GcBox` to the
/// same allocation share an address (`#[repr(C)]`, header first) — that's
/// what lets the intrusive allocation list store plain `*mut GcHeader` links
/// and still get back to the full object.
#[repr(C)]
pub struct GcBox {
    pub header: GcHeader,
    pub data: HeapObject,
}

/// A handle to a live heap allocation. `Copy`, compares by address, derefs
/// to the underlying [`HeapObject`].
///
/// # Safety
/// A `GcRef` does not keep its referent alive by itself — something must
/// hold it as a root (or it must be reachable from one) or a collection
/// cycle may free it out from under a stale `GcRef`.
#[derive(Clone, Copy)]
pub struct GcRef(NonNull<GcBox>);

impl GcRef {
    /// # Safety
    /// `ptr` must point at a live `GcBox`.
    pub unsafe fn new(ptr: NonNull<GcBox>) -> Self {
        GcRef(ptr)
    }

    #[inline]
    pub fn header(&self) -> &GcHeader {
        unsafe { &self.0.as_ref().header }
    }

    #[inline]
    pub fn data(&self) -> &HeapObject {
        unsafe { &self.0.as_ref().data }
    }

    /// Mutable access to the payload.
    ///
    /// # Safety
    /// The caller must not alias this with another live `&HeapObject` or
    /// `&mut HeapObject` to the same object. Sound here because the VM is
    /// single-mutator (spec.md §5): guest execution never holds two
    /// references into the same object's fields across a call that could
    /// re-enter it.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut HeapObject {
        &mut (*self.0.as_ptr()).data
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.header().kind()
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn as_box_ptr(&self) -> *mut GcBox {
        self.0.as_ptr()
    }

    #[inline]
    pub unsafe fn to_value(self) -> Value {
        Value::from_ptr(self.0)
    }

    /// # Safety
    /// `value` must have been produced from a `GcRef` that is still alive.
    #[inline]
    pub unsafe fn from_value(value: Value) -> Option<Self> {
        value.as_ptr::<GcBox>().map(GcRef)
    }
}

impl std::fmt::Debug for GcRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcRef({:#x}, {:?})", self.addr(), self.kind())
    }
}

impl PartialEq for GcRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for GcRef {}

impl std::hash::Hash for GcRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::header::Generation;

    #[test]
    fn round_trips_through_value() {
        let mut boxed = Box::new(GcBox {
            header: GcHeader::new(ObjectKind::Str, Generation::Young),
            data: HeapObject::Str("hi".into()),
        });
        let ptr = NonNull::new(boxed.as_mut() as *mut GcBox).unwrap();
        let gc_ref = unsafe { GcRef::new(ptr) };
        let value = unsafe { gc_ref.to_value() };
        let back = unsafe { GcRef::from_value(value) }.unwrap();
        assert_eq!(gc_ref, back);
        match back.data() {
            HeapObject::Str(s) => assert_eq!(s, "hi"),
            _ => panic!("wrong kind"),
        }
    }
}
