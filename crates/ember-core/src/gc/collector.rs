//! Generational collector: a bump-allocated young generation promoted by a
//! copying minor collection, and a mark-sweep old generation traced
//! incrementally from a gray stack.

use crate::gc::header::{Generation, GcHeader};
use crate::gc::heap::OldHeap;
use crate::gc::nursery::{Nursery, DEFAULT_NURSERY_CAPACITY};
use crate::gc::ptr::GcRef;
use crate::gc::roots::RootProvider;
use crate::object::{HeapObject, ObjectKind};
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

/// Tunables for the collector, independent of any one `VmOptions` shape so
/// `ember-core` can be embedded without dragging in the whole interpreter.
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub nursery_capacity: usize,
    pub old_gen_growth_factor: f64,
    pub initial_major_threshold: usize,
    /// Objects processed per call to [`Collector::mark_step`].
    pub incremental_work_unit: usize,
    /// Hard cap on old-generation bytes; `None` means unlimited. Exceeding
    /// it after a major collection is a `ResourceExhaustion` error, not a
    /// panic — guest code can trigger this, a VM embedder should be able to
    /// recover from it.
    pub max_old_gen_bytes: Option<usize>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            nursery_capacity: DEFAULT_NURSERY_CAPACITY,
            old_gen_growth_factor: 2.0,
            initial_major_threshold: 256 * 1024,
            incremental_work_unit: 256,
            max_old_gen_bytes: None,
        }
    }
}

/// Cumulative and most-recent-cycle collector statistics, cheap to snapshot.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub minor_collections: usize,
    pub major_collections: usize,
    pub objects_promoted: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
    pub total_pause: Duration,
    pub last_pause: Duration,
}

/// A point-in-time snapshot of heap occupancy.
#[derive(Debug, Clone)]
pub struct HeapStats {
    pub nursery_used: usize,
    pub nursery_capacity: usize,
    pub old_gen_bytes: usize,
    pub old_gen_objects: usize,
}

/// Owns both generations and drives minor/major collection.
pub struct Collector {
    nursery: Nursery,
    old: OldHeap,
    remembered: Vec<*mut GcHeader>,
    config: GcConfig,
    major_threshold: usize,
    gray: Vec<GcRef>,
    stats: GcStats,
}

impl Collector {
    pub fn new(config: GcConfig) -> Self {
        let major_threshold = config.initial_major_threshold;
        Self {
            nursery: Nursery::new(config.nursery_capacity),
            old: OldHeap::new(),
            remembered: Vec::new(),
            config,
            major_threshold,
            gray: Vec::new(),
            stats: GcStats::default(),
        }
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn heap_stats(&self) -> HeapStats {
        HeapStats {
            nursery_used: self.nursery.used_bytes(),
            nursery_capacity: self.nursery.capacity(),
            old_gen_bytes: self.old.allocated_bytes(),
            old_gen_objects: self.old.object_count(),
        }
    }

    /// Allocate a new object, running a minor (and if needed, major)
    /// collection if the nursery is full.
    pub fn allocate(
        &mut self,
        kind: ObjectKind,
        data: HeapObject,
        roots: &mut dyn RootProvider,
    ) -> Result<GcRef, String> {
        self.allocate_and(kind, data, roots, |_| {})
    }

    /// Like [`Collector::allocate`], but runs `weak_tables` after every
    /// minor or major collection this call triggers — not only the one a
    /// caller drives explicitly via `minor_collect_and`/`major_collect_and`.
    /// A weak table (e.g. a string intern map) only sees every collection
    /// that could invalidate it if it hooks in here, since an allocation
    /// can itself trigger a collection before the caller gets control back.
    pub fn allocate_and(
        &mut self,
        kind: ObjectKind,
        data: HeapObject,
        roots: &mut dyn RootProvider,
        mut weak_tables: impl FnMut(&dyn Fn(Value) -> Option<Value>),
    ) -> Result<GcRef, String> {
        if self.nursery.has_room() {
            return Ok(self
                .nursery
                .allocate(kind, data)
                .expect("has_room just confirmed capacity"));
        }
        self.minor_collect_and(roots, &mut weak_tables);
        if let Some(max) = self.config.max_old_gen_bytes {
            if self.old.allocated_bytes() > max {
                self.major_collect_and(roots, &mut weak_tables);
                if self.old.allocated_bytes() > max {
                    return Err(format!(
                        "heap exhausted: {} bytes allocated, limit is {} bytes",
                        self.old.allocated_bytes(),
                        max
                    ));
                }
            }
        }
        self.nursery
            .allocate(kind, data)
            .ok_or_else(|| "nursery cannot hold a single object of this size".to_string())
    }

    /// Dijkstra insertion write barrier: record `owner` in the remembered
    /// set whenever it is an old-generation object and the value it just
    /// received points into the young generation. Every mutating field
    /// write in the interpreter and native bridge funnels through this.
    pub fn write_barrier(&mut self, owner: GcRef, new_child: Value) {
        if owner.header().generation() != Generation::Old {
            return;
        }
        let Some(child_ref) = (unsafe { GcRef::from_value(new_child) }) else {
            return;
        };
        if child_ref.header().generation() != Generation::Young {
            return;
        }
        let header_ptr = owner.as_box_ptr() as *mut GcHeader;
        if !self.remembered.contains(&header_ptr) {
            self.remembered.push(header_ptr);
        }
    }

    /// Copying collection of the young generation: every object reachable
    /// from `roots` or from a remembered old-generation field is moved into
    /// the old generation; everything else left in the nursery is garbage
    /// and is dropped when the arena resets.
    pub fn minor_collect(&mut self, roots: &mut dyn RootProvider) {
        self.minor_collect_and(roots, |_| {});
    }

    /// Like [`Collector::minor_collect`], but runs `weak_table_fixup` with a
    /// lookup closure once every survivor has been forwarded and before the
    /// nursery is swept: `lookup(v)` returns `Some` of `v` unchanged for a
    /// non-pointer or an old-generation value, `Some` of the forwarded value
    /// for a promoted young object, and `None` for a young object that did
    /// not survive this collection. A weak table (not itself traced as a
    /// root, e.g. the string intern map) uses this to forward its surviving
    /// entries and drop the rest, the same way it uses `major_collect_and`'s
    /// hook for a major collection.
    pub fn minor_collect_and(
        &mut self,
        roots: &mut dyn RootProvider,
        mut weak_table_fixup: impl FnMut(&dyn Fn(Value) -> Option<Value>),
    ) {
        let start = Instant::now();
        let mut forwarding: FxHashMap<usize, GcRef> = FxHashMap::default();
        let mut worklist: Vec<Value> = Vec::new();

        roots.for_each_root(&mut |v| worklist.push(v));
        for &header_ptr in &self.remembered {
            let gc_ref = unsafe { GcRef::new(std::ptr::NonNull::new_unchecked(header_ptr as *mut crate::gc::ptr::GcBox)) };
            gc_ref.data().trace(|v| worklist.push(v));
        }

        while let Some(v) = worklist.pop() {
            let Some(gc_ref) = (unsafe { GcRef::from_value(v) }) else {
                continue;
            };
            if gc_ref.header().generation() != Generation::Young {
                continue;
            }
            let addr = gc_ref.addr();
            if forwarding.contains_key(&addr) {
                continue;
            }
            // Move header + data out of the nursery slot without running
            // drop glue; the nursery's reset pass will skip this address.
            let box_ptr = gc_ref.as_box_ptr();
            let (header, data) = unsafe {
                let b = std::ptr::read(box_ptr);
                (b.header, b.data)
            };
            header.unmark();
            data.trace(|child| worklist.push(child));
            let new_ref = self.old.adopt(header, data);
            forwarding.insert(addr, new_ref);
            self.stats.objects_promoted += 1;
        }

        // Fix up every pointer that referenced a forwarded address: roots,
        // remembered-set objects' own fields, and the newly promoted
        // objects' fields (which are bit-copies of the pre-promotion data).
        let forward_one = |v: &mut Value, forwarding: &FxHashMap<usize, GcRef>| {
            if let Some(gc_ref) = unsafe { GcRef::from_value(*v) } {
                if let Some(&new_ref) = forwarding.get(&gc_ref.addr()) {
                    *v = unsafe { new_ref.to_value() };
                }
            }
        };

        roots.for_each_root_mut(&mut |v| forward_one(v, &forwarding));
        for &header_ptr in &self.remembered {
            let gc_ref = unsafe { GcRef::new(std::ptr::NonNull::new_unchecked(header_ptr as *mut crate::gc::ptr::GcBox)) };
            let data = unsafe { &mut *(gc_ref.as_box_ptr()) };
            data.data.retrace_mut(|v| forward_one(v, &forwarding));
        }
        for &new_ref in forwarding.values() {
            let data = unsafe { &mut *(new_ref.as_box_ptr()) };
            data.data.retrace_mut(|v| forward_one(v, &forwarding));
        }

        let lookup = |v: Value| -> Option<Value> {
            let Some(gc_ref) = (unsafe { GcRef::from_value(v) }) else {
                return Some(v);
            };
            if gc_ref.header().generation() != Generation::Young {
                return Some(v);
            }
            forwarding.get(&gc_ref.addr()).map(|&new_ref| unsafe { new_ref.to_value() })
        };
        weak_table_fixup(&lookup);

        let promoted: std::collections::HashSet<usize> = forwarding.keys().copied().collect();
        unsafe { self.nursery.sweep_and_reset(&promoted) };

        // Old->young edges are only meaningful while the young generation
        // they point into is still alive; it's empty again now.
        self.remembered.clear();

        self.stats.minor_collections += 1;
        self.stats.last_pause = start.elapsed();
        self.stats.total_pause += self.stats.last_pause;
    }

    /// Seed the gray stack from every pointer root and run the mark phase
    /// to completion, then sweep. Runs a minor collection first so the
    /// trace only has to consider a single generation.
    pub fn major_collect(&mut self, roots: &mut dyn RootProvider) {
        self.major_collect_and(roots, |_| {});
    }

    /// Like [`Collector::major_collect`], but runs `between_mark_and_sweep`
    /// once marking reaches a fixed point and before anything is swept. The
    /// string intern table uses this to drop entries whose object didn't
    /// mark (weak-table semantics, spec.md §4.2 Roots (e)) without itself
    /// ever being traced as a root.
    pub fn major_collect_and(
        &mut self,
        roots: &mut dyn RootProvider,
        mut between_mark_and_sweep: impl FnMut(&dyn Fn(Value) -> Option<Value>),
    ) {
        let start = Instant::now();
        self.minor_collect_and(roots, &mut between_mark_and_sweep);

        self.old.unmark_all();
        self.gray.clear();
        roots.for_each_root(&mut |v| {
            if let Some(gc_ref) = unsafe { GcRef::from_value(v) } {
                self.gray.push(gc_ref);
            }
        });

        while !self.mark_step(usize::MAX) {}

        let lookup = |v: Value| if self.is_marked(v) { Some(v) } else { None };
        between_mark_and_sweep(&lookup);

        let (freed, freed_bytes) = self.old.sweep();
        self.stats.major_collections += 1;
        self.stats.objects_freed += freed;
        self.stats.bytes_freed += freed_bytes;
        self.stats.last_pause = start.elapsed();
        self.stats.total_pause += self.stats.last_pause;

        let usage = self.old.allocated_bytes();
        self.major_threshold =
            ((usage as f64 * self.config.old_gen_growth_factor) as usize).max(self.config.initial_major_threshold);
    }

    /// Tri-color mark step: pop up to `budget` gray objects, mark each,
    /// and push their unmarked children. Returns `true` once the gray
    /// stack is empty (marking is complete). Exposed directly so a caller
    /// that wants to interleave marking with guest execution can drive it
    /// a slice at a time instead of calling `major_collect`'s blocking loop.
    pub fn mark_step(&mut self, budget: usize) -> bool {
        let mut processed = 0;
        while processed < budget {
            let Some(gc_ref) = self.gray.pop() else {
                return true;
            };
            if gc_ref.header().is_marked() {
                continue;
            }
            gc_ref.header().mark();
            gc_ref.data().trace(|child| {
                if let Some(child_ref) = unsafe { GcRef::from_value(child) } {
                    if !child_ref.header().is_marked() {
                        self.gray.push(child_ref);
                    }
                }
            });
            processed += 1;
        }
        self.gray.is_empty()
    }

    pub fn should_major_collect(&self) -> bool {
        self.old.allocated_bytes() > self.major_threshold
    }

    /// Whether `v` is a heap pointer whose object is currently marked.
    /// Non-pointer values (and values whose object was never traced, e.g.
    /// before the first mark phase) report `true`, since only a completed
    /// mark phase makes "unmarked" meaningful.
    pub fn is_marked(&self, v: Value) -> bool {
        match unsafe { GcRef::from_value(v) } {
            Some(gc_ref) => gc_ref.header().is_marked(),
            None => true,
        }
    }

    pub fn nursery_capacity(&self) -> usize {
        self.nursery.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::roots::RootSet;

    fn string_obj(s: &str) -> HeapObject {
        HeapObject::Str(s.to_string())
    }

    #[test]
    fn allocation_survives_in_nursery_until_minor_collect() {
        let mut gc = Collector::new(GcConfig::default());
        let mut roots = RootSet::new();
        let obj = gc.allocate(ObjectKind::Str, string_obj("hi"), &mut roots).unwrap();
        assert_eq!(obj.header().generation(), Generation::Young);
    }

    #[test]
    fn rooted_object_is_promoted_by_minor_collect() {
        let mut gc = Collector::new(GcConfig::default());
        let mut roots = RootSet::new();
        let obj = gc.allocate(ObjectKind::Str, string_obj("hi"), &mut roots).unwrap();
        roots.push(unsafe { obj.to_value() });

        gc.minor_collect(&mut roots);
        assert_eq!(gc.stats().minor_collections, 1);
        assert_eq!(gc.stats().objects_promoted, 1);

        // the root should have been forwarded to point at the promoted copy
        let root_value = unsafe {
            let mut found = None;
            roots.for_each_root(&mut |v| found = Some(v));
            found.unwrap()
        };
        let forwarded = unsafe { GcRef::from_value(root_value) }.unwrap();
        assert_eq!(forwarded.header().generation(), Generation::Old);
        match forwarded.data() {
            HeapObject::Str(s) => assert_eq!(s, "hi"),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn unrooted_object_is_dropped_not_promoted() {
        let mut gc = Collector::new(GcConfig::default());
        let mut roots = RootSet::new();
        gc.allocate(ObjectKind::Str, string_obj("garbage"), &mut roots).unwrap();
        gc.minor_collect(&mut roots);
        assert_eq!(gc.stats().objects_promoted, 0);
        assert_eq!(gc.heap_stats().old_gen_objects, 0);
    }

    #[test]
    fn major_collect_frees_unreachable_old_gen_objects() {
        let mut gc = Collector::new(GcConfig::default());
        let mut roots = RootSet::new();

        let kept = gc.allocate(ObjectKind::Str, string_obj("kept"), &mut roots).unwrap();
        roots.push(unsafe { kept.to_value() });
        gc.allocate(ObjectKind::Str, string_obj("doomed"), &mut roots).unwrap();

        gc.minor_collect(&mut roots);
        assert_eq!(gc.heap_stats().old_gen_objects, 1, "only the rooted object promotes");

        // promote a second, unrooted-after-this-point object directly into old gen
        gc.allocate(ObjectKind::Str, string_obj("doomed2"), &mut roots).unwrap();
        gc.minor_collect(&mut roots);

        gc.major_collect(&mut roots);
        assert_eq!(gc.heap_stats().old_gen_objects, 1);
    }

    #[test]
    fn write_barrier_records_old_to_young_edges() {
        let mut gc = Collector::new(GcConfig::default());
        let mut roots = RootSet::new();
        let old_obj = gc.allocate(ObjectKind::Str, string_obj("old"), &mut roots).unwrap();
        roots.push(unsafe { old_obj.to_value() });
        gc.minor_collect(&mut roots);
        let old_obj = unsafe {
            let mut found = None;
            roots.for_each_root(&mut |v| found = Some(v));
            GcRef::from_value(found.unwrap()).unwrap()
        };
        assert_eq!(old_obj.header().generation(), Generation::Old);

        let young = gc.allocate(ObjectKind::Str, string_obj("young"), &mut roots).unwrap();
        gc.write_barrier(old_obj, unsafe { young.to_value() });
        assert_eq!(gc.remembered.len(), 1);

        // the barrier-stress scenario: the young object survives a minor
        // collect purely because the old object remembers it, with no
        // direct root pinning it.
        gc.minor_collect(&mut roots);
        assert_eq!(gc.stats().objects_promoted, 2);
    }

    #[test]
    fn mark_step_can_run_incrementally() {
        let mut gc = Collector::new(GcConfig::default());
        let mut roots = RootSet::new();
        let a = gc.allocate(ObjectKind::Str, string_obj("a"), &mut roots).unwrap();
        roots.push(unsafe { a.to_value() });
        gc.allocate(ObjectKind::Str, string_obj("b"), &mut roots).unwrap();
        gc.minor_collect(&mut roots);

        gc.old.unmark_all();
        gc.gray.clear();
        roots.for_each_root(&mut |v| {
            if let Some(r) = unsafe { GcRef::from_value(v) } {
                gc.gray.push(r);
            }
        });
        assert!(!gc.mark_step(0), "budget of 0 makes no progress");
        let done = gc.mark_step(1);
        assert!(done);
    }
}
