// Incremental tri-color mark-sweep collector.
//
// Phase machine: Pause -> Propagate -> PropagateAgain -> Atomic ->
// Sweep -> Pause. Propagation grays->blackens one object per work
// unit; PropagateAgain drains the list built by backward barriers;
// Atomic rescans roots and thread stacks, resolves weak tables and
// flips the current white; Sweep walks the pool incrementally, freeing
// other-white objects and re-whitening survivors.
//
// Invariant: while the phase is Pause/Propagate/PropagateAgain/Atomic,
// no black object references a white one. Thread stacks and open
// upvalues are exempted by never being blackened; tables restore the
// invariant through the backward barrier, everything else through the
// forward barrier.

mod gc_id;
mod gc_object;
mod heap_dump;
mod object_allocator;
mod string_interner;

pub use gc_id::*;
pub use gc_object::*;
pub use heap_dump::{HeapEdge, HeapNode, assert_heap_valid, enumerate, heap_snapshot, validate_heap};
pub use object_allocator::{CreateResult, ObjectAllocator};
pub use string_interner::StringInterner;

use crate::value::Value;
use crate::vm::{Control, Proto, VmResult};

/// Number of memory categories available for per-subsystem accounting.
pub const MEMORY_CATEGORIES: usize = 256;

/// Default collector tuning: start a cycle when the heap grows to
/// `pause_percent`% of the live size estimate after the last cycle, and
/// process `step_mul` work units per KB of allocation debt.
pub const DEFAULT_PAUSE_PERCENT: u32 = 200;
pub const DEFAULT_STEP_MUL: u32 = 200;
pub const DEFAULT_STEP_SIZE: usize = 1024;
const INITIAL_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Pause,
    Propagate,
    PropagateAgain,
    Atomic,
    Sweep,
}

impl GcPhase {
    /// Whether the black->white invariant must hold right now.
    #[inline(always)]
    pub fn keep_invariant(self) -> bool {
        !matches!(self, GcPhase::Sweep)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub cycles: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
}

pub struct Gc {
    /// All heap objects live here.
    pub pool: GcPool,

    pub phase: GcPhase,
    /// Current white (0 or 1); flips at every atomic phase.
    pub current_white: u8,

    /// Gray worklist.
    gray: Vec<GcId>,
    /// Objects to revisit at PropagateAgain/Atomic: backward-barrier
    /// targets, threads, open upvalues.
    grayagain: Vec<GcId>,

    /// Weak-value tables found during marking.
    weak: Vec<TableId>,
    /// Weak-key (ephemeron) tables.
    ephemeron: Vec<TableId>,
    /// Fully weak tables.
    allweak: Vec<TableId>,

    /// Position of the incremental sweep in the pool.
    sweep_cursor: usize,

    /// Total live bytes (estimates, kept in sync at alloc/free).
    total_bytes: usize,
    /// Allocation threshold that starts the next cycle.
    threshold: usize,
    /// Per-category byte counters.
    memcat_bytes: Vec<usize>,

    /// Hard allocation ceiling; crossing it is OutOfMemory.
    pub memory_limit: usize,
    /// Collector stopped by the host; allocation still tracked.
    pub stopped: bool,

    pub pause_percent: u32,
    pub step_mul: u32,
    pub step_size: usize,

    /// Pinned "__mode" key used to classify weak tables.
    mode_key: Option<Value>,

    pub stats: GcStats,
}

impl Gc {
    pub fn new() -> Self {
        Self {
            pool: GcPool::new(),
            phase: GcPhase::Pause,
            current_white: 0,
            gray: Vec::with_capacity(128),
            grayagain: Vec::with_capacity(64),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            sweep_cursor: 0,
            total_bytes: 0,
            threshold: INITIAL_THRESHOLD,
            memcat_bytes: vec![0; MEMORY_CATEGORIES],
            memory_limit: usize::MAX,
            stopped: false,
            pause_percent: DEFAULT_PAUSE_PERCENT,
            step_mul: DEFAULT_STEP_MUL,
            step_size: DEFAULT_STEP_SIZE,
            mode_key: None,
            stats: GcStats::default(),
        }
    }

    /// Install the pinned "__mode" string; called once at VM init.
    pub fn set_mode_key(&mut self, key: Value) {
        self.mode_key = Some(key);
    }

    // ============ Accounting ============

    #[inline]
    pub fn check_memory(&self, size: usize) -> VmResult<()> {
        if self.total_bytes.saturating_add(size) > self.memory_limit {
            return Err(Control::OutOfMemory);
        }
        Ok(())
    }

    /// Register a freshly allocated object and charge its category.
    pub fn register(&mut self, obj: GcObject) -> u32 {
        let size = obj.size();
        let memcat = obj.header.memcat as usize;
        self.total_bytes += size;
        self.memcat_bytes[memcat] += size;
        self.pool.alloc(obj)
    }

    /// Re-charge an object whose payload grew or shrank (tables resize,
    /// thread stacks grow).
    pub fn resize_object(&mut self, id: GcId, new_size: usize) {
        let header = self.pool.header_mut(id);
        let old = header.size as usize;
        let memcat = header.memcat as usize;
        header.size = new_size as u32;
        self.memcat_bytes[memcat] = self.memcat_bytes[memcat].saturating_sub(old) + new_size;
        self.total_bytes = self.total_bytes.saturating_sub(old) + new_size;
    }

    #[inline(always)]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[inline(always)]
    pub fn memcat_bytes(&self, cat: u8) -> usize {
        self.memcat_bytes[cat as usize]
    }

    /// Pin a string forever (type names, tag-method names). Pinned
    /// strings are blackened once and skipped by the sweep.
    pub fn fix_string(&mut self, id: StringId) {
        let header = self.pool.header_mut(GcId::String(id));
        header.set_fixed();
        header.make_black();
    }

    /// Pin any object as a permanent root (the registry table).
    pub fn fix_object(&mut self, id: GcId) {
        self.pool.header_mut(id).set_fixed();
    }

    // ============ Stepping ============

    /// Whether a safe point should invest GC work.
    #[inline]
    pub fn needs_work(&self) -> bool {
        !self.stopped && (self.phase != GcPhase::Pause || self.total_bytes >= self.threshold)
    }

    /// One bounded increment of collection. `roots` must cover every
    /// value reachable from outside the pool.
    pub fn step(&mut self, roots: &[Value], allocator: &mut ObjectAllocator) {
        if self.stopped {
            return;
        }
        let budget = (self.step_size / 64).max(8) * (self.step_mul as usize).max(1) / 100;
        let budget = budget.max(8);
        self.step_budgeted(roots, allocator, budget);
    }

    fn step_budgeted(&mut self, roots: &[Value], allocator: &mut ObjectAllocator, budget: usize) {
        match self.phase {
            GcPhase::Pause => {
                self.start_cycle(roots);
            }
            GcPhase::Propagate => {
                let mut work = 0;
                while work < budget {
                    if self.gray.is_empty() {
                        self.phase = GcPhase::PropagateAgain;
                        #[cfg(feature = "gc_logging")]
                        tracing::debug!(target: "cinder_gc", "phase -> PropagateAgain");
                        // Barrier targets accumulated so far become the
                        // new worklist; more may arrive while we drain.
                        self.gray = std::mem::take(&mut self.grayagain);
                        break;
                    }
                    self.propagate_one(false);
                    work += 1;
                }
            }
            GcPhase::PropagateAgain => {
                let mut work = 0;
                while work < budget {
                    if self.gray.is_empty() {
                        self.atomic(roots);
                        return;
                    }
                    self.propagate_one(false);
                    work += 1;
                }
            }
            GcPhase::Atomic => unreachable!("atomic phase never persists across steps"),
            GcPhase::Sweep => {
                self.sweep_step(allocator, budget);
            }
        }
    }

    /// Run a full collection to completion: finish any cycle in flight,
    /// then run one complete fresh cycle.
    pub fn collect_full(&mut self, roots: &[Value], allocator: &mut ObjectAllocator) {
        if self.stopped {
            return;
        }
        if self.phase != GcPhase::Pause {
            self.finish_cycle(roots, allocator);
        }
        self.start_cycle(roots);
        self.finish_cycle(roots, allocator);
    }

    fn finish_cycle(&mut self, roots: &[Value], allocator: &mut ObjectAllocator) {
        while self.phase != GcPhase::Pause {
            self.step_budgeted(roots, allocator, usize::MAX);
        }
    }

    fn start_cycle(&mut self, roots: &[Value]) {
        debug_assert!(self.phase == GcPhase::Pause);
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.ephemeron.clear();
        self.allweak.clear();
        for v in roots {
            self.mark_value(*v);
        }
        self.phase = GcPhase::Propagate;
        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "cinder_gc", roots = roots.len(), "phase -> Propagate");
    }

    // ============ Marking ============

    #[inline]
    pub fn mark_value(&mut self, v: Value) {
        if let Some(id) = v.gc_id() {
            self.mark_object(id);
        }
    }

    pub fn mark_object(&mut self, id: GcId) {
        let Some(obj) = self.pool.get_mut(id.index()) else {
            return;
        };
        if !obj.header.is_white() {
            return;
        }
        match &obj.data {
            // Leaves with no children blacken immediately.
            GcData::Str(_) | GcData::Buffer(_) => obj.header.make_black(),
            _ => {
                obj.header.make_gray();
                self.gray.push(id);
            }
        }
    }

    /// Gray -> black one object, graying its white children. Threads
    /// and open upvalues stay gray: their content mutates without
    /// barriers, so they are revisited at the atomic phase instead.
    fn propagate_one(&mut self, in_atomic: bool) {
        let Some(id) = self.gray.pop() else { return };
        if !self.pool.contains(id) {
            return;
        }
        match id {
            GcId::Table(tid) => self.traverse_table(tid),
            GcId::Function(fid) => {
                self.traverse_closure(fid);
                self.pool.header_mut(id).make_black();
            }
            GcId::Upvalue(uid) => {
                let closed_value = match self.pool.upvalue(uid) {
                    Upvalue::Closed(v) => Some(*v),
                    Upvalue::Open { .. } => None,
                };
                match closed_value {
                    Some(v) => {
                        self.mark_value(v);
                        self.pool.header_mut(id).make_black();
                    }
                    // Open: the aliased slot is marked through the owning
                    // thread; never blacken while open.
                    None if !in_atomic => self.grayagain.push(id),
                    None => {}
                }
            }
            GcId::Thread(tid) => {
                self.traverse_thread(tid);
                if !in_atomic {
                    self.grayagain.push(id);
                }
            }
            GcId::Userdata(uid) => {
                if let Some(mt) = self.pool.userdata(uid).metatable {
                    self.mark_object(GcId::Table(mt));
                }
                self.pool.header_mut(id).make_black();
            }
            GcId::String(_) | GcId::Buffer(_) => {
                self.pool.header_mut(id).make_black();
            }
        }
    }

    /// Weakness of a table, from its metatable's __mode string.
    fn table_weakness(&self, tid: TableId) -> (bool, bool) {
        let Some(mode_key) = self.mode_key else {
            return (false, false);
        };
        let Some(mt) = self.pool.table(tid).metatable else {
            return (false, false);
        };
        let mode = self.pool.table(mt).get(&mode_key);
        let Some(sid) = mode.as_string_id() else {
            return (false, false);
        };
        let bytes = &self.pool.string(sid).bytes;
        (bytes.contains(&b'k'), bytes.contains(&b'v'))
    }

    fn traverse_table(&mut self, tid: TableId) {
        let (weak_keys, weak_values) = self.table_weakness(tid);
        let mt = self.pool.table(tid).metatable;
        if let Some(mt) = mt {
            self.mark_object(GcId::Table(mt));
        }
        let id = GcId::Table(tid);
        match (weak_keys, weak_values) {
            (false, false) => {
                let mut pending: Vec<Value> = Vec::new();
                {
                    let table = self.pool.table(tid);
                    pending.extend(table.iter_array().filter(|v| v.is_collectible()).copied());
                    for (k, v) in table.iter_entries() {
                        if k.is_collectible() {
                            pending.push(k);
                        }
                        if v.is_collectible() {
                            pending.push(v);
                        }
                    }
                }
                for v in pending {
                    self.mark_value(v);
                }
                self.pool.header_mut(id).make_black();
            }
            (false, true) => {
                // Weak values: keys stay strong.
                let keys: Vec<Value> = self
                    .pool
                    .table(tid)
                    .iter_entries()
                    .map(|(k, _)| k)
                    .filter(|k| k.is_collectible())
                    .collect();
                for k in keys {
                    self.mark_value(k);
                }
                self.weak.push(tid);
                self.pool.header_mut(id).make_black();
            }
            (true, false) => {
                // Ephemeron: values marked only for live keys, resolved
                // at the atomic phase.
                self.ephemeron.push(tid);
                self.pool.header_mut(id).make_black();
            }
            (true, true) => {
                self.allweak.push(tid);
                self.pool.header_mut(id).make_black();
            }
        }
    }

    fn mark_proto(&mut self, proto: &Proto) {
        for v in &proto.constants {
            if let Some(cid) = v.gc_id() {
                self.mark_object(cid);
            }
        }
        for child in &proto.protos {
            self.mark_proto(child);
        }
    }

    fn traverse_closure(&mut self, fid: FunctionId) {
        enum Kids {
            Script(std::rc::Rc<Proto>, Vec<UpvalueId>),
            Native(Vec<Value>),
        }
        let kids = match self.pool.closure(fid) {
            Closure::Script { proto, upvalues } => Kids::Script(proto.clone(), upvalues.clone()),
            Closure::Native { upvalues, .. } => Kids::Native(upvalues.clone()),
        };
        match kids {
            Kids::Script(proto, upvalues) => {
                self.mark_proto(&proto);
                for uv in upvalues {
                    self.mark_object(GcId::Upvalue(uv));
                }
            }
            Kids::Native(upvalues) => {
                for v in upvalues {
                    self.mark_value(v);
                }
            }
        }
    }

    fn traverse_thread(&mut self, tid: ThreadId) {
        let mut pending: Vec<Value> = Vec::new();
        let mut upvals: Vec<UpvalueId> = Vec::new();
        {
            let thread = self.pool.thread(tid);
            pending.extend(thread.stack.iter().filter(|v| v.is_collectible()).copied());
            pending.push(thread.entry);
            pending.push(thread.pending_error);
            for ci in &thread.frames {
                pending.push(ci.func);
                pending.extend(ci.varargs.iter().filter(|v| v.is_collectible()).copied());
            }
            upvals.extend(thread.open_upvalues.iter().map(|&(_, uv)| uv));
        }
        for v in pending {
            self.mark_value(v);
        }
        for uv in upvals {
            self.mark_object(GcId::Upvalue(uv));
        }
    }

    // ============ Atomic ============

    /// Non-incremental turn: rescan roots and every thread touched so
    /// far, settle ephemerons, clear weak tables, flip the white and
    /// enter Sweep. The mutator never observes the intermediate states.
    fn atomic(&mut self, roots: &[Value]) {
        self.phase = GcPhase::Atomic;
        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "cinder_gc", "phase -> Atomic");

        for v in roots {
            self.mark_value(*v);
        }
        // Re-traverse barrier targets, threads and open upvalues.
        let again = std::mem::take(&mut self.grayagain);
        self.gray.extend(again);
        self.drain_gray();

        // Ephemerons: a value is live once its key is proven live.
        loop {
            let mut changed = false;
            let ephemerons = self.ephemeron.clone();
            for tid in ephemerons {
                if !self.pool.contains(GcId::Table(tid)) {
                    continue;
                }
                let entries: Vec<(Value, Value)> = self.pool.table(tid).iter_entries().collect();
                for (k, v) in entries {
                    let key_live = match k.gc_id() {
                        Some(kid) => !self.pool.header(kid).is_white(),
                        None => true,
                    };
                    if key_live {
                        if let Some(vid) = v.gc_id() {
                            if self.pool.header(vid).is_white() {
                                self.mark_object(vid);
                                changed = true;
                            }
                        }
                    }
                }
            }
            self.drain_gray();
            if !changed {
                break;
            }
        }

        // Clear dead entries from weak tables while the dead set is
        // still identifiable (white = unmarked this cycle).
        let weak = std::mem::take(&mut self.weak);
        let ephemeron = std::mem::take(&mut self.ephemeron);
        let allweak = std::mem::take(&mut self.allweak);
        for tid in weak {
            self.clear_weak(tid, false, true);
        }
        for tid in ephemeron {
            self.clear_weak(tid, true, false);
        }
        for tid in allweak {
            self.clear_weak(tid, true, true);
        }

        // Flip: everything marked survives the sweep; survivors are
        // re-whitened into the new cycle's color.
        self.current_white ^= 1;
        self.sweep_cursor = 0;
        self.phase = GcPhase::Sweep;
        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "cinder_gc", "phase -> Sweep");
    }

    fn drain_gray(&mut self) {
        while !self.gray.is_empty() {
            self.propagate_one(true);
        }
    }

    fn clear_weak(&mut self, tid: TableId, weak_keys: bool, weak_values: bool) {
        if !self.pool.contains(GcId::Table(tid)) {
            return;
        }
        // Split borrow: headers are read through a raw snapshot of the
        // dead set to keep the table mutation single-pass.
        let mut dead: Vec<GcId> = Vec::new();
        {
            let table = self.pool.table(tid);
            let mut note = |v: &Value| {
                if let Some(id) = v.gc_id() {
                    dead.push(id);
                }
            };
            for v in table.iter_array() {
                note(v);
            }
            for (k, v) in table.iter_entries() {
                note(&k);
                note(&v);
            }
        }
        dead.retain(|id| match self.pool.get(id.index()) {
            Some(obj) => obj.header.is_white() && !obj.header.is_fixed(),
            None => true,
        });
        let dead_set: std::collections::HashSet<GcId> = dead.into_iter().collect();
        self.pool
            .table_mut(tid)
            .clear_dead_entries(weak_keys, weak_values, |id| dead_set.contains(&id));
    }

    // ============ Sweep ============

    fn sweep_step(&mut self, allocator: &mut ObjectAllocator, budget: usize) {
        let other_white = self.current_white ^ 1;
        let mut visited = 0;
        while visited < budget {
            let Some((id, obj)) = self.pool.get_index_mut(self.sweep_cursor) else {
                // Pool exhausted: cycle complete.
                self.stats.cycles += 1;
                self.phase = GcPhase::Pause;
                self.threshold = (self.total_bytes / 100)
                    .saturating_mul(self.pause_percent as usize)
                    .max(INITIAL_THRESHOLD);
                #[cfg(feature = "gc_logging")]
                tracing::debug!(
                    target: "cinder_gc",
                    live_bytes = self.total_bytes,
                    threshold = self.threshold,
                    "phase -> Pause"
                );
                return;
            };
            visited += 1;
            let header = obj.header;
            if header.is_fixed() {
                self.sweep_cursor += 1;
                continue;
            }
            if header.is_dead(other_white) {
                // Pinned strings survive regardless of color.
                if let GcData::Str(s) = &obj.data {
                    if s.pins > 0 {
                        obj.header.make_white(self.current_white);
                        self.sweep_cursor += 1;
                        continue;
                    }
                    let sid = StringId(id);
                    let hash = s.hash;
                    allocator.unlink_string(sid, hash);
                }
                let size = self.pool.free_at_index(self.sweep_cursor);
                let memcat = header.memcat as usize;
                self.total_bytes = self.total_bytes.saturating_sub(size);
                self.memcat_bytes[memcat] = self.memcat_bytes[memcat].saturating_sub(size);
                self.stats.objects_freed += 1;
                self.stats.bytes_freed += size;
                // cursor stays: the tail object now occupies this slot
            } else {
                obj.header.make_white(self.current_white);
                self.sweep_cursor += 1;
            }
        }
    }

    // ============ Write barriers ============

    /// Forward barrier: a black parent just stored a reference to a
    /// white child; mark the child now. Outside the invariant phases
    /// the store is harmless.
    pub fn barrier_forward(&mut self, parent: GcId, child: GcId) {
        if !self.phase.keep_invariant() {
            return;
        }
        if self.pool.header(parent).is_black() && self.pool.header(child).is_white() {
            self.mark_object(child);
        }
    }

    /// Backward barrier: re-gray the black parent instead; it will be
    /// rescanned at PropagateAgain/Atomic. Chosen for tables, whose
    /// bulk mutation would otherwise pay one forward barrier per slot.
    pub fn barrier_back(&mut self, parent: GcId) {
        if !self.phase.keep_invariant() {
            return;
        }
        if self.pool.header(parent).is_black() {
            self.pool.header_mut(parent).make_gray();
            self.grayagain.push(parent);
        }
    }

    /// Mandatory hook for every store of a collectible `child` into
    /// `parent`. Table stores take the backward barrier, everything
    /// else the forward one.
    pub fn record_write(&mut self, parent: GcId, child: Value) {
        let Some(child_id) = child.gc_id() else {
            return;
        };
        match parent {
            GcId::Table(_) => self.barrier_back(parent),
            _ => self.barrier_forward(parent, child_id),
        }
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}
