// The VM instance: global interpreter/collector state.
//
// One `Vm` is one isolated universe: object pool, collector, intern
// table, globals/registry, and the thread currently executing. There
// is no process-wide state; hosts may run any number of instances.

mod call_info;
mod coroutine;
mod error;
mod execute;
mod metamethod;
mod opcode;
mod thread;

pub use call_info::{CallInfo, call_flags};
pub use coroutine::ResumeResult;
pub use error::{Control, ErrorKind, VmError, VmResult};
pub use metamethod::{ArithOp, TM_COUNT, Tm};
pub use opcode::{Instruction, MULTI, Proto, ProtoBuilder, UpvalDesc};
pub use thread::{PendingCall, Thread, ThreadStatus};

use crate::gc::{FunctionId, Gc, GcId, ObjectAllocator, StringId, TableId, ThreadId};
use crate::value::{TYPE_NAMES, Userdata, Value, number_to_string, string_to_number};
use std::rc::Rc;

/// Native host function: receives the argument values, returns the
/// result values. Runs on the Rust stack.
pub type NativeFn = fn(&mut Vm, Vec<Value>) -> VmResult<Vec<Value>>;

/// Interrupt hook, checked at safe points (call entry, backward
/// jumps). May raise an error or request a break.
pub type InterruptFn = fn(&mut Vm) -> VmResult<()>;

pub const NUM_TAGS: usize = TYPE_NAMES.len();

/// Per-instance limits and collector tuning.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Register stack slots per thread.
    pub max_stack: usize,
    /// Call-info frames per thread.
    pub max_call_depth: usize,
    /// Extra frames granted while an error handler runs, so handlers
    /// survive the overflow they are reporting.
    pub extra_call_depth: usize,
    /// Hard allocation ceiling in bytes.
    pub memory_limit: usize,
    pub gc_pause_percent: u32,
    pub gc_step_mul: u32,
    pub gc_step_size: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_stack: 1_000_000,
            max_call_depth: 200,
            extra_call_depth: 30,
            memory_limit: usize::MAX,
            gc_pause_percent: crate::gc::DEFAULT_PAUSE_PERCENT,
            gc_step_mul: crate::gc::DEFAULT_STEP_MUL,
            gc_step_size: crate::gc::DEFAULT_STEP_SIZE,
        }
    }
}

pub struct Vm {
    pub(crate) gc: Gc,
    pub(crate) allocator: ObjectAllocator,

    pub(crate) globals: TableId,
    pub(crate) registry: TableId,
    pub(crate) main_thread: ThreadId,
    pub(crate) current_thread: ThreadId,
    /// Threads suspended in Normal state under the current one.
    pub(crate) resume_chain: Vec<ThreadId>,

    /// Pinned tag-method name strings, by Tm discriminant.
    pub(crate) tm_names: [StringId; TM_COUNT],
    /// Pinned canonical type-name strings, by tag.
    pub(crate) type_names: [StringId; NUM_TAGS],
    /// Per-tag global metatables for non-table, non-userdata values.
    pub(crate) global_mt: [Option<TableId>; NUM_TAGS],

    /// Error payload travelling with Control::Raise.
    pub(crate) error_value: Value,
    /// Yield/resume and return-value transfer buffer.
    pub(crate) transfer: Vec<Value>,
    /// Message handler per active protected call (None for plain pcall).
    pub(crate) handlers: Vec<Option<Value>>,
    /// Recursion guard: a handler that errors does not recurse.
    pub(crate) in_error_handler: bool,

    pub(crate) interrupt: Option<InterruptFn>,
    pub options: VmOptions,
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        let mut gc = Gc::new();
        gc.memory_limit = options.memory_limit;
        gc.pause_percent = options.gc_pause_percent;
        gc.step_mul = options.gc_step_mul;
        gc.step_size = options.gc_step_size;
        let mut allocator = ObjectAllocator::new();

        // Pinned names first: they must survive every collection.
        let mut type_names = [StringId::default(); NUM_TAGS];
        for (i, name) in TYPE_NAMES.iter().enumerate() {
            let v = allocator
                .create_string(&mut gc, 0, name.as_bytes())
                .expect("init: interning type names");
            let id = v.as_string_id().unwrap();
            gc.fix_string(id);
            type_names[i] = id;
        }
        let mut tm_names = [StringId::default(); TM_COUNT];
        for tm in Tm::ALL {
            let v = allocator
                .create_string(&mut gc, 0, tm.name().as_bytes())
                .expect("init: interning tag-method names");
            let id = v.as_string_id().unwrap();
            gc.fix_string(id);
            tm_names[tm as usize] = id;
        }
        gc.set_mode_key(Value::String(tm_names[Tm::Mode as usize]));

        let globals = allocator
            .create_table(&mut gc, 0, 0, 16)
            .expect("init: globals table")
            .as_table_id()
            .unwrap();
        let registry = allocator
            .create_table(&mut gc, 0, 0, 8)
            .expect("init: registry table")
            .as_table_id()
            .unwrap();
        let main_thread = allocator
            .create_thread(&mut gc, 0, Thread::new_main())
            .expect("init: main thread")
            .as_thread_id()
            .unwrap();

        Self {
            gc,
            allocator,
            globals,
            registry,
            main_thread,
            current_thread: main_thread,
            resume_chain: Vec::new(),
            tm_names,
            type_names,
            global_mt: [None; NUM_TAGS],
            error_value: Value::Nil,
            transfer: Vec::new(),
            handlers: Vec::new(),
            in_error_handler: false,
            interrupt: None,
            options,
        }
    }

    // ==================== Value construction ====================

    #[inline(always)]
    fn memcat(&self) -> u8 {
        self.gc.pool.thread(self.current_thread).memcat
    }

    pub fn intern(&mut self, s: &str) -> VmResult<Value> {
        let memcat = self.memcat();
        self.allocator.create_string(&mut self.gc, memcat, s.as_bytes())
    }

    pub fn intern_bytes(&mut self, bytes: &[u8]) -> VmResult<Value> {
        let memcat = self.memcat();
        self.allocator.create_string(&mut self.gc, memcat, bytes)
    }

    pub fn create_table(&mut self, asize: usize, hsize: usize) -> VmResult<Value> {
        let memcat = self.memcat();
        self.allocator
            .create_table(&mut self.gc, memcat, asize, hsize)
    }

    pub fn create_buffer(&mut self, len: usize) -> VmResult<Value> {
        let memcat = self.memcat();
        self.allocator.create_buffer(&mut self.gc, memcat, len)
    }

    pub fn create_buffer_from(&mut self, bytes: &[u8]) -> VmResult<Value> {
        let memcat = self.memcat();
        self.allocator
            .create_buffer_from(&mut self.gc, memcat, bytes)
    }

    pub fn create_userdata(
        &mut self,
        data: Box<dyn std::any::Any>,
        user_tag: u32,
    ) -> VmResult<Value> {
        let memcat = self.memcat();
        self.allocator
            .create_userdata(&mut self.gc, memcat, Userdata::new(data, user_tag))
    }

    /// Release a userdata payload now. There are no finalizers: hosts
    /// close userdata explicitly; the husk is swept like any object.
    pub fn close_userdata(&mut self, v: Value) -> VmResult<()> {
        match v.as_userdata_id() {
            Some(id) => {
                self.gc.pool.userdata_mut(id).data = Box::new(());
                Ok(())
            }
            None => Err(self.throw_arg_error(1, None, "userdata", v.type_name())),
        }
    }

    /// Borrow a userdata payload, downcast to its concrete type.
    pub fn userdata_ref<T: 'static>(&self, v: Value) -> Option<&T> {
        let id = v.as_userdata_id()?;
        self.gc.pool.userdata(id).data.downcast_ref::<T>()
    }

    pub fn userdata_tag(&self, v: Value) -> Option<u32> {
        v.as_userdata_id().map(|id| self.gc.pool.userdata(id).user_tag)
    }

    /// Wrap a native function into a callable value.
    pub fn create_native(
        &mut self,
        name: &str,
        func: NativeFn,
        upvalues: Vec<Value>,
    ) -> VmResult<Value> {
        let memcat = self.memcat();
        self.allocator
            .create_native(&mut self.gc, memcat, func, upvalues, Some(name))
    }

    /// Instantiate a closure over a prototype with no captured
    /// upvalues (an entry chunk).
    pub fn create_closure(&mut self, proto: Rc<Proto>) -> VmResult<Value> {
        debug_assert!(proto.upvals.is_empty());
        let memcat = self.memcat();
        self.allocator
            .create_closure(&mut self.gc, memcat, proto, Vec::new())
    }

    /// String text by id. The id must be live.
    pub fn string_bytes(&self, id: StringId) -> &[u8] {
        &self.gc.pool.string(id).bytes
    }

    pub fn string_str(&self, id: StringId) -> std::borrow::Cow<'_, str> {
        self.gc.pool.string(id).as_str()
    }

    /// Pin an interned string against collection while host code holds
    /// it outside the traced graph.
    pub fn string_ref(&mut self, id: StringId) {
        self.gc.pool.string_mut(id).pins += 1;
    }

    pub fn string_unref(&mut self, id: StringId) {
        let s = self.gc.pool.string_mut(id);
        debug_assert!(s.pins > 0, "unbalanced string_unref");
        s.pins = s.pins.saturating_sub(1);
    }

    pub fn string_pin_count(&self, id: StringId) -> u32 {
        self.gc.pool.string(id).pins
    }

    // ==================== Coercion ====================

    /// number <-> string coercion used by concat and the arith fallback.
    pub fn coerce_to_number(&self, v: Value) -> Option<f64> {
        match v {
            Value::Number(n) => Some(n),
            Value::String(id) => {
                let s = self.gc.pool.string(id);
                string_to_number(std::str::from_utf8(&s.bytes).ok()?)
            }
            _ => None,
        }
    }

    pub fn coerce_to_string(&mut self, v: Value) -> VmResult<Option<Value>> {
        match v {
            Value::String(_) => Ok(Some(v)),
            Value::Number(n) => Ok(Some(self.intern(&number_to_string(n))?)),
            Value::Vector([x, y, z]) => {
                Ok(Some(self.intern(&format!("{}, {}, {}", x, y, z))?))
            }
            _ => Ok(None),
        }
    }

    /// Printable description of any value, for hosts and diagnostics.
    pub fn display_value(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => number_to_string(n),
            Value::Vector([x, y, z]) => format!("{}, {}, {}", x, y, z),
            Value::String(id) => self.string_str(id).into_owned(),
            Value::LightUserdata(p) => format!("userdata: 0x{:012x}", p),
            other => format!(
                "{}: 0x{:08x}",
                self.typeof_name(other),
                other.gc_id().unwrap().index()
            ),
        }
    }

    // ==================== Type names ====================

    /// Raw tag name, never overridden.
    pub fn type_name(&self, v: Value) -> &'static str {
        v.type_name()
    }

    /// Tag name with `__type` metafield override, as reported by
    /// typeof-style introspection.
    pub fn typeof_name(&self, v: Value) -> String {
        let mt = self.metatable_of(v);
        if let Some(mt) = mt {
            let key = Value::String(self.tm_names[Tm::Type as usize]);
            let t = self.gc.pool.table(mt).get(&key);
            if let Some(id) = t.as_string_id() {
                return self.string_str(id).into_owned();
            }
        }
        v.type_name().to_string()
    }

    // ==================== Metatables & tag methods ====================

    pub fn metatable_of(&self, v: Value) -> Option<TableId> {
        match v {
            Value::Table(id) => self.gc.pool.table(id).metatable,
            Value::Userdata(id) => self.gc.pool.userdata(id).metatable,
            other => self.global_mt[other.tag() as usize],
        }
    }

    /// Set a table or userdata metatable (write-barriered). The global
    /// per-tag metatables are set through `set_global_metatable`.
    pub fn set_metatable(&mut self, v: Value, mt: Option<TableId>) -> VmResult<()> {
        match v {
            Value::Table(id) => {
                if self.gc.pool.table(id).readonly {
                    return Err(self.throw_kind(ErrorKind::ReadOnly));
                }
                self.gc.pool.table_mut(id).metatable = mt;
                self.gc.pool.table_mut(id).tmcache = 0;
                if let Some(mt) = mt {
                    self.gc.record_write(GcId::Table(id), Value::Table(mt));
                }
            }
            Value::Userdata(id) => {
                self.gc.pool.userdata_mut(id).metatable = mt;
                if let Some(mt) = mt {
                    self.gc
                        .record_write(GcId::Userdata(id), Value::Table(mt));
                }
            }
            other => {
                return Err(self.throw_arg_error(1, None, "table or userdata", other.type_name()));
            }
        }
        Ok(())
    }

    pub fn set_global_metatable(&mut self, tag: u8, mt: Option<TableId>) {
        self.global_mt[tag as usize] = mt;
    }

    /// Metatable as observed by scripts: a `__metatable` field shields
    /// the real one.
    pub fn observed_metatable(&self, v: Value) -> Value {
        match self.metatable_of(v) {
            None => Value::Nil,
            Some(mt) => {
                let key = Value::String(self.tm_names[Tm::Metatable as usize]);
                let guard = self.gc.pool.table(mt).get(&key);
                if guard.is_nil() {
                    Value::Table(mt)
                } else {
                    guard
                }
            }
        }
    }

    /// Tag-method lookup with the per-metatable absence cache for the
    /// fast events.
    pub(crate) fn get_tm(&mut self, mt: TableId, tm: Tm) -> Option<Value> {
        if tm.cacheable() && self.gc.pool.table(mt).tmcache & tm.cache_bit() != 0 {
            return None;
        }
        let key = Value::String(self.tm_names[tm as usize]);
        let v = self.gc.pool.table(mt).get(&key);
        if v.is_nil() {
            if tm.cacheable() {
                self.gc.pool.table_mut(mt).tmcache |= tm.cache_bit();
            }
            None
        } else {
            Some(v)
        }
    }

    pub(crate) fn get_metamethod(&mut self, v: Value, tm: Tm) -> Option<Value> {
        let mt = self.metatable_of(v)?;
        self.get_tm(mt, tm)
    }

    // ==================== Raw table access ====================

    fn table_of(&mut self, v: Value) -> VmResult<TableId> {
        v.as_table_id().ok_or_else(|| {
            self.throw_kind(ErrorKind::IndexNonTable {
                type_name: v.type_name(),
                key: None,
            })
        })
    }

    pub fn raw_get(&mut self, table: Value, key: Value) -> VmResult<Value> {
        let id = self.table_of(table)?;
        Ok(self.gc.pool.table(id).get(&key))
    }

    /// Raw set, bypassing metamethods. Read-only tables reject the
    /// write before anything mutates.
    pub fn raw_set(&mut self, table: Value, key: Value, value: Value) -> VmResult<()> {
        let id = self.table_of(table)?;
        if self.gc.pool.table(id).readonly {
            return Err(self.throw_kind(ErrorKind::ReadOnly));
        }
        if let Err(crate::value::TableError::InvalidKey) =
            self.gc.pool.table_mut(id).set(key, value)
        {
            let name = if matches!(key, Value::Number(n) if n.is_nan()) {
                "table index is NaN"
            } else {
                "table index is nil"
            };
            return Err(self.throw_message(name.to_string()));
        }
        self.gc.record_write(GcId::Table(id), key);
        self.gc.record_write(GcId::Table(id), value);
        let new_size = self.gc.pool.table(id).byte_size();
        self.gc.resize_object(GcId::Table(id), new_size);
        Ok(())
    }

    pub fn table_length(&mut self, table: Value) -> VmResult<usize> {
        let id = self.table_of(table)?;
        Ok(self.gc.pool.table(id).length())
    }

    /// Stateless next-key iteration.
    pub fn table_next(&mut self, table: Value, key: Value) -> VmResult<Option<(Value, Value)>> {
        let id = self.table_of(table)?;
        match self.gc.pool.table(id).next(&key) {
            Ok(pair) => Ok(pair),
            Err(_) => Err(self.throw_message("invalid key to 'next'".to_string())),
        }
    }

    /// Freeze a table: every further mutating entry point raises.
    pub fn freeze_table(&mut self, table: Value) -> VmResult<()> {
        let id = self.table_of(table)?;
        self.gc.pool.table_mut(id).readonly = true;
        Ok(())
    }

    pub fn is_frozen(&mut self, table: Value) -> VmResult<bool> {
        let id = self.table_of(table)?;
        Ok(self.gc.pool.table(id).readonly)
    }

    // ==================== Buffer access ====================

    fn buffer_of(&mut self, v: Value) -> VmResult<crate::gc::BufferId> {
        match v.as_buffer_id() {
            Some(id) => Ok(id),
            None => Err(self.throw_arg_error(1, None, "buffer", v.type_name())),
        }
    }

    fn buffer_bounds(&mut self) -> Control {
        self.throw_kind(ErrorKind::BufferBounds)
    }

    pub fn buffer_len(&mut self, b: Value) -> VmResult<usize> {
        let id = self.buffer_of(b)?;
        Ok(self.gc.pool.buffer(id).len())
    }

    pub fn buffer_read_u32(&mut self, b: Value, offset: usize) -> VmResult<u32> {
        let id = self.buffer_of(b)?;
        self.gc
            .pool
            .buffer(id)
            .read_u32(offset)
            .map_err(|_| self.buffer_bounds())
    }

    pub fn buffer_write_u32(&mut self, b: Value, offset: usize, v: u32) -> VmResult<()> {
        let id = self.buffer_of(b)?;
        self.gc
            .pool
            .buffer_mut(id)
            .write_u32(offset, v)
            .map_err(|_| self.buffer_bounds())
    }

    pub fn buffer_read_f64(&mut self, b: Value, offset: usize) -> VmResult<f64> {
        let id = self.buffer_of(b)?;
        self.gc
            .pool
            .buffer(id)
            .read_f64(offset)
            .map_err(|_| self.buffer_bounds())
    }

    pub fn buffer_write_f64(&mut self, b: Value, offset: usize, v: f64) -> VmResult<()> {
        let id = self.buffer_of(b)?;
        self.gc
            .pool
            .buffer_mut(id)
            .write_f64(offset, v)
            .map_err(|_| self.buffer_bounds())
    }

    pub fn buffer_read_bits(&mut self, b: Value, bit_offset: u64, count: u32) -> VmResult<u32> {
        let id = self.buffer_of(b)?;
        self.gc
            .pool
            .buffer(id)
            .read_bits(bit_offset, count)
            .map_err(|_| self.buffer_bounds())
    }

    pub fn buffer_write_bits(
        &mut self,
        b: Value,
        bit_offset: u64,
        count: u32,
        v: u32,
    ) -> VmResult<()> {
        let id = self.buffer_of(b)?;
        self.gc
            .pool
            .buffer_mut(id)
            .write_bits(bit_offset, count, v)
            .map_err(|_| self.buffer_bounds())
    }

    pub fn buffer_fill(&mut self, b: Value, offset: usize, value: u8, count: usize) -> VmResult<()> {
        let id = self.buffer_of(b)?;
        self.gc
            .pool
            .buffer_mut(id)
            .fill(offset, value, count)
            .map_err(|_| self.buffer_bounds())
    }

    /// Copy `count` bytes between buffers (or within one buffer,
    /// overlap-safe).
    pub fn buffer_copy(
        &mut self,
        dst: Value,
        dst_offset: usize,
        src: Value,
        src_offset: usize,
        count: usize,
    ) -> VmResult<()> {
        let did = self.buffer_of(dst)?;
        let Some(sid) = src.as_buffer_id() else {
            return Err(self.throw_arg_error(3, None, "buffer", src.type_name()));
        };
        if did == sid {
            return self
                .gc
                .pool
                .buffer_mut(did)
                .copy_within(dst_offset, src_offset, count)
                .map_err(|_| self.buffer_bounds());
        }
        let bytes = match self.gc.pool.buffer(sid).read_bytes(src_offset, count) {
            Ok(b) => b.to_vec(),
            Err(_) => return Err(self.buffer_bounds()),
        };
        self.gc
            .pool
            .buffer_mut(did)
            .write_bytes(dst_offset, &bytes)
            .map_err(|_| self.buffer_bounds())
    }

    /// Extract a byte range as an interned string.
    pub fn buffer_read_string(&mut self, b: Value, offset: usize, count: usize) -> VmResult<Value> {
        let id = self.buffer_of(b)?;
        let bytes = match self.gc.pool.buffer(id).read_bytes(offset, count) {
            Ok(bytes) => bytes.to_vec(),
            Err(_) => return Err(self.buffer_bounds()),
        };
        self.intern_bytes(&bytes)
    }

    pub fn buffer_write_bytes(&mut self, b: Value, offset: usize, bytes: &[u8]) -> VmResult<()> {
        let id = self.buffer_of(b)?;
        self.gc
            .pool
            .buffer_mut(id)
            .write_bytes(offset, bytes)
            .map_err(|_| self.buffer_bounds())
    }

    // ==================== Globals & registry ====================

    pub fn globals(&self) -> Value {
        Value::Table(self.globals)
    }

    pub fn registry(&self) -> Value {
        Value::Table(self.registry)
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> VmResult<()> {
        let key = self.intern(name)?;
        self.raw_set(Value::Table(self.globals), key, value)
    }

    pub fn get_global(&mut self, name: &str) -> VmResult<Value> {
        let key = self.intern(name)?;
        self.raw_get(Value::Table(self.globals), key)
    }

    // ==================== Stack access by position ====================

    /// Read a slot of a thread's register stack (host debugging /
    /// value-inspection API).
    pub fn stack_get(&self, thread: ThreadId, slot: usize) -> Value {
        self.gc
            .pool
            .thread(thread)
            .stack
            .get(slot)
            .copied()
            .unwrap_or(Value::Nil)
    }

    pub fn stack_set(&mut self, thread: ThreadId, slot: usize, value: Value) {
        let t = self.gc.pool.thread_mut(thread);
        t.ensure_stack(slot + 1);
        t.stack[slot] = value;
    }

    // ==================== Errors ====================

    /// Attach `source:line:` position info from the innermost script
    /// frame, when one exists.
    pub(crate) fn where_prefix(&self) -> Option<String> {
        let thread = self.gc.pool.thread(self.current_thread);
        for ci in thread.frames.iter().rev() {
            if let Some(proto) = &ci.proto {
                let pc = ci.pc.saturating_sub(1);
                return Some(format!("{}:{}:", proto.source, proto.line_at(pc)));
            }
        }
        None
    }

    /// Raise a runtime error with a plain message; scripts see it as a
    /// string value with position prefix.
    pub(crate) fn throw_message(&mut self, message: String) -> Control {
        let text = match self.where_prefix() {
            Some(prefix) => format!("{} {}", prefix, message),
            None => message,
        };
        let value = match self.intern(&text) {
            Ok(v) => v,
            Err(c) => return c,
        };
        self.throw_value(value)
    }

    pub(crate) fn throw_kind(&mut self, kind: ErrorKind) -> Control {
        self.throw_message(kind.message())
    }

    /// Argument error. When no callee name is supplied, the active
    /// call-info's debug name is used if the callee provided one.
    pub(crate) fn throw_arg_error(
        &mut self,
        index: usize,
        func: Option<&str>,
        expected: &str,
        got: &str,
    ) -> Control {
        let derived = match func {
            Some(name) => Some(name.to_string()),
            None => {
                let fid = self
                    .gc
                    .pool
                    .thread(self.current_thread)
                    .frames
                    .last()
                    .and_then(|ci| ci.func.as_function_id());
                fid.and_then(|fid| self.closure_debug_name(fid))
            }
        };
        self.throw_kind(ErrorKind::Argument {
            index,
            func: derived.as_deref(),
            expected,
            got,
        })
    }

    /// Raise with an arbitrary error value (the `error()` primitive).
    /// String values get the position prefix; everything else travels
    /// untouched.
    pub fn raise(&mut self, value: Value) -> Control {
        if let Some(id) = value.as_string_id() {
            let text = self.string_str(id).into_owned();
            return self.throw_message(text);
        }
        self.throw_value(value)
    }

    /// Core raise path: runs the active message handler (once) before
    /// unwinding proceeds, then hands the error to the unwinder.
    pub(crate) fn throw_value(&mut self, value: Value) -> Control {
        let handler = self.handlers.last().copied().flatten();
        match handler {
            Some(h) if !self.in_error_handler => {
                self.in_error_handler = true;
                let res = self.call_value(h, vec![value], 1);
                self.in_error_handler = false;
                match res {
                    Ok(mut vals) => {
                        self.error_value = vals.drain(..).next().unwrap_or(Value::Nil);
                    }
                    Err(Control::OutOfMemory) => return Control::OutOfMemory,
                    Err(_) => {
                        // The handler itself failed: final safety net.
                        self.error_value = self
                            .intern("error in error handling")
                            .unwrap_or(Value::Nil);
                    }
                }
            }
            _ => self.error_value = value,
        }
        Control::Raise
    }

    /// Format a host-facing error after an unprotected call failed.
    pub(crate) fn control_to_error(&mut self, control: Control) -> VmError {
        match control {
            Control::Raise => {
                let v = std::mem::replace(&mut self.error_value, Value::Nil);
                VmError::Runtime(self.display_value(v))
            }
            Control::OutOfMemory => VmError::OutOfMemory,
            Control::Break => VmError::Break,
            Control::Yield => VmError::Runtime(
                ErrorKind::YieldOutsideCoroutine.message(),
            ),
        }
    }

    // ==================== Interrupts ====================

    pub fn set_interrupt(&mut self, hook: Option<InterruptFn>) {
        self.interrupt = hook;
    }

    // ==================== GC control ====================

    /// Values reachable from outside the pool.
    pub(crate) fn gc_roots(&self) -> Vec<Value> {
        let mut roots = vec![
            Value::Table(self.globals),
            Value::Table(self.registry),
            Value::Thread(self.main_thread),
            Value::Thread(self.current_thread),
            self.error_value,
        ];
        roots.extend(self.resume_chain.iter().map(|&t| Value::Thread(t)));
        roots.extend(self.transfer.iter().copied());
        roots.extend(self.handlers.iter().flatten().copied());
        roots.extend(
            self.global_mt
                .iter()
                .flatten()
                .map(|&mt| Value::Table(mt)),
        );
        roots
    }

    /// One bounded increment of collection (also invoked automatically
    /// at execution safe points).
    pub fn gc_step(&mut self) {
        let roots = self.gc_roots();
        self.gc.step(&roots, &mut self.allocator);
    }

    /// Run a complete collection cycle.
    pub fn gc_full(&mut self) {
        let roots = self.gc_roots();
        self.gc.collect_full(&roots, &mut self.allocator);
    }

    pub fn gc_stop(&mut self) {
        self.gc.stopped = true;
    }

    pub fn gc_restart(&mut self) {
        self.gc.stopped = false;
    }

    pub fn gc_total_bytes(&self) -> usize {
        self.gc.total_bytes()
    }

    pub fn gc_category_bytes(&self, cat: u8) -> usize {
        self.gc.memcat_bytes(cat)
    }

    /// Memory category newly allocated objects are charged to; set per
    /// thread and inherited by objects it allocates.
    pub fn set_memory_category(&mut self, cat: u8) {
        self.gc.pool.thread_mut(self.current_thread).memcat = cat;
    }

    /// JSON heap snapshot for offline analysis tools.
    pub fn heap_snapshot(&self) -> serde_json::Value {
        crate::gc::heap_snapshot(&self.gc)
    }

    /// Walk the live object graph through node and edge callbacks.
    pub fn enumerate_heap<N, E>(&self, node_cb: N, edge_cb: E)
    where
        N: FnMut(crate::gc::HeapNode),
        E: FnMut(crate::gc::HeapEdge),
    {
        crate::gc::enumerate(&self.gc, node_cb, edge_cb);
    }

    /// Full-graph invariant check; returns the first violation.
    pub fn validate_heap(&self) -> Result<(), String> {
        crate::gc::validate_heap(&self.gc)
    }

    // ==================== Introspection helpers ====================

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    pub fn current_thread(&self) -> ThreadId {
        self.current_thread
    }

    pub(crate) fn closure_debug_name(&self, fid: FunctionId) -> Option<String> {
        self.gc
            .pool
            .closure(fid)
            .debug_name()
            .map(|s| s.to_string())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(VmOptions::default())
    }
}
