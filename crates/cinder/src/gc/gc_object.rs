// ============ GC header and object pool ============

use ahash::RandomState;
use indexmap::IndexMap;

use crate::gc::{
    BufferId, FunctionId, GcId, GcKind, StringId, TableId, ThreadId, UpvalueId, UserdataId,
};
use crate::value::{Buffer, StrData, Table, Userdata, Value};
use crate::vm::{NativeFn, Proto, Thread};
use std::rc::Rc;

// Color bit positions in the `marked` field. Gray is implicit: an
// object is gray iff neither a white bit nor the black bit is set.
pub const WHITE0BIT: u8 = 0;
pub const WHITE1BIT: u8 = 1;
pub const BLACKBIT: u8 = 2;
/// Never collected (pinned type/tag-method names, the registry).
pub const FIXEDBIT: u8 = 3;

pub const WHITEBITS: u8 = (1 << WHITE0BIT) | (1 << WHITE1BIT);
pub const MASKCOLORS: u8 = WHITEBITS | (1 << BLACKBIT);

/// Common prefix of every heap object: color bits, memory category for
/// per-subsystem byte accounting, and the object's size estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcHeader {
    pub marked: u8,
    pub memcat: u8,
    pub size: u32,
}

impl GcHeader {
    /// New objects must be created with the collector's current white;
    /// anything else can be swept in the ongoing cycle.
    #[inline(always)]
    pub fn with_white(current_white: u8, memcat: u8, size: u32) -> Self {
        debug_assert!(current_white <= 1);
        GcHeader {
            marked: 1 << (WHITE0BIT + current_white),
            memcat,
            size,
        }
    }

    #[inline(always)]
    pub fn is_white(&self) -> bool {
        self.marked & WHITEBITS != 0
    }

    #[inline(always)]
    pub fn is_black(&self) -> bool {
        self.marked & (1 << BLACKBIT) != 0
    }

    #[inline(always)]
    pub fn is_gray(&self) -> bool {
        self.marked & MASKCOLORS == 0
    }

    #[inline(always)]
    pub fn is_fixed(&self) -> bool {
        self.marked & (1 << FIXEDBIT) != 0
    }

    #[inline(always)]
    pub fn set_fixed(&mut self) {
        self.marked |= 1 << FIXEDBIT;
    }

    #[inline(always)]
    pub fn make_white(&mut self, current_white: u8) {
        debug_assert!(current_white <= 1);
        self.marked = (self.marked & !MASKCOLORS) | (1 << (WHITE0BIT + current_white));
    }

    #[inline(always)]
    pub fn make_gray(&mut self) {
        self.marked &= !MASKCOLORS;
    }

    #[inline(always)]
    pub fn make_black(&mut self) {
        self.marked = (self.marked & !WHITEBITS) | (1 << BLACKBIT);
    }

    /// Dead during sweep: still carrying the previous cycle's white.
    #[inline(always)]
    pub fn is_dead(&self, other_white: u8) -> bool {
        debug_assert!(other_white <= 1);
        self.marked & (1 << (WHITE0BIT + other_white)) != 0
    }
}

/// A closure: either a script function over a prototype, or a native
/// host function. Script upvalues live in the pool so several closures
/// can share one captured slot.
pub enum Closure {
    Script {
        proto: Rc<Proto>,
        upvalues: Vec<UpvalueId>,
    },
    Native {
        func: NativeFn,
        upvalues: Vec<Value>,
        /// Debug name reported in argument errors.
        name: Option<Rc<str>>,
    },
}

impl Closure {
    #[inline(always)]
    pub fn is_native(&self) -> bool {
        matches!(self, Closure::Native { .. })
    }

    pub fn proto(&self) -> Option<&Rc<Proto>> {
        match self {
            Closure::Script { proto, .. } => Some(proto),
            Closure::Native { .. } => None,
        }
    }

    pub fn debug_name(&self) -> Option<&str> {
        match self {
            Closure::Script { proto, .. } => proto.name.as_deref(),
            Closure::Native { name, .. } => name.as_deref(),
        }
    }

    pub fn byte_size(&self) -> usize {
        match self {
            Closure::Script { proto, upvalues } => {
                size_of::<Closure>()
                    + upvalues.len() * size_of::<UpvalueId>()
                    + proto.code.len() * size_of::<crate::vm::Instruction>()
                    + proto.constants.len() * size_of::<Value>()
            }
            Closure::Native { upvalues, .. } => {
                size_of::<Closure>() + upvalues.len() * size_of::<Value>()
            }
        }
    }
}

/// A captured variable. Open upvalues alias a live stack slot of their
/// owning thread; the close operation copies the value out before the
/// frame disappears.
pub enum Upvalue {
    Open { thread: ThreadId, slot: usize },
    Closed(Value),
}

impl Upvalue {
    #[inline(always)]
    pub fn is_open(&self) -> bool {
        matches!(self, Upvalue::Open { .. })
    }
}

/// Payload of a heap object.
pub enum GcData {
    Str(Box<StrData>),
    Table(Box<Table>),
    Closure(Box<Closure>),
    Upvalue(Box<Upvalue>),
    Thread(Box<Thread>),
    Userdata(Box<Userdata>),
    Buffer(Box<Buffer>),
}

impl GcData {
    #[inline]
    pub fn kind(&self) -> GcKind {
        match self {
            GcData::Str(_) => GcKind::String,
            GcData::Table(_) => GcKind::Table,
            GcData::Closure(_) => GcKind::Function,
            GcData::Upvalue(_) => GcKind::Upvalue,
            GcData::Thread(_) => GcKind::Thread,
            GcData::Userdata(_) => GcKind::Userdata,
            GcData::Buffer(_) => GcKind::Buffer,
        }
    }
}

pub struct GcObject {
    pub header: GcHeader,
    pub data: GcData,
}

impl GcObject {
    pub fn with_white(data: GcData, current_white: u8, memcat: u8, size: u32) -> Self {
        GcObject {
            header: GcHeader::with_white(current_white, memcat, size),
            data,
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.header.size as usize
    }

    pub fn gc_id(&self, index: u32) -> GcId {
        match &self.data {
            GcData::Str(_) => GcId::String(StringId(index)),
            GcData::Table(_) => GcId::Table(TableId(index)),
            GcData::Closure(_) => GcId::Function(FunctionId(index)),
            GcData::Upvalue(_) => GcId::Upvalue(UpvalueId(index)),
            GcData::Thread(_) => GcId::Thread(ThreadId(index)),
            GcData::Userdata(_) => GcId::Userdata(UserdataId(index)),
            GcData::Buffer(_) => GcId::Buffer(BufferId(index)),
        }
    }
}

/// IndexMap-based pool for all heap objects.
/// - O(1) lookup by id
/// - iteration touches live objects only (sweep relies on this)
/// - free list recycles ids to bound growth
pub struct GcPool {
    map: IndexMap<u32, GcObject, RandomState>,
    free_list: Vec<u32>,
    next_id: u32,
}

macro_rules! typed_accessors {
    ($get:ident, $get_mut:ident, $idty:ty, $variant:ident, $out:ty) => {
        #[inline(always)]
        pub fn $get(&self, id: $idty) -> &$out {
            match &self.object(id.0).data {
                GcData::$variant(v) => v,
                other => unreachable!(
                    "object {} is a {:?}, not a {}",
                    id.0,
                    other.kind(),
                    stringify!($variant)
                ),
            }
        }

        #[inline(always)]
        pub fn $get_mut(&mut self, id: $idty) -> &mut $out {
            match &mut self.object_mut(id.0).data {
                GcData::$variant(v) => v,
                other => unreachable!(
                    "object {} is a {:?}, not a {}",
                    id.0,
                    other.kind(),
                    stringify!($variant)
                ),
            }
        }
    };
}

impl GcPool {
    pub fn new() -> Self {
        Self {
            map: IndexMap::with_capacity_and_hasher(256, RandomState::new()),
            free_list: Vec::new(),
            next_id: 0,
        }
    }

    #[inline]
    pub fn alloc(&mut self, value: GcObject) -> u32 {
        let id = if let Some(free_id) = self.free_list.pop() {
            free_id
        } else {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            debug_assert!(self.next_id != 0, "object pool exhausted u32 ids");
            id
        };
        self.map.insert(id, value);
        id
    }

    #[inline(always)]
    pub fn get(&self, id: u32) -> Option<&GcObject> {
        self.map.get(&id)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut GcObject> {
        self.map.get_mut(&id)
    }

    #[inline(always)]
    fn object(&self, id: u32) -> &GcObject {
        self.map.get(&id).expect("stale object id")
    }

    #[inline(always)]
    fn object_mut(&mut self, id: u32) -> &mut GcObject {
        self.map.get_mut(&id).expect("stale object id")
    }

    /// Free a slot and recycle its id; returns the freed byte size.
    #[inline]
    pub fn free(&mut self, id: u32) -> usize {
        if let Some(obj) = self.map.swap_remove(&id) {
            self.free_list.push(id);
            return obj.size();
        }
        0
    }

    /// Positional access for the incremental sweep. `swap_remove_index`
    /// moves the tail object into the hole, so the sweep cursor stays
    /// valid without re-scanning.
    #[inline]
    pub fn get_index(&self, index: usize) -> Option<(u32, &GcObject)> {
        self.map.get_index(index).map(|(&id, obj)| (id, obj))
    }

    #[inline]
    pub fn get_index_mut(&mut self, index: usize) -> Option<(u32, &mut GcObject)> {
        self.map.get_index_mut(index).map(|(&id, obj)| (id, obj))
    }

    #[inline]
    pub fn free_at_index(&mut self, index: usize) -> usize {
        if let Some((id, obj)) = self.map.swap_remove_index(index) {
            self.free_list.push(id);
            return obj.size();
        }
        0
    }

    #[inline(always)]
    pub fn contains(&self, id: GcId) -> bool {
        self.map
            .get(&id.index())
            .is_some_and(|obj| obj.data.kind() == id.kind())
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[inline(always)]
    pub fn header(&self, id: GcId) -> &GcHeader {
        &self.object(id.index()).header
    }

    #[inline(always)]
    pub fn header_mut(&mut self, id: GcId) -> &mut GcHeader {
        &mut self.object_mut(id.index()).header
    }

    pub fn iter(&self) -> impl Iterator<Item = (GcId, &GcObject)> + '_ {
        self.map.iter().map(|(&id, obj)| (obj.gc_id(id), obj))
    }

    typed_accessors!(string, string_mut, StringId, Str, StrData);
    typed_accessors!(table, table_mut, TableId, Table, Table);
    typed_accessors!(closure, closure_mut, FunctionId, Closure, Closure);
    typed_accessors!(upvalue, upvalue_mut, UpvalueId, Upvalue, Upvalue);
    typed_accessors!(thread, thread_mut, ThreadId, Thread, Thread);
    typed_accessors!(userdata, userdata_mut, UserdataId, Userdata, Userdata);
    typed_accessors!(buffer, buffer_mut, BufferId, Buffer, Buffer);
}

impl Default for GcPool {
    fn default() -> Self {
        Self::new()
    }
}
