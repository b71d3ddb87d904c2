// ============ Object IDs ============
// All IDs are plain u32 indices into the shared object pool.
// A typed wrapper only records which kind of object the index is
// expected to resolve to; the pool asserts the kind on access.

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct StringId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct TableId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct FunctionId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct UpvalueId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct UserdataId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct ThreadId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct BufferId(pub u32);

/// Object kind tags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    String = 0,
    Table = 1,
    Function = 2,
    Upvalue = 3,
    Thread = 4,
    Userdata = 5,
    Buffer = 6,
}

impl GcKind {
    pub fn name(self) -> &'static str {
        match self {
            GcKind::String => "string",
            GcKind::Table => "table",
            GcKind::Function => "function",
            GcKind::Upvalue => "upvalue",
            GcKind::Thread => "thread",
            GcKind::Userdata => "userdata",
            GcKind::Buffer => "buffer",
        }
    }
}

/// Unified GC object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GcId {
    String(StringId),
    Table(TableId),
    Function(FunctionId),
    Upvalue(UpvalueId),
    Thread(ThreadId),
    Userdata(UserdataId),
    Buffer(BufferId),
}

impl GcId {
    #[inline(always)]
    pub fn kind(self) -> GcKind {
        match self {
            GcId::String(_) => GcKind::String,
            GcId::Table(_) => GcKind::Table,
            GcId::Function(_) => GcKind::Function,
            GcId::Upvalue(_) => GcKind::Upvalue,
            GcId::Thread(_) => GcKind::Thread,
            GcId::Userdata(_) => GcKind::Userdata,
            GcId::Buffer(_) => GcKind::Buffer,
        }
    }

    #[inline(always)]
    pub fn index(self) -> u32 {
        match self {
            GcId::String(StringId(id)) => id,
            GcId::Table(TableId(id)) => id,
            GcId::Function(FunctionId(id)) => id,
            GcId::Upvalue(UpvalueId(id)) => id,
            GcId::Thread(ThreadId(id)) => id,
            GcId::Userdata(UserdataId(id)) => id,
            GcId::Buffer(BufferId(id)) => id,
        }
    }
}
