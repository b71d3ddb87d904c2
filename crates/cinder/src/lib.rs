// cinder
// An embeddable register-based scripting VM: tagged values, an
// incremental tri-color garbage collector, and a cooperative
// call/coroutine engine. Bytecode comes from the host; there is no
// compiler here.

#[cfg(test)]
mod test;

pub mod gc;
pub mod value;
pub mod vm;

pub use gc::{
    BufferId, FunctionId, Gc, GcHeader, GcId, GcKind, GcPhase, GcPool, HeapEdge, HeapNode,
    ObjectAllocator, StringId, TableId, ThreadId, UpvalueId, UserdataId,
};
pub use value::{Buffer, Table, Value};
pub use vm::{
    ArithOp, Control, ErrorKind, Instruction, MULTI, NativeFn, Proto, ProtoBuilder, ResumeResult,
    ThreadStatus, Tm, UpvalDesc, Vm, VmError, VmOptions, VmResult,
};
