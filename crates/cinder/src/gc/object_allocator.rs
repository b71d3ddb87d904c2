// Object allocation.
//
// Every new heap object flows through here: the byte size is estimated,
// charged against the allocating thread's memory category, and the
// object is registered with the collector (allocated in the current
// white). Allocation failure is the distinguished OutOfMemory control,
// not a catchable script error.

use crate::gc::string_interner::StringInterner;
use crate::gc::{Gc, GcData, GcObject, StringId, UpvalueId};
use crate::value::{Buffer, StrData, Table, Userdata, Value};
use crate::vm::{Control, NativeFn, Proto, Thread, VmResult};
use crate::gc::gc_object::{Closure, Upvalue};
use std::rc::Rc;

pub type CreateResult = VmResult<Value>;

pub struct ObjectAllocator {
    strings: StringInterner,
}

impl ObjectAllocator {
    pub fn new() -> Self {
        Self {
            strings: StringInterner::new(),
        }
    }

    // ==================== Strings ====================

    /// Create or reuse an interned string. A hit on a string the
    /// current cycle has not reached yet resurrects it (strings have no
    /// children, so blackening is always safe).
    pub fn create_string(&mut self, gc: &mut Gc, memcat: u8, bytes: &[u8]) -> CreateResult {
        let hash = self.strings.hash_bytes(bytes);
        if let Some(id) = self.strings.find(&gc.pool, bytes, hash) {
            let header = gc.pool.header_mut(crate::gc::GcId::String(id));
            if header.is_white() {
                header.make_black();
            }
            return Ok(Value::String(id));
        }

        let size = (size_of::<StrData>() + bytes.len()) as u32;
        gc.check_memory(size as usize)?;
        let data = GcData::Str(Box::new(StrData::new(bytes.to_vec().into_boxed_slice(), hash)));
        let id = gc.register(GcObject::with_white(data, gc.current_white, memcat, size));
        let id = StringId(id);
        self.strings.insert(hash, id);
        Ok(Value::String(id))
    }

    /// Unlink a dead string from the intern table (sweep callback).
    pub fn unlink_string(&mut self, id: StringId, hash: u64) {
        self.strings.remove_dead(id, hash);
    }

    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    // ==================== Tables ====================

    pub fn create_table(
        &mut self,
        gc: &mut Gc,
        memcat: u8,
        asize: usize,
        hsize: usize,
    ) -> CreateResult {
        let table = Table::new(asize, hsize);
        let size = table.byte_size() as u32;
        gc.check_memory(size as usize)?;
        let data = GcData::Table(Box::new(table));
        let id = gc.register(GcObject::with_white(data, gc.current_white, memcat, size));
        Ok(Value::Table(crate::gc::TableId(id)))
    }

    // ==================== Closures ====================

    pub fn create_closure(
        &mut self,
        gc: &mut Gc,
        memcat: u8,
        proto: Rc<Proto>,
        upvalues: Vec<UpvalueId>,
    ) -> CreateResult {
        let closure = Closure::Script { proto, upvalues };
        let size = closure.byte_size() as u32;
        gc.check_memory(size as usize)?;
        let data = GcData::Closure(Box::new(closure));
        let id = gc.register(GcObject::with_white(data, gc.current_white, memcat, size));
        Ok(Value::Function(crate::gc::FunctionId(id)))
    }

    pub fn create_native(
        &mut self,
        gc: &mut Gc,
        memcat: u8,
        func: NativeFn,
        upvalues: Vec<Value>,
        name: Option<&str>,
    ) -> CreateResult {
        let closure = Closure::Native {
            func,
            upvalues,
            name: name.map(Rc::from),
        };
        let size = closure.byte_size() as u32;
        gc.check_memory(size as usize)?;
        let data = GcData::Closure(Box::new(closure));
        let id = gc.register(GcObject::with_white(data, gc.current_white, memcat, size));
        Ok(Value::Function(crate::gc::FunctionId(id)))
    }

    // ==================== Upvalues ====================

    pub fn create_upvalue(
        &mut self,
        gc: &mut Gc,
        memcat: u8,
        upvalue: Upvalue,
    ) -> VmResult<UpvalueId> {
        let size = size_of::<Upvalue>() as u32;
        gc.check_memory(size as usize)?;
        let data = GcData::Upvalue(Box::new(upvalue));
        let id = gc.register(GcObject::with_white(data, gc.current_white, memcat, size));
        Ok(UpvalueId(id))
    }

    // ==================== Threads ====================

    pub fn create_thread(&mut self, gc: &mut Gc, memcat: u8, thread: Thread) -> CreateResult {
        let size = thread.byte_size() as u32;
        gc.check_memory(size as usize)?;
        let data = GcData::Thread(Box::new(thread));
        let id = gc.register(GcObject::with_white(data, gc.current_white, memcat, size));
        Ok(Value::Thread(crate::gc::ThreadId(id)))
    }

    // ==================== Userdata ====================

    pub fn create_userdata(
        &mut self,
        gc: &mut Gc,
        memcat: u8,
        userdata: Userdata,
    ) -> CreateResult {
        let size = size_of::<Userdata>() as u32;
        gc.check_memory(size as usize)?;
        let data = GcData::Userdata(Box::new(userdata));
        let id = gc.register(GcObject::with_white(data, gc.current_white, memcat, size));
        Ok(Value::Userdata(crate::gc::UserdataId(id)))
    }

    // ==================== Buffers ====================

    pub fn create_buffer(&mut self, gc: &mut Gc, memcat: u8, len: usize) -> CreateResult {
        if len > crate::value::MAX_BUFFER_SIZE {
            return Err(Control::OutOfMemory);
        }
        let size = (size_of::<Buffer>() + len) as u32;
        gc.check_memory(size as usize)?;
        let data = GcData::Buffer(Box::new(Buffer::new(len)));
        let id = gc.register(GcObject::with_white(data, gc.current_white, memcat, size));
        Ok(Value::Buffer(crate::gc::BufferId(id)))
    }

    pub fn create_buffer_from(&mut self, gc: &mut Gc, memcat: u8, bytes: &[u8]) -> CreateResult {
        if bytes.len() > crate::value::MAX_BUFFER_SIZE {
            return Err(Control::OutOfMemory);
        }
        let size = (size_of::<Buffer>() + bytes.len()) as u32;
        gc.check_memory(size as usize)?;
        let data = GcData::Buffer(Box::new(Buffer::from_bytes(bytes)));
        let id = gc.register(GcObject::with_white(data, gc.current_white, memcat, size));
        Ok(Value::Buffer(crate::gc::BufferId(id)))
    }
}

impl Default for ObjectAllocator {
    fn default() -> Self {
        Self::new()
    }
}
