// The interpreter loop and call protocol.
//
// Script-to-script calls are flat: a Call instruction pushes a
// call-info frame and the loop continues. Native functions run on the
// Rust stack; when a native function calls back into script code
// (pcall, metamethod handlers), `call_value` re-enters the loop with a
// higher entry depth. A yield unwinds the Rust stack as a Control
// value but leaves the thread's frames intact; crossing a `call_value`
// re-entry converts it into an error, which matches the classic
// "yield across native call boundary" rule.

use super::call_info::CallInfo;
use super::error::{Control, ErrorKind, VmError, VmResult};
use super::metamethod::{ArithOp, Tm};
use super::opcode::{Instruction, MULTI, Proto};
use super::thread::PendingCall;
use super::Vm;
use crate::gc::{Closure, FunctionId, GcId, ThreadId, Upvalue, UpvalueId};
use crate::value::Value;
use std::rc::Rc;

/// Bound on metamethod indirection chains (`__index` tables pointing
/// at tables with their own `__index`, and so on).
const MAX_TAG_LOOP: usize = 100;
/// Bound on `__call` indirection.
const MAX_CALL_CHAIN: usize = 8;

pub(super) enum Begun {
    /// A script frame was pushed; the loop (or `execute`) continues it.
    Script,
    /// The callee was native and ran to completion; results are in
    /// `Vm::transfer`.
    Native,
}

impl Vm {
    // ==================== Host-facing call API ====================

    /// Call a callable value, returning all results. Errors surface as
    /// host errors; use `pcall` for the catching variant.
    pub fn call(&mut self, func: Value, args: Vec<Value>) -> Result<Vec<Value>, VmError> {
        match self.call_value(func, args, MULTI) {
            Ok(vals) => Ok(vals),
            Err(c) => Err(self.control_to_error(c)),
        }
    }

    /// Protected call: `(true, results...)` on success, `(false, err)`
    /// when the callee raised. OutOfMemory and Break pass through.
    pub fn pcall(&mut self, func: Value, args: Vec<Value>) -> VmResult<(bool, Vec<Value>)> {
        self.protected_call(func, None, args)
    }

    /// Protected call with a message handler: the handler runs on the
    /// error value before unwinding completes, so it can capture
    /// tracebacks.
    pub fn xpcall(
        &mut self,
        func: Value,
        handler: Value,
        args: Vec<Value>,
    ) -> VmResult<(bool, Vec<Value>)> {
        self.protected_call(func, Some(handler), args)
    }

    fn protected_call(
        &mut self,
        func: Value,
        handler: Option<Value>,
        args: Vec<Value>,
    ) -> VmResult<(bool, Vec<Value>)> {
        let tid = self.current_thread;
        let frames_mark = self.gc.pool.thread(tid).frames.len();
        let stack_mark = self.gc.pool.thread(tid).stack.len();
        self.handlers.push(handler);
        let result = self.call_value(func, args, MULTI);
        self.handlers.pop();
        match result {
            Ok(vals) => Ok((true, vals)),
            Err(Control::Raise) => {
                // The error barrier: restore the thread to the state it
                // had before the call, then deliver the error value.
                self.close_upvalues(tid, stack_mark);
                let thread = self.gc.pool.thread_mut(tid);
                thread.frames.truncate(frames_mark);
                thread.stack.truncate(stack_mark);
                let err = std::mem::replace(&mut self.error_value, Value::Nil);
                Ok((false, vec![err]))
            }
            // Fatal conditions pass the barrier untouched.
            Err(other) => Err(other),
        }
    }

    // ==================== Internal call machinery ====================

    /// Invoke a callable from native context and run it to completion.
    /// This is a native boundary: a yield from inside becomes an error.
    pub(crate) fn call_value(
        &mut self,
        func: Value,
        args: Vec<Value>,
        nresults: i16,
    ) -> VmResult<Vec<Value>> {
        let tid = self.current_thread;
        let entry_depth = self.gc.pool.thread(tid).frames.len();
        let ret_base = self.gc.pool.thread(tid).stack.len();
        let begun = self.begin_call(func, args, ret_base, nresults)?;
        if let Begun::Script = begun {
            match self.execute(entry_depth) {
                Ok(()) => {}
                Err(Control::Yield) => {
                    return Err(self.throw_kind(ErrorKind::YieldAcrossNativeCall));
                }
                Err(other) => return Err(other),
            }
        }
        let mut results = std::mem::take(&mut self.transfer);
        if nresults >= 0 {
            results.resize(nresults as usize, Value::Nil);
        }
        Ok(results)
    }

    /// Resolve `__call` chains down to an actual closure.
    fn resolve_callable(&mut self, func: Value) -> VmResult<(FunctionId, Vec<Value>)> {
        let mut callee = func;
        let mut prefix: Vec<Value> = Vec::new();
        for _ in 0..MAX_CALL_CHAIN {
            if let Value::Function(fid) = callee {
                return Ok((fid, prefix));
            }
            match self.get_metamethod(callee, Tm::Call) {
                Some(h) => {
                    prefix.insert(0, callee);
                    callee = h;
                }
                None => {
                    return Err(self.throw_kind(ErrorKind::CallNonFunction {
                        type_name: callee.type_name(),
                    }));
                }
            }
        }
        Err(self.throw_kind(ErrorKind::CallNonFunction {
            type_name: callee.type_name(),
        }))
    }

    /// Start a call. For native callees this runs the function and
    /// leaves the results in `transfer`; for script callees it pushes
    /// the frame and returns.
    pub(super) fn begin_call(
        &mut self,
        func: Value,
        mut args: Vec<Value>,
        ret_base: usize,
        nresults: i16,
    ) -> VmResult<Begun> {
        let (fid, prefix) = self.resolve_callable(func)?;
        if !prefix.is_empty() {
            let mut all = prefix;
            all.extend(args);
            args = all;
        }
        let func = Value::Function(fid);
        let tid = self.current_thread;
        self.check_call_depth(tid)?;

        if self.gc.pool.closure(fid).is_native() {
            let native = match self.gc.pool.closure(fid) {
                Closure::Native { func, .. } => *func,
                Closure::Script { .. } => unreachable!(),
            };
            let frame = CallInfo::new_native(func, ret_base, ret_base, nresults);
            self.gc.pool.thread_mut(tid).frames.push(frame);
            let result = native(self, args);
            self.gc.pool.thread_mut(tid).frames.pop();
            let mut results = result?;
            if nresults >= 0 {
                results.resize(nresults as usize, Value::Nil);
            }
            self.transfer = results;
            Ok(Begun::Native)
        } else {
            self.push_script_frame(tid, fid, func, args, ret_base, nresults)?;
            Ok(Begun::Script)
        }
    }

    fn check_call_depth(&mut self, tid: ThreadId) -> VmResult<()> {
        let depth = self.gc.pool.thread(tid).frames.len();
        let limit = if self.in_error_handler {
            self.options.max_call_depth + self.options.extra_call_depth
        } else {
            self.options.max_call_depth
        };
        if depth >= limit {
            return Err(self.throw_kind(ErrorKind::StackOverflow));
        }
        Ok(())
    }

    fn push_script_frame(
        &mut self,
        tid: ThreadId,
        fid: FunctionId,
        func: Value,
        args: Vec<Value>,
        ret_base: usize,
        nresults: i16,
    ) -> VmResult<()> {
        let proto = match self.gc.pool.closure(fid) {
            Closure::Script { proto, .. } => proto.clone(),
            Closure::Native { .. } => unreachable!(),
        };
        let base = ret_base + 1;
        let window_end = base + proto.max_stack as usize;
        if window_end > self.options.max_stack {
            return Err(self.throw_kind(ErrorKind::StackOverflow));
        }
        let nparams = proto.nparams as usize;
        let mut frame = CallInfo::new_script(func, proto.clone(), base, ret_base, nresults);
        if proto.is_vararg && args.len() > nparams {
            frame.varargs = args[nparams..].to_vec();
        }
        {
            let thread = self.gc.pool.thread_mut(tid);
            thread.ensure_stack(window_end);
            for i in 0..proto.max_stack as usize {
                thread.stack[base + i] = if i < nparams {
                    args.get(i).copied().unwrap_or(Value::Nil)
                } else {
                    Value::Nil
                };
            }
            thread.frames.push(frame);
        }
        let new_size = self.gc.pool.thread(tid).byte_size();
        self.gc.resize_object(GcId::Thread(tid), new_size);
        Ok(())
    }

    // ==================== The loop ====================

    /// Run the current thread until the frame at `entry_depth` returns.
    /// Results are left in `transfer`. Yield and Break leave the frame
    /// chain intact; errors unwind to the entry depth.
    pub(crate) fn execute(&mut self, entry_depth: usize) -> VmResult<()> {
        let tid = self.current_thread;
        loop {
            if self.gc.pool.thread(tid).frames.len() <= entry_depth {
                return Ok(());
            }
            match self.step_one(tid, entry_depth) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(c @ (Control::Yield | Control::Break)) => return Err(c),
                Err(c) => {
                    self.unwind(tid, entry_depth);
                    return Err(c);
                }
            }
        }
    }

    /// Pop frames down to `entry_depth`, closing upvalues as each
    /// frame dies.
    fn unwind(&mut self, tid: ThreadId, entry_depth: usize) {
        while self.gc.pool.thread(tid).frames.len() > entry_depth {
            let (base, is_native) = {
                let ci = self.gc.pool.thread(tid).frames.last().unwrap();
                (ci.base, ci.is_native())
            };
            if !is_native {
                self.close_upvalues(tid, base);
            }
            self.gc.pool.thread_mut(tid).frames.pop();
        }
    }

    /// Execute one instruction of the topmost frame. Returns true when
    /// the entry frame returned.
    fn step_one(&mut self, tid: ThreadId, entry_depth: usize) -> VmResult<bool> {
        let (ins, base, proto) = {
            let thread = self.gc.pool.thread_mut(tid);
            let ci = thread.frames.last_mut().expect("no frame to execute");
            let proto = ci.proto.clone().expect("script frame without proto");
            let ins = proto.code[ci.pc];
            ci.pc += 1;
            (ins, ci.base, proto)
        };

        match ins {
            Instruction::LoadNil { dst, count } => {
                for i in 0..=count as usize {
                    self.set_reg(tid, base, dst as usize + i, Value::Nil);
                }
            }
            Instruction::LoadBool { dst, value } => {
                self.set_reg(tid, base, dst as usize, Value::Boolean(value));
            }
            Instruction::LoadConst { dst, k } => {
                self.set_reg(tid, base, dst as usize, proto.constants[k as usize]);
            }
            Instruction::Move { dst, src } => {
                let v = self.reg(tid, base, src as usize);
                self.set_reg(tid, base, dst as usize, v);
            }

            Instruction::GetGlobal { dst, k } => {
                let key = proto.constants[k as usize];
                let v = self.get_index(Value::Table(self.globals), key)?;
                self.set_reg(tid, base, dst as usize, v);
            }
            Instruction::SetGlobal { k, src } => {
                let key = proto.constants[k as usize];
                let v = self.reg(tid, base, src as usize);
                self.set_index(Value::Table(self.globals), key, v)?;
            }
            Instruction::GetUpval { dst, idx } => {
                let v = self.upvalue_get(tid, base, idx)?;
                self.set_reg(tid, base, dst as usize, v);
            }
            Instruction::SetUpval { idx, src } => {
                let v = self.reg(tid, base, src as usize);
                self.upvalue_set(tid, base, idx, v)?;
            }

            Instruction::NewTable { dst, asize, hsize } => {
                let memcat = self.memcat_of(tid);
                let t = self.allocator.create_table(
                    &mut self.gc,
                    memcat,
                    asize as usize,
                    hsize as usize,
                )?;
                self.set_reg(tid, base, dst as usize, t);
            }
            Instruction::GetTable { dst, obj, key } => {
                let o = self.reg(tid, base, obj as usize);
                let k = self.reg(tid, base, key as usize);
                let v = self.get_index(o, k)?;
                self.set_reg(tid, base, dst as usize, v);
            }
            Instruction::SetTable { obj, key, src } => {
                let o = self.reg(tid, base, obj as usize);
                let k = self.reg(tid, base, key as usize);
                let v = self.reg(tid, base, src as usize);
                self.set_index(o, k, v)?;
            }
            Instruction::GetField { dst, obj, k } => {
                let o = self.reg(tid, base, obj as usize);
                let key = proto.constants[k as usize];
                let v = self.get_index(o, key)?;
                self.set_reg(tid, base, dst as usize, v);
            }
            Instruction::SetField { obj, k, src } => {
                let o = self.reg(tid, base, obj as usize);
                let key = proto.constants[k as usize];
                let v = self.reg(tid, base, src as usize);
                self.set_index(o, key, v)?;
            }

            Instruction::Arith { op, dst, lhs, rhs } => {
                let a = self.reg(tid, base, lhs as usize);
                let b = self.reg(tid, base, rhs as usize);
                let v = self.arith(op, a, b)?;
                self.set_reg(tid, base, dst as usize, v);
            }
            Instruction::Unm { dst, src } => {
                let v = self.reg(tid, base, src as usize);
                let out = self.unary_minus(v)?;
                self.set_reg(tid, base, dst as usize, out);
            }
            Instruction::Not { dst, src } => {
                let v = self.reg(tid, base, src as usize);
                self.set_reg(tid, base, dst as usize, Value::Boolean(!v.is_truthy()));
            }
            Instruction::Len { dst, src } => {
                let v = self.reg(tid, base, src as usize);
                let out = self.length_of(v)?;
                self.set_reg(tid, base, dst as usize, out);
            }
            Instruction::Concat { dst, first, last } => {
                let vals: Vec<Value> = (first..=last)
                    .map(|r| self.reg(tid, base, r as usize))
                    .collect();
                let out = self.concat_values(vals)?;
                self.set_reg(tid, base, dst as usize, out);
            }

            Instruction::Eq { dst, lhs, rhs } => {
                let a = self.reg(tid, base, lhs as usize);
                let b = self.reg(tid, base, rhs as usize);
                let eq = self.values_equal(a, b)?;
                self.set_reg(tid, base, dst as usize, Value::Boolean(eq));
            }
            Instruction::Lt { dst, lhs, rhs } => {
                let a = self.reg(tid, base, lhs as usize);
                let b = self.reg(tid, base, rhs as usize);
                let lt = self.less_than(a, b)?;
                self.set_reg(tid, base, dst as usize, Value::Boolean(lt));
            }
            Instruction::Le { dst, lhs, rhs } => {
                let a = self.reg(tid, base, lhs as usize);
                let b = self.reg(tid, base, rhs as usize);
                let le = self.less_equal(a, b)?;
                self.set_reg(tid, base, dst as usize, Value::Boolean(le));
            }

            Instruction::Jump { offset } => {
                self.jump(tid, offset)?;
            }
            Instruction::JumpIf { src, expect, offset } => {
                let v = self.reg(tid, base, src as usize);
                if v.is_truthy() == expect {
                    self.jump(tid, offset)?;
                }
            }

            Instruction::Call { func, nargs, nresults } => {
                self.safe_point()?;
                let abs_func = base + func as usize;
                let callee = self.stack_at(tid, abs_func);
                let args = self.collect_args(tid, abs_func, nargs);
                match self.begin_call(callee, args, abs_func, nresults) {
                    Ok(Begun::Script) => {}
                    Ok(Begun::Native) => {
                        let results = std::mem::take(&mut self.transfer);
                        self.place_results(tid, abs_func, nresults, results);
                    }
                    Err(Control::Yield) => {
                        // Suspend: remember where the resume values go.
                        self.gc.pool.thread_mut(tid).pending = Some(PendingCall {
                            ret_base: abs_func,
                            nresults,
                        });
                        return Err(Control::Yield);
                    }
                    Err(other) => return Err(other),
                }
            }
            Instruction::TailCall { func, nargs } => {
                self.safe_point()?;
                let abs_func = base + func as usize;
                let callee = self.stack_at(tid, abs_func);
                let args = self.collect_args(tid, abs_func, nargs);
                // The current frame dies; the callee inherits its
                // result protocol.
                self.close_upvalues(tid, base);
                let (ret_base, nresults) = {
                    let thread = self.gc.pool.thread_mut(tid);
                    let ci = thread.frames.pop().expect("tail call without frame");
                    (ci.ret_base, ci.nresults)
                };
                match self.begin_call(callee, args, ret_base, nresults) {
                    Ok(Begun::Script) => {
                        let thread = self.gc.pool.thread_mut(tid);
                        thread.frames.last_mut().unwrap().set_tail();
                    }
                    Ok(Begun::Native) => {
                        let results = std::mem::take(&mut self.transfer);
                        return self.finish_return(tid, entry_depth, ret_base, nresults, results);
                    }
                    Err(Control::Yield) => {
                        self.gc.pool.thread_mut(tid).pending = Some(PendingCall {
                            ret_base,
                            nresults,
                        });
                        return Err(Control::Yield);
                    }
                    Err(other) => return Err(other),
                }
            }
            Instruction::Return { base: rbase, count } => {
                let abs = base + rbase as usize;
                let results = self.collect_returns(tid, abs, count);
                self.close_upvalues(tid, base);
                let (ret_base, nresults) = {
                    let thread = self.gc.pool.thread_mut(tid);
                    let ci = thread.frames.pop().expect("return without frame");
                    (ci.ret_base, ci.nresults)
                };
                return self.finish_return(tid, entry_depth, ret_base, nresults, results);
            }

            Instruction::Closure { dst, p } => {
                let child = proto.protos[p as usize].clone();
                let closure = self.instantiate_closure(tid, base, &proto, child)?;
                self.set_reg(tid, base, dst as usize, closure);
            }
            Instruction::CloseUpvals { from } => {
                self.close_upvalues(tid, base + from as usize);
            }
            Instruction::Vararg { dst, count } => {
                let varargs = {
                    let thread = self.gc.pool.thread(tid);
                    thread.frames.last().unwrap().varargs.clone()
                };
                let abs = base + dst as usize;
                if count == MULTI {
                    let n = varargs.len();
                    {
                        let thread = self.gc.pool.thread_mut(tid);
                        thread.ensure_stack(abs + n);
                        thread.stack[abs..abs + n].copy_from_slice(&varargs);
                        thread.frames.last_mut().unwrap().top = abs + n;
                    }
                } else {
                    for i in 0..count as usize {
                        let v = varargs.get(i).copied().unwrap_or(Value::Nil);
                        self.set_reg(tid, base, dst as usize + i, v);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Deliver results after a frame was popped: either into the
    /// caller's registers, or (at the entry boundary) into `transfer`.
    fn finish_return(
        &mut self,
        tid: ThreadId,
        entry_depth: usize,
        ret_base: usize,
        nresults: i16,
        results: Vec<Value>,
    ) -> VmResult<bool> {
        if self.gc.pool.thread(tid).frames.len() <= entry_depth {
            self.transfer = results;
            // Drop the dead portion of the stack so finished calls do
            // not retain garbage.
            self.gc.pool.thread_mut(tid).stack.truncate(ret_base);
            return Ok(true);
        }
        self.place_results(tid, ret_base, nresults, results);
        Ok(false)
    }

    /// Write call results into the caller's register window.
    fn place_results(&mut self, tid: ThreadId, ret_base: usize, nresults: i16, results: Vec<Value>) {
        let thread = self.gc.pool.thread_mut(tid);
        if nresults == MULTI {
            let n = results.len();
            thread.ensure_stack(ret_base + n);
            thread.stack[ret_base..ret_base + n].copy_from_slice(&results);
            if let Some(ci) = thread.frames.last_mut() {
                ci.top = ret_base + n;
            }
        } else {
            let n = nresults as usize;
            thread.ensure_stack(ret_base + n);
            for i in 0..n {
                thread.stack[ret_base + i] = results.get(i).copied().unwrap_or(Value::Nil);
            }
        }
        // Trim anything beyond the caller's live window.
        if let Some(ci) = thread.frames.last() {
            let window = ci
                .proto
                .as_ref()
                .map(|p| ci.base + p.max_stack as usize)
                .unwrap_or(ci.top);
            thread.stack.truncate(window.max(ci.top));
        }
    }

    fn collect_args(&mut self, tid: ThreadId, abs_func: usize, nargs: i16) -> Vec<Value> {
        let thread = self.gc.pool.thread(tid);
        let first = abs_func + 1;
        let end = if nargs == MULTI {
            thread
                .frames
                .last()
                .map(|ci| ci.top)
                .unwrap_or(thread.stack.len())
                .max(first)
        } else {
            first + nargs as usize
        };
        (first..end)
            .map(|i| thread.stack.get(i).copied().unwrap_or(Value::Nil))
            .collect()
    }

    fn collect_returns(&mut self, tid: ThreadId, abs: usize, count: i16) -> Vec<Value> {
        let thread = self.gc.pool.thread(tid);
        let end = if count == MULTI {
            thread
                .frames
                .last()
                .map(|ci| ci.top)
                .unwrap_or(thread.stack.len())
                .max(abs)
        } else {
            abs + count as usize
        };
        (abs..end)
            .map(|i| thread.stack.get(i).copied().unwrap_or(Value::Nil))
            .collect()
    }

    fn jump(&mut self, tid: ThreadId, offset: i16) -> VmResult<()> {
        if offset < 0 {
            // Backward jumps are safe points: loops stay interruptible
            // and the collector gets its increments.
            self.safe_point()?;
        }
        let thread = self.gc.pool.thread_mut(tid);
        let ci = thread.frames.last_mut().unwrap();
        ci.pc = (ci.pc as i64 + offset as i64) as usize;
        Ok(())
    }

    /// Cooperative safe point: bounded GC work, then the host
    /// interrupt hook.
    fn safe_point(&mut self) -> VmResult<()> {
        if self.gc.needs_work() {
            self.gc_step();
        }
        if let Some(hook) = self.interrupt {
            hook(self)?;
        }
        Ok(())
    }

    // ==================== Registers ====================

    #[inline(always)]
    fn reg(&self, tid: ThreadId, base: usize, r: usize) -> Value {
        self.gc.pool.thread(tid).stack[base + r]
    }

    #[inline(always)]
    fn set_reg(&mut self, tid: ThreadId, base: usize, r: usize, v: Value) {
        let thread = self.gc.pool.thread_mut(tid);
        thread.ensure_stack(base + r + 1);
        thread.stack[base + r] = v;
    }

    #[inline(always)]
    fn stack_at(&self, tid: ThreadId, slot: usize) -> Value {
        self.gc
            .pool
            .thread(tid)
            .stack
            .get(slot)
            .copied()
            .unwrap_or(Value::Nil)
    }

    #[inline(always)]
    fn memcat_of(&self, tid: ThreadId) -> u8 {
        self.gc.pool.thread(tid).memcat
    }

    // ==================== Upvalues ====================

    fn current_closure(&self, tid: ThreadId) -> FunctionId {
        let ci = self.gc.pool.thread(tid).frames.last().unwrap();
        ci.func.as_function_id().expect("script frame func")
    }

    fn upvalue_id(&mut self, tid: ThreadId, idx: u8) -> VmResult<UpvalueId> {
        let fid = self.current_closure(tid);
        match self.gc.pool.closure(fid) {
            Closure::Script { upvalues, .. } => Ok(upvalues[idx as usize]),
            Closure::Native { .. } => unreachable!("upvalue access in native frame"),
        }
    }

    fn upvalue_get(&mut self, tid: ThreadId, _base: usize, idx: u8) -> VmResult<Value> {
        let uv = self.upvalue_id(tid, idx)?;
        Ok(match *self.gc.pool.upvalue(uv) {
            Upvalue::Open { thread, slot } => self.stack_at(thread, slot),
            Upvalue::Closed(v) => v,
        })
    }

    fn upvalue_set(&mut self, tid: ThreadId, _base: usize, idx: u8, v: Value) -> VmResult<()> {
        let uv = self.upvalue_id(tid, idx)?;
        let open_at = match self.gc.pool.upvalue(uv) {
            Upvalue::Open { thread, slot } => Some((*thread, *slot)),
            Upvalue::Closed(_) => None,
        };
        match open_at {
            Some((thread, slot)) => {
                let t = self.gc.pool.thread_mut(thread);
                t.ensure_stack(slot + 1);
                t.stack[slot] = v;
            }
            None => {
                *self.gc.pool.upvalue_mut(uv) = Upvalue::Closed(v);
                self.gc.record_write(GcId::Upvalue(uv), v);
            }
        }
        Ok(())
    }

    fn find_or_create_upvalue(&mut self, tid: ThreadId, slot: usize) -> VmResult<UpvalueId> {
        if let Some(&(_, id)) = self
            .gc
            .pool
            .thread(tid)
            .open_upvalues
            .iter()
            .find(|&&(s, _)| s == slot)
        {
            return Ok(id);
        }
        let memcat = self.memcat_of(tid);
        let id = self.allocator.create_upvalue(
            &mut self.gc,
            memcat,
            Upvalue::Open { thread: tid, slot },
        )?;
        self.gc.pool.thread_mut(tid).open_upvalues.push((slot, id));
        Ok(id)
    }

    /// Close every open upvalue at or above `level`: copy the stack
    /// value out and drop the registration.
    pub(crate) fn close_upvalues(&mut self, tid: ThreadId, level: usize) {
        let to_close: Vec<(usize, UpvalueId)> = {
            let thread = self.gc.pool.thread(tid);
            thread
                .open_upvalues
                .iter()
                .copied()
                .filter(|&(slot, _)| slot >= level)
                .collect()
        };
        if to_close.is_empty() {
            return;
        }
        self.gc
            .pool
            .thread_mut(tid)
            .open_upvalues
            .retain(|&(slot, _)| slot < level);
        for (slot, id) in to_close {
            let v = self.stack_at(tid, slot);
            *self.gc.pool.upvalue_mut(id) = Upvalue::Closed(v);
            self.gc.record_write(GcId::Upvalue(id), v);
        }
    }

    fn instantiate_closure(
        &mut self,
        tid: ThreadId,
        base: usize,
        parent: &Rc<Proto>,
        child: Rc<Proto>,
    ) -> VmResult<Value> {
        let _ = parent;
        let mut upvalues = Vec::with_capacity(child.upvals.len());
        for desc in &child.upvals {
            let id = match *desc {
                super::opcode::UpvalDesc::Local(r) => {
                    self.find_or_create_upvalue(tid, base + r as usize)?
                }
                super::opcode::UpvalDesc::Upval(i) => {
                    let fid = self.current_closure(tid);
                    match self.gc.pool.closure(fid) {
                        Closure::Script { upvalues, .. } => upvalues[i as usize],
                        Closure::Native { .. } => unreachable!(),
                    }
                }
            };
            upvalues.push(id);
        }
        let memcat = self.memcat_of(tid);
        self.allocator
            .create_closure(&mut self.gc, memcat, child, upvalues)
    }

    // ==================== Indexing ====================

    /// Metamethod-aware read. Follows `__index` chains up to the tag
    /// loop bound.
    pub fn get_index(&mut self, obj: Value, key: Value) -> VmResult<Value> {
        let mut target = obj;
        for _ in 0..MAX_TAG_LOOP {
            if let Value::Table(tid) = target {
                let v = self.gc.pool.table(tid).get(&key);
                if !v.is_nil() {
                    return Ok(v);
                }
                let Some(mt) = self.gc.pool.table(tid).metatable else {
                    return Ok(Value::Nil);
                };
                let Some(h) = self.get_tm(mt, Tm::Index) else {
                    return Ok(Value::Nil);
                };
                if matches!(h, Value::Function(_)) {
                    let mut r = self.call_value(h, vec![target, key], 1)?;
                    return Ok(r.pop().unwrap_or(Value::Nil));
                }
                target = h;
            } else {
                let Some(h) = self.get_metamethod(target, Tm::Index) else {
                    return Err(self.index_error(target, key));
                };
                if matches!(h, Value::Function(_)) {
                    let mut r = self.call_value(h, vec![target, key], 1)?;
                    return Ok(r.pop().unwrap_or(Value::Nil));
                }
                target = h;
            }
        }
        Err(self.throw_message("'__index' chain too long; possible loop".to_string()))
    }

    /// Metamethod-aware write. `__newindex` fires only for absent
    /// keys; read-only enforcement happens before any mutation.
    pub fn set_index(&mut self, obj: Value, key: Value, value: Value) -> VmResult<()> {
        let mut target = obj;
        for _ in 0..MAX_TAG_LOOP {
            if let Value::Table(tid) = target {
                let existing = self.gc.pool.table(tid).get(&key);
                if !existing.is_nil() {
                    return self.raw_set(target, key, value);
                }
                let handler = match self.gc.pool.table(tid).metatable {
                    Some(mt) => self.get_tm(mt, Tm::NewIndex),
                    None => None,
                };
                match handler {
                    None => return self.raw_set(target, key, value),
                    Some(h) if matches!(h, Value::Function(_)) => {
                        self.call_value(h, vec![target, key, value], 0)?;
                        return Ok(());
                    }
                    Some(h) => target = h,
                }
            } else {
                let Some(h) = self.get_metamethod(target, Tm::NewIndex) else {
                    return Err(self.index_error(target, key));
                };
                if matches!(h, Value::Function(_)) {
                    self.call_value(h, vec![target, key, value], 0)?;
                    return Ok(());
                }
                target = h;
            }
        }
        Err(self.throw_message("'__newindex' chain too long; possible loop".to_string()))
    }

    fn index_error(&mut self, obj: Value, key: Value) -> Control {
        // Show the key when it is a short string; everything else
        // would be noise.
        let key_text = key.as_string_id().and_then(|id| {
            let s = self.string_str(id).into_owned();
            if s.len() <= 40 { Some(s) } else { None }
        });
        self.throw_kind(ErrorKind::IndexNonTable {
            type_name: obj.type_name(),
            key: key_text.as_deref(),
        })
    }

    // ==================== Operators ====================

    pub(crate) fn arith(&mut self, op: ArithOp, a: Value, b: Value) -> VmResult<Value> {
        use ArithOp::*;
        // Numbers (with string coercion) first, vectors next,
        // metamethods last.
        if let (Some(x), Some(y)) = (self.coerce_to_number(a), self.coerce_to_number(b)) {
            return Ok(Value::Number(op.apply(x, y)));
        }
        match (a, b, op) {
            (Value::Vector(x), Value::Vector(y), Add | Sub | Mul | Div) => {
                let mut out = [0.0f32; 3];
                for i in 0..3 {
                    out[i] = match op {
                        Add => x[i] + y[i],
                        Sub => x[i] - y[i],
                        Mul => x[i] * y[i],
                        Div => x[i] / y[i],
                        _ => unreachable!(),
                    };
                }
                return Ok(Value::Vector(out));
            }
            (Value::Vector(x), Value::Number(s), Mul | Div) => {
                let s = s as f32;
                let f = |c: f32| if op == Mul { c * s } else { c / s };
                return Ok(Value::Vector([f(x[0]), f(x[1]), f(x[2])]));
            }
            (Value::Number(s), Value::Vector(x), Mul) => {
                let s = s as f32;
                return Ok(Value::Vector([s * x[0], s * x[1], s * x[2]]));
            }
            _ => {}
        }
        if let Some(h) = self
            .get_metamethod(a, op.tm())
            .or_else(|| self.get_metamethod(b, op.tm()))
        {
            let mut r = self.call_value(h, vec![a, b], 1)?;
            return Ok(r.pop().unwrap_or(Value::Nil));
        }
        let offender = if self.coerce_to_number(a).is_none() && !matches!(a, Value::Vector(_)) {
            a
        } else {
            b
        };
        Err(self.throw_kind(ErrorKind::Arithmetic {
            verb: op.verb(),
            lhs: offender.type_name(),
            rhs: None,
        }))
    }

    pub(crate) fn unary_minus(&mut self, v: Value) -> VmResult<Value> {
        match v {
            Value::Number(n) => Ok(Value::Number(-n)),
            Value::Vector([x, y, z]) => Ok(Value::Vector([-x, -y, -z])),
            _ => {
                if let Some(h) = self.get_metamethod(v, Tm::Unm) {
                    let mut r = self.call_value(h, vec![v, v], 1)?;
                    return Ok(r.pop().unwrap_or(Value::Nil));
                }
                Err(self.throw_kind(ErrorKind::Arithmetic {
                    verb: "unm",
                    lhs: v.type_name(),
                    rhs: None,
                }))
            }
        }
    }

    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if a.raw_equal(&b) {
            return Ok(true);
        }
        // __eq fires only when both operands share a tag and raw
        // equality failed.
        let both_tables = matches!((a, b), (Value::Table(_), Value::Table(_)));
        let both_userdata = matches!((a, b), (Value::Userdata(_), Value::Userdata(_)));
        if both_tables || both_userdata {
            if let Some(h) = self
                .get_metamethod(a, Tm::Eq)
                .or_else(|| self.get_metamethod(b, Tm::Eq))
            {
                let mut r = self.call_value(h, vec![a, b], 1)?;
                return Ok(r.pop().unwrap_or(Value::Nil).is_truthy());
            }
        }
        Ok(false)
    }

    pub(crate) fn less_than(&mut self, a: Value, b: Value) -> VmResult<bool> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(x < y),
            (Value::String(x), Value::String(y)) => {
                Ok(self.gc.pool.string(x).bytes < self.gc.pool.string(y).bytes)
            }
            _ => {
                if let Some(h) = self
                    .get_metamethod(a, Tm::Lt)
                    .or_else(|| self.get_metamethod(b, Tm::Lt))
                {
                    let mut r = self.call_value(h, vec![a, b], 1)?;
                    return Ok(r.pop().unwrap_or(Value::Nil).is_truthy());
                }
                Err(self.throw_kind(ErrorKind::Comparison {
                    lhs: a.type_name(),
                    rhs: b.type_name(),
                }))
            }
        }
    }

    pub(crate) fn less_equal(&mut self, a: Value, b: Value) -> VmResult<bool> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(x <= y),
            (Value::String(x), Value::String(y)) => {
                Ok(self.gc.pool.string(x).bytes <= self.gc.pool.string(y).bytes)
            }
            _ => {
                if let Some(h) = self
                    .get_metamethod(a, Tm::Le)
                    .or_else(|| self.get_metamethod(b, Tm::Le))
                {
                    let mut r = self.call_value(h, vec![a, b], 1)?;
                    return Ok(r.pop().unwrap_or(Value::Nil).is_truthy());
                }
                Err(self.throw_kind(ErrorKind::Comparison {
                    lhs: a.type_name(),
                    rhs: b.type_name(),
                }))
            }
        }
    }

    /// Right-to-left fold, so `a .. b .. c` associates like the
    /// reference implementation and metamethods see pairs.
    pub(crate) fn concat_values(&mut self, mut vals: Vec<Value>) -> VmResult<Value> {
        let mut acc = match vals.pop() {
            Some(v) => v,
            None => return self.intern(""),
        };
        while let Some(a) = vals.pop() {
            acc = self.concat_pair(a, acc)?;
        }
        Ok(acc)
    }

    fn concat_pair(&mut self, a: Value, b: Value) -> VmResult<Value> {
        let a_str = self.coerce_to_string(a)?;
        let b_str = self.coerce_to_string(b)?;
        if let (Some(x), Some(y)) = (a_str, b_str) {
            let mut bytes = self.string_bytes(x.as_string_id().unwrap()).to_vec();
            bytes.extend_from_slice(self.string_bytes(y.as_string_id().unwrap()));
            return self.intern_bytes(&bytes);
        }
        if let Some(h) = self
            .get_metamethod(a, Tm::Concat)
            .or_else(|| self.get_metamethod(b, Tm::Concat))
        {
            let mut r = self.call_value(h, vec![a, b], 1)?;
            return Ok(r.pop().unwrap_or(Value::Nil));
        }
        let offender = if matches!(a, Value::String(_) | Value::Number(_)) {
            b
        } else {
            a
        };
        Err(self.throw_kind(ErrorKind::Concatenation {
            type_name: offender.type_name(),
        }))
    }

    pub(crate) fn length_of(&mut self, v: Value) -> VmResult<Value> {
        match v {
            Value::String(id) => Ok(Value::Number(self.gc.pool.string(id).len() as f64)),
            Value::Table(tid) => {
                if let Some(h) = self.get_metamethod(v, Tm::Len) {
                    let mut r = self.call_value(h, vec![v], 1)?;
                    return Ok(r.pop().unwrap_or(Value::Nil));
                }
                Ok(Value::Number(self.gc.pool.table(tid).length() as f64))
            }
            _ => {
                if let Some(h) = self.get_metamethod(v, Tm::Len) {
                    let mut r = self.call_value(h, vec![v], 1)?;
                    return Ok(r.pop().unwrap_or(Value::Nil));
                }
                Err(self.throw_kind(ErrorKind::Length {
                    type_name: v.type_name(),
                }))
            }
        }
    }

    // ==================== Yield primitive ====================

    /// Suspend the current coroutine, transferring `values` to the
    /// resumer. Returns the Control to propagate.
    pub fn yield_values(&mut self, values: Vec<Value>) -> Control {
        if self.current_thread == self.main_thread {
            return self.throw_kind(ErrorKind::YieldOutsideCoroutine);
        }
        self.transfer = values;
        Control::Yield
    }

    /// Whether the running context may yield.
    pub fn is_yieldable(&self) -> bool {
        self.current_thread != self.main_thread
    }
}
