// Coroutines: resume/yield as an execution-stack switch.
//
// A resume moves argument values onto the target thread's stack and
// re-enters the interpreter there; the resumer is parked in Normal
// state on the resume chain. Yield travels back as a Control value,
// leaving the suspended thread's frames intact for the next resume.

use super::error::{Control, VmError, VmResult};
use super::opcode::MULTI;
use super::thread::{Thread, ThreadStatus};
use super::Vm;
use crate::gc::ThreadId;
use crate::value::Value;

/// Outcome of one resume.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeResult {
    /// The coroutine returned; it is now dead (Finished).
    Return(Vec<Value>),
    /// The coroutine yielded these values and is Suspended again.
    Yield(Vec<Value>),
    /// The coroutine raised; it is now dead (Errored). Equivalent to
    /// the script-level `(false, error)` resume result.
    Error(Value),
    /// The interrupt hook requested a break; the thread is resumable.
    Break,
}

impl Vm {
    /// Create a suspended coroutine running `func`.
    pub fn coroutine_create(&mut self, func: Value) -> VmResult<Value> {
        if !matches!(func, Value::Function(_)) {
            return Err(self.throw_arg_error(1, Some("create"), "function", func.type_name()));
        }
        let memcat = self.gc.pool.thread(self.current_thread).memcat;
        self.allocator
            .create_thread(&mut self.gc, memcat, Thread::new(func, memcat))
    }

    pub fn coroutine_status(&self, co: ThreadId) -> ThreadStatus {
        self.gc.pool.thread(co).status
    }

    /// Resume a suspended coroutine with `args`. Resuming a thread in
    /// any other state is a status error; a raise inside the coroutine
    /// comes back as `ResumeResult::Error`, not as a host error.
    pub fn coroutine_resume(
        &mut self,
        co: ThreadId,
        args: Vec<Value>,
    ) -> Result<ResumeResult, VmError> {
        let status = self.gc.pool.thread(co).status;
        if !status.is_resumable() {
            return Err(VmError::CoroutineStatus(format!(
                "cannot resume {} coroutine",
                status.name()
            )));
        }

        let prev = self.current_thread;
        self.gc.pool.thread_mut(prev).status = ThreadStatus::Normal;
        self.resume_chain.push(prev);
        self.current_thread = co;
        self.gc.pool.thread_mut(co).status = ThreadStatus::Running;

        let outcome = self.resume_body(co, args);

        self.resume_chain.pop();
        self.current_thread = prev;
        self.gc.pool.thread_mut(prev).status = ThreadStatus::Running;

        match outcome {
            Ok(()) => {
                self.gc.pool.thread_mut(co).status = ThreadStatus::Finished;
                Ok(ResumeResult::Return(std::mem::take(&mut self.transfer)))
            }
            Err(Control::Yield) => {
                self.gc.pool.thread_mut(co).status = ThreadStatus::Suspended;
                Ok(ResumeResult::Yield(std::mem::take(&mut self.transfer)))
            }
            Err(Control::Raise) => {
                let err = std::mem::replace(&mut self.error_value, Value::Nil);
                let thread = self.gc.pool.thread_mut(co);
                thread.status = ThreadStatus::Errored;
                thread.pending_error = err;
                Ok(ResumeResult::Error(err))
            }
            Err(Control::Break) => {
                self.gc.pool.thread_mut(co).status = ThreadStatus::Break;
                Ok(ResumeResult::Break)
            }
            Err(Control::OutOfMemory) => {
                let thread = self.gc.pool.thread_mut(co);
                thread.status = ThreadStatus::Errored;
                Err(VmError::OutOfMemory)
            }
        }
    }

    fn resume_body(&mut self, co: ThreadId, args: Vec<Value>) -> VmResult<()> {
        let started = self.gc.pool.thread(co).started;
        if !started {
            let entry = {
                let thread = self.gc.pool.thread_mut(co);
                thread.started = true;
                std::mem::replace(&mut thread.entry, Value::Nil)
            };
            // First activation. Not `call_value`: a yield from the
            // entry function must pass through, not become a
            // cross-boundary error.
            match self.begin_call(entry, args, 0, MULTI)? {
                super::execute::Begun::Native => Ok(()),
                super::execute::Begun::Script => self.execute(0),
            }
        } else {
            // Deliver the resume arguments where the yield happened.
            if let Some(pending) = self.gc.pool.thread_mut(co).pending.take() {
                self.place_resume_values(co, pending.ret_base, pending.nresults, args);
            }
            self.execute(0)
        }
    }

    fn place_resume_values(
        &mut self,
        co: ThreadId,
        ret_base: usize,
        nresults: i16,
        values: Vec<Value>,
    ) {
        let thread = self.gc.pool.thread_mut(co);
        if nresults == MULTI {
            let n = values.len();
            thread.ensure_stack(ret_base + n);
            thread.stack[ret_base..ret_base + n].copy_from_slice(&values);
            if let Some(ci) = thread.frames.last_mut() {
                ci.top = ret_base + n;
            }
        } else {
            let n = nresults as usize;
            thread.ensure_stack(ret_base + n);
            for i in 0..n {
                thread.stack[ret_base + i] = values.get(i).copied().unwrap_or(Value::Nil);
            }
        }
    }

    /// Close a coroutine: reset it and release its stack. Legal on
    /// Suspended, Break and dead threads; returns the pending error of
    /// an Errored thread.
    pub fn coroutine_close(&mut self, co: ThreadId) -> Result<Option<Value>, VmError> {
        let status = self.gc.pool.thread(co).status;
        if matches!(status, ThreadStatus::Running | ThreadStatus::Normal) {
            return Err(VmError::CoroutineStatus(format!(
                "cannot close {} coroutine",
                status.name()
            )));
        }
        // Captured slots must not dangle once the stack is released.
        self.close_upvalues(co, 0);
        let thread = self.gc.pool.thread_mut(co);
        let err = thread.pending_error;
        thread.reset();
        Ok(if err.is_nil() { None } else { Some(err) })
    }
}
