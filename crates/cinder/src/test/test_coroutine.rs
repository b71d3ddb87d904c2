// Coroutine lifecycle, value transfer and status discipline.

use super::{native_error, native_pcall, native_yield, num};
use crate::vm::{ArithOp, Instruction, ProtoBuilder, ThreadStatus};
use crate::{ResumeResult, Value, Vm, VmError};

/// `function(x) local y = yield(x + 1); return y * 2 end`
fn yield_double_proto(vm: &mut Vm) -> Value {
    let mut b = ProtoBuilder::new("co").nparams(1).max_stack(4);
    let ky = b.constant(vm.intern("yield").unwrap());
    let k1 = b.constant(num(1.0));
    let k2 = b.constant(num(2.0));
    b.emit(Instruction::GetGlobal { dst: 1, k: ky });
    b.emit(Instruction::LoadConst { dst: 2, k: k1 });
    b.emit(Instruction::Arith {
        op: ArithOp::Add,
        dst: 2,
        lhs: 0,
        rhs: 2,
    });
    b.emit(Instruction::Call {
        func: 1,
        nargs: 1,
        nresults: 1,
    });
    b.emit(Instruction::LoadConst { dst: 2, k: k2 });
    b.emit(Instruction::Arith {
        op: ArithOp::Mul,
        dst: 2,
        lhs: 1,
        rhs: 2,
    });
    b.emit(Instruction::Return { base: 2, count: 1 });
    vm.create_closure(b.build()).unwrap()
}

fn setup_yield(vm: &mut Vm) {
    let y = vm.create_native("yield", native_yield, vec![]).unwrap();
    vm.set_global("yield", y).unwrap();
}

#[test]
fn yield_resume_transfers_values() {
    let mut vm = Vm::default();
    setup_yield(&mut vm);
    let f = yield_double_proto(&mut vm);
    let co = vm.coroutine_create(f).unwrap();
    let co_id = co.as_thread_id().unwrap();

    assert_eq!(vm.coroutine_status(co_id), ThreadStatus::Suspended);
    assert_eq!(
        vm.coroutine_resume(co_id, vec![num(10.0)]).unwrap(),
        ResumeResult::Yield(vec![num(11.0)])
    );
    assert_eq!(vm.coroutine_status(co_id), ThreadStatus::Suspended);
    assert_eq!(
        vm.coroutine_resume(co_id, vec![num(5.0)]).unwrap(),
        ResumeResult::Return(vec![num(10.0)])
    );
    assert_eq!(vm.coroutine_status(co_id), ThreadStatus::Finished);
    assert_eq!(vm.coroutine_status(co_id).name(), "dead");
}

#[test]
fn resume_dead_is_a_status_error() {
    let mut vm = Vm::default();
    setup_yield(&mut vm);
    let f = yield_double_proto(&mut vm);
    let co = vm.coroutine_create(f).unwrap();
    let co_id = co.as_thread_id().unwrap();

    vm.coroutine_resume(co_id, vec![num(1.0)]).unwrap();
    vm.coroutine_resume(co_id, vec![num(1.0)]).unwrap();
    let err = vm.coroutine_resume(co_id, vec![]).unwrap_err();
    match err {
        VmError::CoroutineStatus(msg) => {
            assert_eq!(msg, "cannot resume dead coroutine");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn errored_coroutine_reports_and_stays_dead() {
    let mut vm = Vm::default();
    let fail = vm.create_native("fail", native_error, vec![]).unwrap();
    vm.set_global("fail", fail).unwrap();

    let mut b = ProtoBuilder::new("boom").max_stack(4);
    let kf = b.constant(vm.intern("fail").unwrap());
    let km = b.constant(vm.intern("inner error").unwrap());
    b.emit(Instruction::GetGlobal { dst: 0, k: kf });
    b.emit(Instruction::LoadConst { dst: 1, k: km });
    b.emit(Instruction::Call {
        func: 0,
        nargs: 1,
        nresults: 0,
    });
    b.emit(Instruction::Return { base: 0, count: 0 });
    let f = vm.create_closure(b.build()).unwrap();

    let co = vm.coroutine_create(f).unwrap();
    let co_id = co.as_thread_id().unwrap();
    match vm.coroutine_resume(co_id, vec![]).unwrap() {
        ResumeResult::Error(e) => {
            let msg = vm.display_value(e);
            assert!(msg.contains("inner error"), "{msg}");
        }
        other => panic!("expected error result, got {other:?}"),
    }
    assert_eq!(vm.coroutine_status(co_id), ThreadStatus::Errored);
    assert_eq!(vm.coroutine_status(co_id).name(), "dead");

    // close returns the pending error and resets the thread
    let err = vm.coroutine_close(co_id).unwrap().unwrap();
    assert!(vm.display_value(err).contains("inner error"));
    assert_eq!(vm.coroutine_status(co_id), ThreadStatus::Finished);
}

#[test]
fn close_running_is_an_error() {
    fn close_self(vm: &mut Vm, _args: Vec<Value>) -> crate::VmResult<Vec<Value>> {
        let current = vm.current_thread();
        assert!(vm.coroutine_close(current).is_err());
        Ok(vec![])
    }

    let mut vm = Vm::default();
    let f = vm.create_native("close_self", close_self, vec![]).unwrap();
    let co = vm.coroutine_create(f).unwrap();
    let co_id = co.as_thread_id().unwrap();
    // the assertion runs inside the coroutine
    assert!(matches!(
        vm.coroutine_resume(co_id, vec![]).unwrap(),
        ResumeResult::Return(_)
    ));
}

#[test]
fn close_suspended_releases_stack() {
    let mut vm = Vm::default();
    setup_yield(&mut vm);
    let f = yield_double_proto(&mut vm);
    let co = vm.coroutine_create(f).unwrap();
    let co_id = co.as_thread_id().unwrap();

    vm.coroutine_resume(co_id, vec![num(1.0)]).unwrap();
    assert!(vm.coroutine_close(co_id).unwrap().is_none());
    assert_eq!(vm.coroutine_status(co_id), ThreadStatus::Finished);
    assert!(vm.gc.pool.thread(co_id).stack.is_empty());
    assert!(vm.gc.pool.thread(co_id).frames.is_empty());
}

#[test]
fn yield_from_main_thread_is_an_error() {
    let mut vm = Vm::default();
    assert!(!vm.is_yieldable());
    let y = vm.create_native("yield", native_yield, vec![]).unwrap();
    let err = vm.call(y, vec![]).unwrap_err();
    match err {
        VmError::Runtime(msg) => {
            assert!(msg.contains("attempt to yield from outside a coroutine"), "{msg}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn yield_across_pcall_boundary_is_an_error() {
    let mut vm = Vm::default();
    setup_yield(&mut vm);
    let p = vm.create_native("pcall", native_pcall, vec![]).unwrap();
    vm.set_global("pcall", p).unwrap();

    // inner() yields; outer() runs pcall(inner) -> (false, msg)
    let mut inner = ProtoBuilder::new("inner").max_stack(4);
    let ky = inner.constant(vm.intern("yield").unwrap());
    inner.emit(Instruction::GetGlobal { dst: 0, k: ky });
    inner.emit(Instruction::Call {
        func: 0,
        nargs: 0,
        nresults: 0,
    });
    inner.emit(Instruction::Return { base: 0, count: 0 });
    let inner = inner.build();

    let mut outer = ProtoBuilder::new("outer").max_stack(6);
    let kp = outer.constant(vm.intern("pcall").unwrap());
    let p_child = outer.child(inner);
    outer.emit(Instruction::GetGlobal { dst: 0, k: kp });
    outer.emit(Instruction::Closure { dst: 1, p: p_child });
    outer.emit(Instruction::Call {
        func: 0,
        nargs: 1,
        nresults: 2,
    });
    outer.emit(Instruction::Return { base: 0, count: 2 });
    let f = vm.create_closure(outer.build()).unwrap();

    let co = vm.coroutine_create(f).unwrap();
    let co_id = co.as_thread_id().unwrap();
    match vm.coroutine_resume(co_id, vec![]).unwrap() {
        ResumeResult::Return(vals) => {
            assert_eq!(vals[0], Value::Boolean(false));
            let msg = vm.display_value(vals[1]);
            assert!(msg.contains("yield across a native call boundary"), "{msg}");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn resumer_is_normal_while_child_runs() {
    fn check_status(vm: &mut Vm, args: Vec<Value>) -> crate::VmResult<Vec<Value>> {
        let parent = args[0].as_thread_id().unwrap();
        assert_eq!(vm.coroutine_status(parent), ThreadStatus::Normal);
        assert_eq!(
            vm.coroutine_status(vm.current_thread()),
            ThreadStatus::Running
        );
        Ok(vec![])
    }

    fn resume_child(vm: &mut Vm, _args: Vec<Value>) -> crate::VmResult<Vec<Value>> {
        let this = vm.current_thread();
        let checker = vm.create_native("check_status", check_status, vec![])?;
        let child = vm.coroutine_create(checker)?;
        let child_id = child.as_thread_id().unwrap();
        let r = vm
            .coroutine_resume(child_id, vec![Value::Thread(this)])
            .expect("child resume");
        assert!(matches!(r, ResumeResult::Return(_)));
        Ok(vec![])
    }

    let mut vm = Vm::default();
    let f = vm.create_native("resume_child", resume_child, vec![]).unwrap();
    let co = vm.coroutine_create(f).unwrap();
    let co_id = co.as_thread_id().unwrap();
    assert!(matches!(
        vm.coroutine_resume(co_id, vec![]).unwrap(),
        ResumeResult::Return(_)
    ));
}
