// Protected calls: round-trips, message handlers, overflow, fatal
// conditions passing the barrier.

use super::{native_error, num};
use crate::vm::{Instruction, ProtoBuilder};
use crate::{Control, Value, Vm, VmResult};

#[test]
fn pcall_success_roundtrip() {
    let mut vm = Vm::default();
    let mut b = ProtoBuilder::new("ok").max_stack(4);
    let (k1, k2) = (b.constant(num(1.0)), b.constant(num(2.0)));
    b.emit(Instruction::LoadConst { dst: 0, k: k1 });
    b.emit(Instruction::LoadConst { dst: 1, k: k2 });
    b.emit(Instruction::Return { base: 0, count: 2 });
    let f = vm.create_closure(b.build()).unwrap();

    let (ok, vals) = vm.pcall(f, vec![]).unwrap();
    assert!(ok);
    assert_eq!(vals, vec![num(1.0), num(2.0)]);
}

#[test]
fn pcall_catches_raised_error_with_position() {
    let mut vm = Vm::default();
    let fail = vm.create_native("fail", native_error, vec![]).unwrap();
    vm.set_global("fail", fail).unwrap();

    let mut b = ProtoBuilder::new("chunk").max_stack(4);
    let kf = b.constant(vm.intern("fail").unwrap());
    let kmsg = b.constant(vm.intern("boom").unwrap());
    b.emit_line(Instruction::GetGlobal { dst: 0, k: kf }, 3);
    b.emit_line(Instruction::LoadConst { dst: 1, k: kmsg }, 3);
    b.emit_line(
        Instruction::Call {
            func: 0,
            nargs: 1,
            nresults: 0,
        },
        3,
    );
    b.emit_line(Instruction::Return { base: 0, count: 0 }, 4);
    let f = vm.create_closure(b.build()).unwrap();

    let (ok, vals) = vm.pcall(f, vec![]).unwrap();
    assert!(!ok);
    let msg = vm.display_value(vals[0]);
    assert!(msg.contains("boom"), "{msg}");
    assert!(msg.contains("chunk:3:"), "{msg}");
}

#[test]
fn pcall_restores_frames_and_stack() {
    let mut vm = Vm::default();
    let fail = vm.create_native("fail", native_error, vec![]).unwrap();
    let msg = vm.intern("nope").unwrap();

    let frames_before = vm.gc.pool.thread(vm.main_thread()).frames.len();
    let stack_before = vm.gc.pool.thread(vm.main_thread()).stack.len();
    let (ok, _) = vm.pcall(fail, vec![msg]).unwrap();
    assert!(!ok);
    assert_eq!(
        vm.gc.pool.thread(vm.main_thread()).frames.len(),
        frames_before
    );
    assert_eq!(
        vm.gc.pool.thread(vm.main_thread()).stack.len(),
        stack_before
    );

    // the vm is still perfectly usable
    let t = vm.create_table(0, 0).unwrap();
    vm.raw_set(t, num(1.0), num(10.0)).unwrap();
    assert_eq!(vm.raw_get(t, num(1.0)).unwrap(), num(10.0));
}

#[test]
fn xpcall_handler_transforms_error() {
    fn wrap(vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
        let text = vm.display_value(args[0]);
        let out = vm.intern(&format!("handled: {}", text))?;
        Ok(vec![out])
    }

    let mut vm = Vm::default();
    let fail = vm.create_native("fail", native_error, vec![]).unwrap();
    let handler = vm.create_native("wrap", wrap, vec![]).unwrap();
    let msg = vm.intern("original").unwrap();

    let (ok, vals) = vm.xpcall(fail, handler, vec![msg]).unwrap();
    assert!(!ok);
    let text = vm.display_value(vals[0]);
    assert!(text.starts_with("handled:"), "{text}");
    assert!(text.contains("original"), "{text}");
}

#[test]
fn failing_handler_is_replaced_by_safety_net() {
    fn bad_handler(vm: &mut Vm, _args: Vec<Value>) -> VmResult<Vec<Value>> {
        let v = vm.intern("handler exploded")?;
        Err(vm.raise(v))
    }

    let mut vm = Vm::default();
    let fail = vm.create_native("fail", native_error, vec![]).unwrap();
    let handler = vm.create_native("bad", bad_handler, vec![]).unwrap();
    let msg = vm.intern("first").unwrap();

    let (ok, vals) = vm.xpcall(fail, handler, vec![msg]).unwrap();
    assert!(!ok);
    assert_eq!(vm.display_value(vals[0]), "error in error handling");
}

#[test]
fn deep_recursion_overflows_catchably() {
    let mut vm = Vm::default();
    let mut b = ProtoBuilder::new("rec").max_stack(4);
    let k = b.constant(vm.intern("recurse").unwrap());
    b.emit(Instruction::GetGlobal { dst: 0, k });
    b.emit(Instruction::Call {
        func: 0,
        nargs: 0,
        nresults: 0,
    });
    b.emit(Instruction::Return { base: 0, count: 0 });
    let f = vm.create_closure(b.build()).unwrap();
    vm.set_global("recurse", f).unwrap();

    let (ok, vals) = vm.pcall(f, vec![]).unwrap();
    assert!(!ok);
    let msg = vm.display_value(vals[0]);
    assert!(msg.contains("stack overflow"), "{msg}");
}

#[test]
fn out_of_memory_passes_the_barrier() {
    fn hog(vm: &mut Vm, _args: Vec<Value>) -> VmResult<Vec<Value>> {
        loop {
            vm.create_table(64, 0)?;
        }
    }

    let mut vm = Vm::default();
    vm.gc.memory_limit = vm.gc_total_bytes() + 4096;
    // keep the collector from reclaiming the garbage mid-test
    vm.gc_stop();
    let f = vm.create_native("hog", hog, vec![]).unwrap();
    let err = vm.pcall(f, vec![]).unwrap_err();
    assert_eq!(err, Control::OutOfMemory);
}

#[test]
fn uncaught_error_reaches_host_with_text() {
    let mut vm = Vm::default();
    let fail = vm.create_native("fail", native_error, vec![]).unwrap();
    let msg = vm.intern("totally lost").unwrap();
    let err = vm.call(fail, vec![msg]).unwrap_err();
    match err {
        crate::VmError::Runtime(text) => assert!(text.contains("totally lost"), "{text}"),
        other => panic!("unexpected error: {other:?}"),
    }
}
