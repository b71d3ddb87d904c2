// Interpreter loop: arithmetic, control flow, calls, closures,
// varargs, vectors.

use super::num;
use crate::vm::{ArithOp, Instruction, MULTI, ProtoBuilder, UpvalDesc};
use crate::{Value, Vm};

#[test]
fn call_returns_sum() {
    let mut vm = Vm::default();
    let mut b = ProtoBuilder::new("sum").nparams(2).max_stack(4);
    b.emit(Instruction::Arith {
        op: ArithOp::Add,
        dst: 2,
        lhs: 0,
        rhs: 1,
    });
    b.emit(Instruction::Return { base: 2, count: 1 });
    let f = vm.create_closure(b.build()).unwrap();
    let r = vm.call(f, vec![num(1.0), num(2.0)]).unwrap();
    assert_eq!(r, vec![num(3.0)]);
}

#[test]
fn loop_accumulates() {
    let mut vm = Vm::default();
    let mut b = ProtoBuilder::new("loop").nparams(1).max_stack(6);
    let k1 = b.constant(num(1.0));
    let k0 = b.constant(num(0.0));
    b.emit(Instruction::LoadConst { dst: 1, k: k1 }); // i = 1
    b.emit(Instruction::LoadConst { dst: 2, k: k0 }); // acc = 0
    b.emit(Instruction::LoadConst { dst: 3, k: k1 }); // step
    b.emit(Instruction::Le { dst: 4, lhs: 1, rhs: 0 }); // pc 3: i <= n
    b.emit(Instruction::JumpIf {
        src: 4,
        expect: false,
        offset: 3,
    }); // exit -> pc 8
    b.emit(Instruction::Arith {
        op: ArithOp::Add,
        dst: 2,
        lhs: 2,
        rhs: 1,
    });
    b.emit(Instruction::Arith {
        op: ArithOp::Add,
        dst: 1,
        lhs: 1,
        rhs: 3,
    });
    b.emit(Instruction::Jump { offset: -5 }); // back to pc 3
    b.emit(Instruction::Return { base: 2, count: 1 });
    let f = vm.create_closure(b.build()).unwrap();
    let r = vm.call(f, vec![num(10.0)]).unwrap();
    assert_eq!(r, vec![num(55.0)]);
}

#[test]
fn multiple_returns_no_loss() {
    let mut vm = Vm::default();
    let mut b = ProtoBuilder::new("three").max_stack(4);
    let (ka, kb, kc) = (
        b.constant(num(1.0)),
        b.constant(num(2.0)),
        b.constant(num(3.0)),
    );
    b.emit(Instruction::LoadConst { dst: 0, k: ka });
    b.emit(Instruction::LoadConst { dst: 1, k: kb });
    b.emit(Instruction::LoadConst { dst: 2, k: kc });
    b.emit(Instruction::Return { base: 0, count: 3 });
    let f = vm.create_closure(b.build()).unwrap();
    let r = vm.call(f, vec![]).unwrap();
    assert_eq!(r, vec![num(1.0), num(2.0), num(3.0)]);
}

#[test]
fn closure_captures_local() {
    let mut vm = Vm::default();

    let mut child = ProtoBuilder::new("child").max_stack(2);
    child.upval(UpvalDesc::Local(0));
    child.emit(Instruction::GetUpval { dst: 0, idx: 0 });
    child.emit(Instruction::Return { base: 0, count: 1 });
    let child = child.build();

    let mut main = ProtoBuilder::new("main").max_stack(4);
    let k42 = main.constant(num(42.0));
    let p = main.child(child);
    main.emit(Instruction::LoadConst { dst: 0, k: k42 });
    main.emit(Instruction::Closure { dst: 1, p });
    main.emit(Instruction::Return { base: 1, count: 1 });

    let f = vm.create_closure(main.build()).unwrap();
    let closure = vm.call(f, vec![]).unwrap().remove(0);
    assert!(matches!(closure, Value::Function(_)));
    // The frame died, so the captured slot must have been closed out.
    let r = vm.call(closure, vec![]).unwrap();
    assert_eq!(r, vec![num(42.0)]);
}

#[test]
fn closed_upvalue_is_shared_and_mutable() {
    let mut vm = Vm::default();

    let mut child = ProtoBuilder::new("counter").max_stack(3);
    child.upval(UpvalDesc::Local(0));
    let k1 = child.constant(num(1.0));
    child.emit(Instruction::GetUpval { dst: 0, idx: 0 });
    child.emit(Instruction::LoadConst { dst: 1, k: k1 });
    child.emit(Instruction::Arith {
        op: ArithOp::Add,
        dst: 2,
        lhs: 0,
        rhs: 1,
    });
    child.emit(Instruction::SetUpval { idx: 0, src: 2 });
    child.emit(Instruction::Return { base: 2, count: 1 });
    let child = child.build();

    let mut main = ProtoBuilder::new("main").max_stack(4);
    let k0 = main.constant(num(0.0));
    let p = main.child(child);
    main.emit(Instruction::LoadConst { dst: 0, k: k0 });
    main.emit(Instruction::Closure { dst: 1, p });
    main.emit(Instruction::Return { base: 1, count: 1 });

    let f = vm.create_closure(main.build()).unwrap();
    let counter = vm.call(f, vec![]).unwrap().remove(0);
    assert_eq!(vm.call(counter, vec![]).unwrap(), vec![num(1.0)]);
    assert_eq!(vm.call(counter, vec![]).unwrap(), vec![num(2.0)]);
    assert_eq!(vm.call(counter, vec![]).unwrap(), vec![num(3.0)]);
}

#[test]
fn varargs_forwarded() {
    let mut vm = Vm::default();
    let mut b = ProtoBuilder::new("va").vararg().max_stack(4);
    b.emit(Instruction::Vararg { dst: 0, count: MULTI });
    b.emit(Instruction::Return { base: 0, count: MULTI });
    let f = vm.create_closure(b.build()).unwrap();
    let r = vm
        .call(f, vec![num(1.0), num(2.0), num(3.0)])
        .unwrap();
    assert_eq!(r, vec![num(1.0), num(2.0), num(3.0)]);
}

#[test]
fn tail_call_reuses_frame() {
    let mut vm = Vm::default();

    // leaf() -> 7
    let mut leaf = ProtoBuilder::new("leaf").max_stack(2);
    let k7 = leaf.constant(num(7.0));
    leaf.emit(Instruction::LoadConst { dst: 0, k: k7 });
    leaf.emit(Instruction::Return { base: 0, count: 1 });
    let leaf = leaf.build();

    // trampoline() -> return leaf()
    let mut tramp = ProtoBuilder::new("tramp").max_stack(4);
    let p = tramp.child(leaf);
    tramp.emit(Instruction::Closure { dst: 0, p });
    tramp.emit(Instruction::TailCall { func: 0, nargs: 0 });
    let f = vm.create_closure(tramp.build()).unwrap();
    assert_eq!(vm.call(f, vec![]).unwrap(), vec![num(7.0)]);
}

#[test]
fn vector_component_arithmetic() {
    let mut vm = Vm::default();
    let mut b = ProtoBuilder::new("vec").max_stack(4);
    let ka = b.constant(Value::vector(1.0, 2.0, 3.0));
    let kb = b.constant(Value::vector(10.0, 20.0, 30.0));
    b.emit(Instruction::LoadConst { dst: 0, k: ka });
    b.emit(Instruction::LoadConst { dst: 1, k: kb });
    b.emit(Instruction::Arith {
        op: ArithOp::Add,
        dst: 2,
        lhs: 0,
        rhs: 1,
    });
    b.emit(Instruction::Return { base: 2, count: 1 });
    let f = vm.create_closure(b.build()).unwrap();
    let r = vm.call(f, vec![]).unwrap();
    assert_eq!(r, vec![Value::vector(11.0, 22.0, 33.0)]);
}

#[test]
fn vector_scalar_scale_and_negate() {
    let mut vm = Vm::default();
    let v = Value::vector(1.0, -2.0, 4.0);
    let scaled = vm.arith(ArithOp::Mul, v, num(2.0)).unwrap();
    assert_eq!(scaled, Value::vector(2.0, -4.0, 8.0));
    let neg = vm.unary_minus(v).unwrap();
    assert_eq!(neg, Value::vector(-1.0, 2.0, -4.0));
}

#[test]
fn concat_coerces_numbers() {
    let mut vm = Vm::default();
    let x = vm.intern("x").unwrap();
    let out = vm.concat_values(vec![x, num(42.0)]).unwrap();
    let expected = vm.intern("x42").unwrap();
    assert_eq!(out, expected);
}

#[test]
fn arith_coerces_numeric_strings() {
    let mut vm = Vm::default();
    let ten = vm.intern("10").unwrap();
    let r = vm.arith(ArithOp::Add, ten, num(1.0)).unwrap();
    assert_eq!(r, num(11.0));
}

#[test]
fn interrupt_hook_stops_infinite_loop() {
    fn hook(vm: &mut Vm) -> crate::VmResult<()> {
        Err(vm.raise(Value::Boolean(true)))
    }

    let mut vm = Vm::default();
    let mut b = ProtoBuilder::new("spin").max_stack(2);
    b.emit(Instruction::Jump { offset: -1 });
    let f = vm.create_closure(b.build()).unwrap();
    vm.set_interrupt(Some(hook));
    let err = vm.call(f, vec![]).unwrap_err();
    assert!(matches!(err, crate::VmError::Runtime(_)));
}
