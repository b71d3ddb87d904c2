// Value model through the VM: tag names, coercions, display.

use super::num;
use crate::{Value, Vm};

#[test]
fn tag_names_are_canonical() {
    let mut vm = Vm::default();
    assert_eq!(vm.type_name(Value::Nil), "nil");
    assert_eq!(vm.type_name(Value::Boolean(true)), "boolean");
    assert_eq!(vm.type_name(num(1.0)), "number");
    assert_eq!(vm.type_name(Value::vector(1.0, 2.0, 3.0)), "vector");
    let s = vm.intern("x").unwrap();
    assert_eq!(vm.type_name(s), "string");
    let t = vm.create_table(0, 0).unwrap();
    assert_eq!(vm.type_name(t), "table");
    let b = vm.create_buffer(4).unwrap();
    assert_eq!(vm.type_name(b), "buffer");
}

fn noop(_vm: &mut Vm, _args: Vec<Value>) -> crate::VmResult<Vec<Value>> {
    Ok(vec![])
}

#[test]
fn thread_and_function_tags() {
    let mut vm = Vm::default();
    let f = vm.create_native("noop", noop, vec![]).unwrap();
    assert_eq!(vm.type_name(f), "function");
    let co = vm.coroutine_create(f).unwrap();
    assert_eq!(vm.type_name(co), "thread");
}

#[test]
fn truthiness() {
    assert!(!Value::Nil.is_truthy());
    assert!(!Value::Boolean(false).is_truthy());
    assert!(Value::Boolean(true).is_truthy());
    assert!(num(0.0).is_truthy());
    assert!(Value::vector(0.0, 0.0, 0.0).is_truthy());
}

#[test]
fn vectors_compare_by_value() {
    let mut vm = Vm::default();
    let a = Value::vector(1.0, 2.0, 3.0);
    let b = Value::vector(1.0, 2.0, 3.0);
    assert!(vm.values_equal(a, b).unwrap());
    assert!(a.raw_equal(&b));
    let c = Value::vector(1.0, 2.0, 4.0);
    assert!(!vm.values_equal(a, c).unwrap());
}

#[test]
fn nan_is_not_equal_to_itself() {
    let mut vm = Vm::default();
    let nan = num(f64::NAN);
    assert!(!vm.values_equal(nan, nan).unwrap());
}

#[test]
fn display_and_coercion() {
    let mut vm = Vm::default();
    assert_eq!(vm.display_value(num(3.0)), "3");
    assert_eq!(vm.display_value(num(1.25)), "1.25");
    assert_eq!(vm.display_value(Value::Boolean(true)), "true");
    assert_eq!(vm.display_value(Value::Nil), "nil");

    let forty_two = vm.intern("42").unwrap();
    assert_eq!(vm.coerce_to_number(forty_two), Some(42.0));
    assert_eq!(vm.coerce_to_number(Value::Boolean(true)), None);

    let s = vm.coerce_to_string(num(7.0)).unwrap().unwrap();
    assert_eq!(vm.display_value(s), "7");
    assert!(vm.coerce_to_string(Value::Nil).unwrap().is_none());
}

#[test]
fn userdata_payload_and_explicit_close() {
    let mut vm = Vm::default();
    let ud = vm.create_userdata(Box::new(vec![1u8, 2, 3]), 17).unwrap();
    assert_eq!(vm.type_name(ud), "userdata");
    assert_eq!(vm.userdata_tag(ud), Some(17));
    assert_eq!(vm.userdata_ref::<Vec<u8>>(ud).unwrap(), &vec![1u8, 2, 3]);

    // no finalizers: the host closes the payload explicitly
    vm.close_userdata(ud).unwrap();
    assert!(vm.userdata_ref::<Vec<u8>>(ud).is_none());
    assert_eq!(vm.userdata_tag(ud), Some(17));
}

#[test]
fn length_of_strings_and_tables() {
    let mut vm = Vm::default();
    let s = vm.intern("hello").unwrap();
    assert_eq!(vm.length_of(s).unwrap(), num(5.0));
    let t = vm.create_table(0, 0).unwrap();
    for i in 1..=4 {
        vm.raw_set(t, num(i as f64), num(0.0)).unwrap();
    }
    assert_eq!(vm.length_of(t).unwrap(), num(4.0));

    let err = vm.length_of(num(1.0)).unwrap_err();
    assert_eq!(err, crate::Control::Raise);
    let msg = vm.display_value(vm.error_value);
    assert!(msg.contains("attempt to get length of a number value"), "{msg}");
}
