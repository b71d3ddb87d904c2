// Collector behavior: reachability, incremental stepping with live
// mutation, write barriers, weak tables, categories, introspection.

use super::{native_yield, num};
use crate::gc::{GcId, GcPhase};
use crate::vm::{Instruction, ProtoBuilder};
use crate::{ResumeResult, Value, Vm};

#[test]
fn unreachable_objects_are_collected() {
    let mut vm = Vm::default();
    let garbage = vm.create_table(8, 8).unwrap();
    let id = GcId::Table(garbage.as_table_id().unwrap());
    assert!(vm.gc.pool.contains(id));
    vm.gc_full();
    assert!(!vm.gc.pool.contains(id));
}

#[test]
fn rooted_objects_survive() {
    let mut vm = Vm::default();
    let t = vm.create_table(0, 0).unwrap();
    vm.raw_set(t, num(1.0), num(99.0)).unwrap();
    vm.set_global("keep", t).unwrap();
    vm.gc_full();
    vm.gc_full();
    let t = vm.get_global("keep").unwrap();
    assert_eq!(vm.raw_get(t, num(1.0)).unwrap(), num(99.0));
}

#[test]
fn incremental_cycle_with_mutator_interleaved() {
    let mut vm = Vm::default();
    let live = vm.create_table(0, 8).unwrap();
    vm.set_global("live", live).unwrap();

    // Interleave bounded GC steps with mutation: every store may hit a
    // black parent and must be caught by the backward barrier.
    let mut stored = Vec::new();
    let mut steps = 0;
    while vm.gc.stats.cycles < 2 {
        vm.gc_step();
        steps += 1;
        vm.validate_heap().unwrap_or_else(|e| panic!("step {steps}: {e}"));
        let child = vm.create_table(0, 0).unwrap();
        let key = num(steps as f64);
        vm.raw_set(child, num(1.0), key).unwrap();
        vm.raw_set(live, key, child).unwrap();
        stored.push(key);
        assert!(steps < 100_000, "collector never finished a cycle");
    }

    // Nothing reachable was lost.
    vm.gc_full();
    let live = vm.get_global("live").unwrap();
    for key in stored {
        let child = vm.raw_get(live, key).unwrap();
        assert!(matches!(child, Value::Table(_)), "lost child {key:?}");
        assert_eq!(vm.raw_get(child, num(1.0)).unwrap(), key);
    }
}

#[test]
fn phases_advance_in_order() {
    let mut vm = Vm::default();
    // seed some work
    for _ in 0..32 {
        let t = vm.create_table(2, 2).unwrap();
        vm.set_global("seed", t).unwrap();
    }
    assert_eq!(vm.gc.phase, GcPhase::Pause);
    let mut seen = vec![GcPhase::Pause];
    for _ in 0..100_000 {
        vm.gc_step();
        if *seen.last().unwrap() != vm.gc.phase {
            seen.push(vm.gc.phase);
        }
        if vm.gc.stats.cycles > 0 && vm.gc.phase == GcPhase::Pause {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            GcPhase::Pause,
            GcPhase::Propagate,
            GcPhase::PropagateAgain,
            GcPhase::Sweep,
            GcPhase::Pause,
        ]
    );
}

#[test]
fn weak_values_are_cleared() {
    let mut vm = Vm::default();
    let mt = vm.create_table(0, 2).unwrap();
    let mode_key = vm.intern("__mode").unwrap();
    let v_mode = vm.intern("v").unwrap();
    vm.raw_set(mt, mode_key, v_mode).unwrap();

    let cache = vm.create_table(0, 4).unwrap();
    vm.set_metatable(cache, mt.as_table_id()).unwrap();
    vm.set_global("cache", cache).unwrap();

    let dead = vm.create_table(0, 0).unwrap();
    let dead_id = GcId::Table(dead.as_table_id().unwrap());
    vm.raw_set(cache, num(1.0), dead).unwrap();

    let kept = vm.create_table(0, 0).unwrap();
    vm.raw_set(cache, num(2.0), kept).unwrap();
    vm.set_global("kept", kept).unwrap();

    vm.gc_full();

    let cache = vm.get_global("cache").unwrap();
    assert!(vm.raw_get(cache, num(1.0)).unwrap().is_nil());
    assert!(!vm.gc.pool.contains(dead_id));
    assert!(matches!(vm.raw_get(cache, num(2.0)).unwrap(), Value::Table(_)));
}

#[test]
fn ephemeron_entries_follow_key_liveness() {
    let mut vm = Vm::default();
    let mt = vm.create_table(0, 2).unwrap();
    let mode_key = vm.intern("__mode").unwrap();
    let k_mode = vm.intern("k").unwrap();
    vm.raw_set(mt, mode_key, k_mode).unwrap();

    let t = vm.create_table(0, 4).unwrap();
    vm.set_metatable(t, mt.as_table_id()).unwrap();
    vm.set_global("weak_keys", t).unwrap();

    let dead_key = vm.create_table(0, 0).unwrap();
    let dead_val = vm.create_table(0, 0).unwrap();
    let dead_val_id = GcId::Table(dead_val.as_table_id().unwrap());
    vm.raw_set(t, dead_key, dead_val).unwrap();

    let live_key = vm.create_table(0, 0).unwrap();
    vm.set_global("live_key", live_key).unwrap();
    vm.raw_set(t, live_key, num(7.0)).unwrap();

    vm.gc_full();

    let t = vm.get_global("weak_keys").unwrap();
    let live_key = vm.get_global("live_key").unwrap();
    assert_eq!(vm.raw_get(t, live_key).unwrap(), num(7.0));
    // dead key's entry went away, and so did the value it retained
    assert!(!vm.gc.pool.contains(dead_val_id));
    let mut count = 0;
    let mut key = Value::Nil;
    while let Some((k, _)) = vm.table_next(t, key).unwrap() {
        count += 1;
        key = k;
    }
    assert_eq!(count, 1);
}

#[test]
fn memory_categories_account_bytes() {
    let mut vm = Vm::default();
    assert_eq!(vm.gc_category_bytes(7), 0);
    vm.set_memory_category(7);
    let b = vm.create_buffer(4096).unwrap();
    // back to the default category so bookkeeping allocations (interned
    // global names) stay out of category 7
    vm.set_memory_category(0);
    assert!(vm.gc_category_bytes(7) >= 4096);
    vm.set_global("buf", b).unwrap();
    vm.gc_full();
    assert!(vm.gc_category_bytes(7) >= 4096);

    // untie and collect: the category drains back to zero
    vm.set_global("buf", Value::Nil).unwrap();
    vm.gc_full();
    assert_eq!(vm.gc_category_bytes(7), 0);
}

#[test]
fn suspended_coroutine_stack_is_a_root() {
    let mut vm = Vm::default();
    let y = vm.create_native("yield", native_yield, vec![]).unwrap();
    vm.set_global("yield", y).unwrap();

    // function(t) yield(); return t end
    let mut b = ProtoBuilder::new("hold").nparams(1).max_stack(4);
    let ky = b.constant(vm.intern("yield").unwrap());
    b.emit(Instruction::GetGlobal { dst: 1, k: ky });
    b.emit(Instruction::Call {
        func: 1,
        nargs: 0,
        nresults: 0,
    });
    b.emit(Instruction::Return { base: 0, count: 1 });
    let f = vm.create_closure(b.build()).unwrap();

    let co = vm.coroutine_create(f).unwrap();
    vm.set_global("co", co).unwrap();
    let co_id = co.as_thread_id().unwrap();

    let t = vm.create_table(0, 0).unwrap();
    vm.raw_set(t, num(1.0), num(123.0)).unwrap();
    let t_id = GcId::Table(t.as_table_id().unwrap());
    assert!(matches!(
        vm.coroutine_resume(co_id, vec![t]).unwrap(),
        ResumeResult::Yield(_)
    ));

    // the only reference to t now lives in the suspended stack
    vm.gc_full();
    assert!(vm.gc.pool.contains(t_id));

    match vm.coroutine_resume(co_id, vec![]).unwrap() {
        ResumeResult::Return(vals) => {
            assert_eq!(vm.raw_get(vals[0], num(1.0)).unwrap(), num(123.0));
        }
        other => panic!("unexpected {other:?}"),
    }

    // once the coroutine is dead and collected, the table goes too
    vm.set_global("co", Value::Nil).unwrap();
    vm.gc_full();
    assert!(!vm.gc.pool.contains(t_id));
}

#[test]
fn heap_snapshot_lists_every_live_object() {
    let mut vm = Vm::default();
    let t = vm.create_table(0, 4).unwrap();
    let name = vm.intern("snapshot-me").unwrap();
    vm.raw_set(t, num(1.0), name).unwrap();
    vm.set_global("t", t).unwrap();
    let b = vm.create_buffer(64).unwrap();
    vm.set_global("b", b).unwrap();

    let snap = vm.heap_snapshot();
    let objects = snap["objects"].as_object().unwrap();
    assert_eq!(objects.len(), vm.gc.pool.len());
    assert_eq!(
        snap["stats"]["object_count"].as_u64().unwrap() as usize,
        vm.gc.pool.len()
    );
    assert_eq!(
        snap["stats"]["total_bytes"].as_u64().unwrap() as usize,
        vm.gc_total_bytes()
    );

    // the table's entry lists its reference to the string
    let t_label = format!("table:{}", t.as_table_id().unwrap().0);
    let refs = objects[t_label.as_str()]["refs"].as_array().unwrap();
    let s_label = format!("string:{}", name.as_string_id().unwrap().0);
    assert!(refs.iter().any(|r| r.as_str() == Some(s_label.as_str())));
}

#[test]
fn heap_enumeration_matches_pool() {
    let mut vm = Vm::default();
    for i in 0..8 {
        let t = vm.create_table(0, 0).unwrap();
        vm.set_global(&format!("t{i}"), t).unwrap();
    }
    let mut nodes = 0usize;
    let mut edges = 0usize;
    vm.enumerate_heap(|_n| nodes += 1, |_e| edges += 1);
    assert_eq!(nodes, vm.gc.pool.len());
    assert!(edges > 0);
    vm.validate_heap().unwrap();
}

#[test]
fn collector_can_be_stopped_and_restarted() {
    let mut vm = Vm::default();
    let garbage = vm.create_table(8, 8).unwrap();
    let id = GcId::Table(garbage.as_table_id().unwrap());
    vm.gc_stop();
    vm.gc_full();
    assert!(vm.gc.pool.contains(id), "stopped collector must not run");
    vm.gc_restart();
    vm.gc_full();
    assert!(!vm.gc.pool.contains(id));
}
