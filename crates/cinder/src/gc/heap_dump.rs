// Heap introspection: consistency validation for debug builds, a
// node+edge enumeration callback interface for external profilers, and
// a JSON snapshot for offline analysis.
//
// These are read-only observers of the object graph; they never mutate
// colors or contents.

use super::{Gc, GcData, GcId, GcKind, GcPhase, Upvalue};
use serde_json::{Map, Value as Json, json};

#[derive(Debug, Clone, Copy)]
pub struct HeapNode {
    pub id: GcId,
    pub kind: GcKind,
    pub size: usize,
    pub memcat: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct HeapEdge {
    pub from: GcId,
    pub to: GcId,
}

fn push_ref(v: &crate::value::Value, out: &mut Vec<GcId>) {
    if let Some(cid) = v.gc_id() {
        out.push(cid);
    }
}

fn proto_refs(p: &crate::vm::Proto, out: &mut Vec<GcId>) {
    for c in &p.constants {
        push_ref(c, out);
    }
    for child in &p.protos {
        proto_refs(child, out);
    }
}

/// Strong outgoing references of an object. Weak table halves are
/// reported when `include_weak` is set (the snapshot wants them, the
/// invariant check does not).
fn collect_children(gc: &Gc, id: GcId, include_weak: bool) -> Vec<GcId> {
    let mut out = Vec::new();
    match id {
        GcId::String(_) | GcId::Buffer(_) => {}
        GcId::Table(tid) => {
            let table = gc.pool.table(tid);
            let (weak_keys, weak_values) = gc.table_weakness(tid);
            // Ephemeron values are only conditionally live until the
            // atomic phase settles them, so they are not strong edges.
            let strong_values = !weak_values && !weak_keys;
            if let Some(mt) = table.metatable {
                out.push(GcId::Table(mt));
            }
            for v in table.iter_array() {
                if include_weak || strong_values {
                    push_ref(v, &mut out);
                }
            }
            for (k, v) in table.iter_entries() {
                if include_weak || !weak_keys {
                    push_ref(&k, &mut out);
                }
                if include_weak || strong_values {
                    push_ref(&v, &mut out);
                }
            }
        }
        GcId::Function(fid) => match gc.pool.closure(fid) {
            super::Closure::Script { proto, upvalues } => {
                proto_refs(proto, &mut out);
                out.extend(upvalues.iter().map(|&uv| GcId::Upvalue(uv)));
            }
            super::Closure::Native { upvalues, .. } => {
                for v in upvalues {
                    push_ref(v, &mut out);
                }
            }
        },
        GcId::Upvalue(uid) => match gc.pool.upvalue(uid) {
            Upvalue::Closed(v) => push_ref(v, &mut out),
            Upvalue::Open { .. } => {}
        },
        GcId::Thread(tid) => {
            let thread = gc.pool.thread(tid);
            for v in &thread.stack {
                push_ref(v, &mut out);
            }
            push_ref(&thread.entry, &mut out);
            push_ref(&thread.pending_error, &mut out);
            for ci in &thread.frames {
                push_ref(&ci.func, &mut out);
                for v in &ci.varargs {
                    push_ref(v, &mut out);
                }
            }
            out.extend(thread.open_upvalues.iter().map(|&(_, uv)| GcId::Upvalue(uv)));
        }
        GcId::Userdata(uid) => {
            if let Some(mt) = gc.pool.userdata(uid).metatable {
                out.push(GcId::Table(mt));
            }
        }
    }
    out
}

/// Walk the live object graph, reporting each node once and every
/// outgoing reference (weak edges included).
pub fn enumerate<N, E>(gc: &Gc, mut node_cb: N, mut edge_cb: E)
where
    N: FnMut(HeapNode),
    E: FnMut(HeapEdge),
{
    for (id, obj) in gc.pool.iter() {
        node_cb(HeapNode {
            id,
            kind: obj.data.kind(),
            size: obj.size(),
            memcat: obj.header.memcat,
        });
        for to in collect_children(gc, id, true) {
            edge_cb(HeapEdge { from: id, to });
        }
    }
}

fn node_label(id: GcId) -> String {
    format!("{}:{}", id.kind().name(), id.index())
}

/// Serialize the live heap: type, size, category and cross-references
/// per object, plus the per-category byte counters.
pub fn heap_snapshot(gc: &Gc) -> Json {
    let mut objects = Map::new();
    for (id, obj) in gc.pool.iter() {
        let mut entry = Map::new();
        entry.insert("type".into(), json!(obj.data.kind().name()));
        entry.insert("cat".into(), json!(obj.header.memcat));
        entry.insert("size".into(), json!(obj.size()));
        match &obj.data {
            GcData::Str(s) => {
                entry.insert("data".into(), json!(s.as_str()));
            }
            GcData::Table(t) => {
                entry.insert("entries".into(), json!(t.entry_count()));
            }
            GcData::Thread(t) => {
                entry.insert("status".into(), json!(t.status.name()));
            }
            GcData::Buffer(b) => {
                entry.insert("len".into(), json!(b.len()));
            }
            _ => {}
        }
        let refs: Vec<String> = collect_children(gc, id, true)
            .into_iter()
            .map(node_label)
            .collect();
        entry.insert("refs".into(), json!(refs));
        objects.insert(node_label(id), Json::Object(entry));
    }

    let categories: Map<String, Json> = (0..super::MEMORY_CATEGORIES)
        .filter(|&c| gc.memcat_bytes(c as u8) > 0)
        .map(|c| (c.to_string(), json!(gc.memcat_bytes(c as u8))))
        .collect();

    json!({
        "objects": Json::Object(objects),
        "stats": {
            "total_bytes": gc.total_bytes(),
            "object_count": gc.pool.len(),
            "categories": Json::Object(categories),
        },
    })
}

/// Full-graph consistency check. Returns the first violation found.
///
/// Checks: every reference resolves to a live object of the matching
/// kind; no black object references a white one over a strong edge
/// while the invariant phase holds; hash-part links stay in bounds;
/// open upvalues are registered under their owning thread and are
/// never black.
pub fn validate_heap(gc: &Gc) -> Result<(), String> {
    let invariant = gc.phase.keep_invariant() && gc.phase != GcPhase::Pause;
    let sweeping = gc.phase == GcPhase::Sweep;
    let other_white = gc.current_white ^ 1;
    for (id, obj) in gc.pool.iter() {
        // Mid-sweep, condemned objects may reference peers that were
        // already freed; they only need to be tagged dead correctly.
        if sweeping && obj.header.is_dead(other_white) && !obj.header.is_fixed() {
            continue;
        }
        if let GcData::Table(t) = &obj.data {
            if !t.check_links() {
                return Err(format!("{}: hash links out of bounds", node_label(id)));
            }
        }
        for to in collect_children(gc, id, true) {
            if !gc.pool.contains(to) {
                return Err(format!(
                    "{} references dead or mistyped {}",
                    node_label(id),
                    node_label(to)
                ));
            }
        }
        if invariant && obj.header.is_black() {
            for to in collect_children(gc, id, false) {
                if gc.pool.header(to).is_white() {
                    return Err(format!(
                        "black {} references white {}",
                        node_label(id),
                        node_label(to)
                    ));
                }
            }
        }
        if let GcData::Upvalue(uv) = &obj.data {
            if let Upvalue::Open { thread, slot } = **uv {
                if obj.header.is_black() {
                    return Err(format!("open {} is black", node_label(id)));
                }
                if !gc.pool.contains(GcId::Thread(thread)) {
                    return Err(format!("open {} owner thread is dead", node_label(id)));
                }
                let owner = gc.pool.thread(thread);
                let registered = owner
                    .open_upvalues
                    .iter()
                    .any(|&(s, u)| s == slot && GcId::Upvalue(u) == id);
                if !registered {
                    return Err(format!(
                        "open {} not registered on its owner thread",
                        node_label(id)
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Debug-build assertion wrapper.
pub fn assert_heap_valid(gc: &Gc) {
    if cfg!(debug_assertions) {
        if let Err(msg) = validate_heap(gc) {
            panic!("heap validation failed: {}", msg);
        }
    }
}
