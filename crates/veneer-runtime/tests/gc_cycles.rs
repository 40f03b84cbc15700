//! Reclamation of reference cycles through native pointer fields.

use pretty_assertions::assert_eq;
use std::rc::Rc;
use veneer_runtime::{Heap, TypeDesc, TypeRegistry, Value, ValueProxy};

/// node { v: int32, next: void* }, self-referential through an untyped
/// pointer field.
fn node_type(reg: &TypeRegistry) -> Rc<TypeDesc> {
    let i32t = reg.lookup("int32").unwrap();
    let voidp = reg.pointer_to(&reg.lookup("void").unwrap());
    TypeDesc::layout("node", None, &[("v", &i32t), ("next", &voidp)]).unwrap()
}

#[test]
fn two_node_cycle_is_reclaimed() {
    let heap = Heap::new();
    let reg = TypeRegistry::new();
    let node = node_type(&reg);
    {
        let a = ValueProxy::zero(&heap, &node).unwrap();
        let b = ValueProxy::zero(&heap, &node).unwrap();
        a.set_field("next", &Value::Proxy(b.alias())).unwrap();
        b.set_field("next", &Value::Proxy(a.alias())).unwrap();
    }
    // The nodes keep each other reachable; only the collector can free
    // them once no proxy roots remain.
    heap.collect();
    assert_eq!(heap.live_allocations(), 0);
}

#[test]
fn self_cycle_is_reclaimed() {
    let heap = Heap::new();
    let reg = TypeRegistry::new();
    let node = node_type(&reg);
    {
        let a = ValueProxy::zero(&heap, &node).unwrap();
        a.set_field("next", &Value::Proxy(a.alias())).unwrap();
    }
    heap.collect();
    assert_eq!(heap.live_allocations(), 0);
}

#[test]
fn rooted_cycle_survives_collection() {
    let heap = Heap::new();
    let reg = TypeRegistry::new();
    let node = node_type(&reg);
    let a = ValueProxy::zero(&heap, &node).unwrap();
    {
        let b = ValueProxy::zero(&heap, &node).unwrap();
        a.set_field("next", &Value::Proxy(b.alias())).unwrap();
        b.set_field("next", &Value::Proxy(a.alias())).unwrap();
    }
    heap.collect();
    assert_eq!(heap.live_allocations(), 2);
    a.set_field("v", &Value::Int(1)).unwrap();
    // Follow the cycle one full turn.
    let Value::Proxy(b) = a.at("next").unwrap() else {
        panic!("edge lost");
    };
    let Value::Proxy(back) = b.at("next").unwrap() else {
        panic!("edge lost");
    };
    assert_eq!(back.at("v").unwrap(), Value::Int(1));
    drop(back);
    drop(b);
    drop(a);
    heap.collect();
    assert_eq!(heap.live_allocations(), 0);
}

#[test]
fn breaking_the_cycle_by_nulling_an_edge_frees_the_rest() {
    let heap = Heap::new();
    let reg = TypeRegistry::new();
    let node = node_type(&reg);
    let a = ValueProxy::zero(&heap, &node).unwrap();
    {
        let b = ValueProxy::zero(&heap, &node).unwrap();
        a.set_field("next", &Value::Proxy(b.alias())).unwrap();
        b.set_field("next", &Value::Proxy(a.alias())).unwrap();
    }
    a.set_field("next", &Value::Null).unwrap();
    heap.collect();
    // b was reachable only through a's severed edge.
    assert_eq!(heap.live_allocations(), 1);
}

#[test]
fn sustained_cycle_churn_stays_bounded() {
    let heap = Heap::new();
    let reg = TypeRegistry::new();
    let node = node_type(&reg);
    // Abandon a fresh cycle every iteration. Automatic collection keeps
    // the arena bounded without any explicit collect() call.
    for i in 0..50_000i64 {
        let a = ValueProxy::zero(&heap, &node).unwrap();
        let b = ValueProxy::zero(&heap, &node).unwrap();
        a.set_field("v", &Value::Int(i)).unwrap();
        a.set_field("next", &Value::Proxy(b.alias())).unwrap();
        b.set_field("next", &Value::Proxy(a.alias())).unwrap();
    }
    assert!(
        heap.live_allocations() < 8192,
        "arena grew unbounded: {}",
        heap.live_allocations()
    );
    heap.collect();
    assert_eq!(heap.live_allocations(), 0);
}

#[test]
fn cyclic_array_of_pointers_is_reclaimed() {
    let heap = Heap::new();
    let reg = TypeRegistry::new();
    let voidp = reg.pointer_to(&reg.lookup("void").unwrap());
    {
        let arr = ValueProxy::array_from(&heap, &reg, &voidp, &Value::Int(3)).unwrap();
        // Every element points back at the array itself.
        for i in 0..3 {
            arr.set_index(i, &Value::Proxy(arr.alias())).unwrap();
        }
    }
    heap.collect();
    assert_eq!(heap.live_allocations(), 0);
}
