//! Typed views over native memory
//!
//! A `ValueProxy` is a live window onto heap storage: an allocation, an
//! offset into it, a static type for the view, and an ownership tag.
//! Owning proxies come out of constructors and deep copies; Borrowing
//! proxies come out of field access, indexing and pointer dereference, and
//! write through to the same storage. Both kinds hold a root on their
//! allocation, so a field alias keeps the whole parent value alive.
//!
//! Reads materialize lazily: scalar leaves become host values, everything
//! else becomes another (borrowing) proxy. Writes go through staged
//! coercion and commit atomically.

use crate::coerce::{read_scalar, stage};
use crate::error::FfiError;
use crate::heap::{AllocId, Heap, Staged};
use crate::registry::TypeRegistry;
use crate::types::{TypeDesc, TypeKind};
use crate::value::Value;
use std::fmt;
use std::rc::Rc;

/// Whether a proxy created its storage or aliases someone else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owning,
    Borrowing,
}

pub struct ValueProxy {
    heap: Heap,
    alloc: AllocId,
    offset: usize,
    ty: Rc<TypeDesc>,
    ownership: Ownership,
}

impl Clone for ValueProxy {
    fn clone(&self) -> Self {
        self.heap.root(self.alloc);
        ValueProxy {
            heap: self.heap.clone(),
            alloc: self.alloc,
            offset: self.offset,
            ty: self.ty.clone(),
            ownership: self.ownership,
        }
    }
}

impl Drop for ValueProxy {
    fn drop(&mut self) {
        self.heap.unroot(self.alloc);
    }
}

impl ValueProxy {
    /// Fresh zero-initialized instance of `ty`.
    pub fn zero(heap: &Heap, ty: &Rc<TypeDesc>) -> Result<ValueProxy, FfiError> {
        require_sized(ty)?;
        let alloc = heap.allocate(ty, ty.size);
        Ok(ValueProxy::attach(heap, alloc, 0, ty, Ownership::Owning))
    }

    /// Fresh instance initialized by coercing `value`. Staging happens
    /// before any storage is retained, so a failed conversion creates
    /// nothing.
    pub fn from_value(
        heap: &Heap,
        ty: &Rc<TypeDesc>,
        value: &Value,
    ) -> Result<ValueProxy, FfiError> {
        require_sized(ty)?;
        let staged = stage(heap, ty, value)?;
        let alloc = heap.allocate(ty, ty.size);
        heap.commit(alloc, 0, &staged);
        Ok(ValueProxy::attach(heap, alloc, 0, ty, Ownership::Owning))
    }

    /// Fresh zeroed array of `len` elements, with an interned array type.
    pub fn array_zeroed(
        heap: &Heap,
        registry: &TypeRegistry,
        elem: &Rc<TypeDesc>,
        len: usize,
    ) -> Result<ValueProxy, FfiError> {
        require_sized(elem)?;
        let ty = registry.array_of(elem, Some(len));
        ValueProxy::zero(heap, &ty)
    }

    /// Fresh array sized and filled from a host value: an integer makes a
    /// zeroed array of that length, a sequence or string makes an array of
    /// exactly the host length.
    pub fn array_from(
        heap: &Heap,
        registry: &TypeRegistry,
        elem: &Rc<TypeDesc>,
        value: &Value,
    ) -> Result<ValueProxy, FfiError> {
        require_sized(elem)?;
        let len = match value {
            Value::Int(n) if *n >= 0 => return ValueProxy::array_zeroed(heap, registry, elem, *n as usize),
            Value::Int(n) => {
                return Err(FfiError::type_err(format!("negative array length {n}")))
            }
            Value::Seq(items) => items.len(),
            Value::Str(s) => s.len(),
            Value::Bytes(b) => b.len(),
            other => {
                return Err(FfiError::type_err(format!(
                    "cannot size an array from {}",
                    other.type_name()
                )))
            }
        };
        let ty = registry.array_of(elem, Some(len));
        ValueProxy::from_value(heap, &ty, value)
    }

    /// Deep copy of the viewed region into fresh storage. Bytes are copied
    /// along with the pointer side-table entries, so pointer fields in the
    /// copy alias the same targets as the original (identity, not clone).
    pub fn copy_of(&self) -> ValueProxy {
        // A view at offset 0 copies the whole allocation, so derived data
        // behind a base-typed view survives the copy with its tag.
        let (len, tag) = if self.offset == 0 {
            (self.heap.len_of(self.alloc), self.heap.tag(self.alloc))
        } else {
            (self.span(), self.ty.clone())
        };
        let snap = self.heap.snapshot(self.alloc, self.offset, len);
        let alloc = self.heap.allocate(&tag, len);
        self.heap.commit(alloc, 0, &snap);
        ValueProxy::attach(&self.heap, alloc, 0, &self.ty, Ownership::Owning)
    }

    /// Borrowing view of the same region.
    pub fn alias(&self) -> ValueProxy {
        ValueProxy::attach(
            &self.heap,
            self.alloc,
            self.offset,
            &self.ty,
            Ownership::Borrowing,
        )
    }

    pub(crate) fn attach(
        heap: &Heap,
        alloc: AllocId,
        offset: usize,
        ty: &Rc<TypeDesc>,
        ownership: Ownership,
    ) -> ValueProxy {
        heap.root(alloc);
        ValueProxy {
            heap: heap.clone(),
            alloc,
            offset,
            ty: ty.clone(),
            ownership,
        }
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// The view's static type.
    pub fn static_type(&self) -> &Rc<TypeDesc> {
        &self.ty
    }

    /// The most-derived type of the storage under this view: the
    /// allocation's tag when the view starts at offset 0, otherwise the
    /// static type. A base-typed proxy over a derived allocation resolves
    /// to the derived descriptor.
    pub fn resolved_type(&self) -> Rc<TypeDesc> {
        if self.offset == 0 {
            self.heap.tag(self.alloc)
        } else {
            self.ty.clone()
        }
    }

    /// Reinterpret the same storage under another type. Fails if the new
    /// view would extend past the allocation.
    pub fn view_as(&self, ty: &Rc<TypeDesc>) -> Result<ValueProxy, FfiError> {
        require_sized(ty)?;
        let avail = self.heap.len_of(self.alloc) - self.offset;
        if ty.size > avail {
            return Err(FfiError::type_err(format!(
                "'{}' ({} bytes) does not fit in the {} bytes at this view",
                ty.name, ty.size, avail
            )));
        }
        Ok(ValueProxy::attach(
            &self.heap,
            self.alloc,
            self.offset,
            ty,
            Ownership::Borrowing,
        ))
    }

    /// Borrowing alias of a named field, searching own fields and then the
    /// base chain.
    pub fn field(&self, name: &str) -> Result<ValueProxy, FfiError> {
        if !self.ty.is_composite() {
            return Err(FfiError::type_err(format!(
                "'{}' has no fields",
                self.ty.name
            )));
        }
        let (offset, ty) = self
            .ty
            .field(name)
            .ok_or_else(|| FfiError::Lookup(format!("{}.{}", self.ty.name, name)))?;
        Ok(ValueProxy::attach(
            &self.heap,
            self.alloc,
            self.offset + offset,
            &ty,
            Ownership::Borrowing,
        ))
    }

    /// Element count when the view is an array.
    pub fn len(&self) -> Option<usize> {
        match &self.ty.kind {
            TypeKind::Array { elem, len } => Some(match len {
                Some(n) => *n,
                None => (self.heap.len_of(self.alloc) - self.offset) / elem.size.max(1),
            }),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Borrowing alias of element `i`. Negative or past-the-end indices
    /// are errors; there is no wrap-around.
    pub fn index(&self, i: i64) -> Result<ValueProxy, FfiError> {
        let TypeKind::Array { elem, .. } = &self.ty.kind else {
            return Err(FfiError::type_err(format!(
                "'{}' is not indexable",
                self.ty.name
            )));
        };
        let len = self.len().unwrap_or(0);
        if i < 0 || i as usize >= len {
            return Err(FfiError::Index { index: i, len });
        }
        let elem = elem.clone();
        Ok(ValueProxy::attach(
            &self.heap,
            self.alloc,
            self.offset + i as usize * elem.size,
            &elem,
            Ownership::Borrowing,
        ))
    }

    /// Materialize the viewed value: scalars become host values, pointers
    /// dereference (null or untracked addresses become `Value::Null`),
    /// aggregates become borrowing proxies of themselves.
    pub fn get(&self) -> Result<Value, FfiError> {
        match &self.ty.kind {
            TypeKind::Scalar(kind) => {
                let bytes = self.heap.read(self.alloc, self.offset, self.ty.size);
                Ok(read_scalar(kind, &bytes))
            }
            TypeKind::Pointer { pointee } => {
                let bytes = self
                    .heap
                    .read(self.alloc, self.offset, std::mem::size_of::<usize>());
                let mut buf = [0u8; std::mem::size_of::<usize>()];
                buf.copy_from_slice(&bytes);
                let addr = usize::from_le_bytes(buf);
                if addr == 0 {
                    return Ok(Value::Null);
                }
                match self.heap.find_alloc(addr) {
                    Some((alloc, offset)) => {
                        let ty = if offset == 0 {
                            // Most-derived view of the pointee.
                            self.heap.tag(alloc)
                        } else {
                            pointee.clone()
                        };
                        Ok(Value::Proxy(ValueProxy::attach(
                            &self.heap,
                            alloc,
                            offset,
                            &ty,
                            Ownership::Borrowing,
                        )))
                    }
                    None => Ok(Value::Null),
                }
            }
            TypeKind::Composite { .. } | TypeKind::Array { .. } | TypeKind::Function { .. } => {
                Ok(Value::Proxy(self.alias()))
            }
            TypeKind::Void => Ok(Value::Null),
        }
    }

    /// `field(name).get()`.
    pub fn at(&self, name: &str) -> Result<Value, FfiError> {
        self.field(name)?.get()
    }

    /// `index(i).get()`.
    pub fn get_index(&self, i: i64) -> Result<Value, FfiError> {
        self.index(i)?.get()
    }

    /// Coerce `value` into the viewed region. Staging completes before any
    /// byte lands, so a failed conversion leaves the region untouched.
    pub fn set(&self, value: &Value) -> Result<(), FfiError> {
        let staged = stage(&self.heap, &self.ty, value)?;
        self.heap.commit(self.alloc, self.offset, &staged);
        Ok(())
    }

    /// `field(name).set(value)`.
    pub fn set_field(&self, name: &str, value: &Value) -> Result<(), FfiError> {
        self.field(name)?.set(value)
    }

    /// `index(i).set(value)`.
    pub fn set_index(&self, i: i64, value: &Value) -> Result<(), FfiError> {
        self.index(i)?.set(value)
    }

    /// Overwrite this whole view from another value. For a proxy source of
    /// a layout-compatible type this is a byte-level value copy, which is
    /// well-defined even when source and destination alias.
    pub fn assign(&self, value: &Value) -> Result<(), FfiError> {
        self.set(value)
    }

    /// Invoke the host callable behind a closure-backed function view.
    pub fn call(&self, args: &[Value]) -> Result<Value, FfiError> {
        if !matches!(self.ty.kind, TypeKind::Function { .. }) {
            return Err(FfiError::type_err(format!(
                "'{}' is not callable",
                self.ty.name
            )));
        }
        self.heap.call_closure(self.alloc, args)
    }

    /// Lazy borrowing iteration over array elements; each call starts a
    /// fresh pass.
    pub fn iter(&self) -> ArrayIter {
        ArrayIter {
            proxy: self.alias(),
            next: 0,
            len: self.len().unwrap_or(0),
        }
    }

    pub(crate) fn native_addr(&self) -> usize {
        self.heap.addr_of(self.alloc, self.offset)
    }

    pub(crate) fn alloc_id(&self) -> AllocId {
        self.alloc
    }

    pub(crate) fn snapshot(&self, len: usize) -> Staged {
        self.heap.snapshot(self.alloc, self.offset, len)
    }

    /// Byte length of the viewed region. Instance-sized array views extend
    /// to the end of the allocation.
    fn span(&self) -> usize {
        match &self.ty.kind {
            TypeKind::Array { len: None, .. } => self.heap.len_of(self.alloc) - self.offset,
            _ => self.ty.size,
        }
    }

    fn eq_inner(&self, other: &ValueProxy, visited: &mut Vec<(usize, usize)>) -> bool {
        if !Rc::ptr_eq(&self.ty, &other.ty) {
            return false;
        }
        let pair = (self.native_addr(), other.native_addr());
        if pair.0 == pair.1 {
            return true;
        }
        if visited.contains(&pair) {
            // Already comparing this pair further up the stack; assume
            // equal here and let the outer frames decide.
            return true;
        }
        visited.push(pair);
        let result = match &self.ty.kind {
            TypeKind::Scalar(_) => match (self.get(), other.get()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            },
            TypeKind::Composite { .. } => self.ty.fields().iter().all(|f| {
                match (self.field(&f.name), other.field(&f.name)) {
                    (Ok(a), Ok(b)) => a.eq_inner(&b, visited),
                    _ => false,
                }
            }),
            TypeKind::Array { .. } => {
                let (la, lb) = (self.len().unwrap_or(0), other.len().unwrap_or(0));
                la == lb
                    && (0..la as i64).all(|i| match (self.index(i), other.index(i)) {
                        (Ok(a), Ok(b)) => a.eq_inner(&b, visited),
                        _ => false,
                    })
            }
            TypeKind::Pointer { .. } => match (self.get(), other.get()) {
                (Ok(Value::Null), Ok(Value::Null)) => true,
                (Ok(Value::Proxy(a)), Ok(Value::Proxy(b))) => a.eq_inner(&b, visited),
                _ => false,
            },
            TypeKind::Function { .. } => pair.0 == pair.1,
            TypeKind::Void => true,
        };
        visited.pop();
        result
    }

    fn fmt_inner(&self, f: &mut fmt::Formatter<'_>, visited: &mut Vec<usize>) -> fmt::Result {
        let addr = self.native_addr();
        if visited.contains(&addr) {
            return write!(f, "...");
        }
        visited.push(addr);
        let result = match &self.ty.kind {
            TypeKind::Scalar(_) => match self.get() {
                Ok(v) => write!(f, "{v}"),
                Err(_) => write!(f, "<error>"),
            },
            TypeKind::Composite { .. } => {
                write!(f, "{}(", self.ty.name)?;
                let mut first = true;
                // Flattened order: base fields surface through the base
                // member's own formatting.
                for field in self.ty.fields() {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    write!(f, "{}=", field.name)?;
                    match self.field(&field.name) {
                        Ok(p) => p.fmt_inner(f, visited)?,
                        Err(_) => write!(f, "<error>")?,
                    }
                }
                write!(f, ")")
            }
            TypeKind::Array { .. } => {
                write!(f, "[")?;
                let len = self.len().unwrap_or(0);
                for i in 0..len as i64 {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match self.index(i) {
                        Ok(p) => p.fmt_inner(f, visited)?,
                        Err(_) => write!(f, "<error>")?,
                    }
                }
                write!(f, "]")
            }
            TypeKind::Pointer { .. } => match self.get() {
                Ok(Value::Null) => write!(f, "null"),
                Ok(Value::Proxy(p)) => {
                    write!(f, "&")?;
                    p.fmt_inner(f, visited)
                }
                _ => write!(f, "<error>"),
            },
            TypeKind::Function { .. } => write!(f, "<{} at {:#x}>", self.ty.name, addr),
            TypeKind::Void => write!(f, "void"),
        };
        visited.pop();
        result
    }
}

/// Structural equality over the viewed bytes: scalars by value, aggregates
/// element-wise, pointers by pointee (cycle-tolerant).
impl PartialEq for ValueProxy {
    fn eq(&self, other: &Self) -> bool {
        self.eq_inner(other, &mut Vec::new())
    }
}

impl fmt::Display for ValueProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_inner(f, &mut Vec::new())
    }
}

impl fmt::Debug for ValueProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ValueProxy({} {:?} @ {:#x})",
            self.ty.name,
            self.ownership,
            self.native_addr()
        )
    }
}

/// Borrowing element iterator over an array view.
pub struct ArrayIter {
    proxy: ValueProxy,
    next: usize,
    len: usize,
}

impl Iterator for ArrayIter {
    type Item = ValueProxy;

    fn next(&mut self) -> Option<ValueProxy> {
        if self.next >= self.len {
            return None;
        }
        let item = self.proxy.index(self.next as i64).ok()?;
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.len - self.next;
        (rest, Some(rest))
    }
}

/// Format a host value under its runtime-resolved type: a proxy is
/// reinterpreted through its allocation tag before formatting, so a
/// base-typed view over derived storage prints the derived fields.
pub fn describe(value: &Value) -> String {
    match value {
        Value::Proxy(p) => {
            let resolved = p.resolved_type();
            if Rc::ptr_eq(&resolved, &p.ty) {
                p.to_string()
            } else {
                match p.view_as(&resolved) {
                    Ok(view) => view.to_string(),
                    Err(_) => p.to_string(),
                }
            }
        }
        other => other.to_string(),
    }
}

fn require_sized(ty: &Rc<TypeDesc>) -> Result<(), FfiError> {
    match &ty.kind {
        TypeKind::Void => Err(FfiError::Unsupported("cannot instantiate void".into())),
        TypeKind::Function { .. } => Err(FfiError::Unsupported(format!(
            "cannot instantiate bare function type '{}'",
            ty.name
        ))),
        TypeKind::Array { len: None, .. } => Err(FfiError::Unsupported(format!(
            "cannot instantiate unsized array '{}'",
            ty.name
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::map_of;
    use pretty_assertions::assert_eq;

    fn fixture() -> (Heap, TypeRegistry) {
        (Heap::new(), TypeRegistry::new())
    }

    fn point(reg: &TypeRegistry) -> Rc<TypeDesc> {
        let i32t = reg.lookup("int32").unwrap();
        TypeDesc::layout("point", None, &[("x", &i32t), ("y", &i32t)]).unwrap()
    }

    #[test]
    fn test_zero_init_reads_back_zero() {
        let (heap, reg) = fixture();
        let p = ValueProxy::zero(&heap, &point(&reg)).unwrap();
        assert_eq!(p.at("x").unwrap(), Value::Int(0));
        assert_eq!(p.at("y").unwrap(), Value::Int(0));
    }

    #[test]
    fn test_field_alias_writes_through() {
        let (heap, reg) = fixture();
        let p = ValueProxy::zero(&heap, &point(&reg)).unwrap();
        let x = p.field("x").unwrap();
        assert_eq!(x.ownership(), Ownership::Borrowing);
        x.set(&Value::Int(11)).unwrap();
        assert_eq!(p.at("x").unwrap(), Value::Int(11));
    }

    #[test]
    fn test_unknown_field_is_lookup_error() {
        let (heap, reg) = fixture();
        let p = ValueProxy::zero(&heap, &point(&reg)).unwrap();
        assert!(matches!(p.field("zz"), Err(FfiError::Lookup(_))));
    }

    #[test]
    fn test_copy_is_independent_alias_is_not() {
        let (heap, reg) = fixture();
        let p = ValueProxy::from_value(
            &heap,
            &point(&reg),
            &Value::Seq(vec![Value::Int(1), Value::Int(2)]),
        )
        .unwrap();
        let copy = p.copy_of();
        let alias = p.alias();
        p.set_field("x", &Value::Int(99)).unwrap();
        assert_eq!(copy.at("x").unwrap(), Value::Int(1));
        assert_eq!(alias.at("x").unwrap(), Value::Int(99));
    }

    #[test]
    fn test_failed_write_leaves_target_untouched() {
        let (heap, reg) = fixture();
        let p = ValueProxy::from_value(
            &heap,
            &point(&reg),
            &Value::Seq(vec![Value::Int(1), Value::Int(2)]),
        )
        .unwrap();
        let err = p.set(&Value::Seq(vec![Value::Int(5), Value::Str("no".into())]));
        assert!(err.is_err());
        assert_eq!(p.at("x").unwrap(), Value::Int(1));
        assert_eq!(p.at("y").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_failed_construction_retains_nothing() {
        let (heap, reg) = fixture();
        let before = heap.live_allocations();
        let bad = ValueProxy::from_value(&heap, &point(&reg), &Value::Str("no".into()));
        assert!(bad.is_err());
        heap.collect();
        assert_eq!(heap.live_allocations(), before);
    }

    #[test]
    fn test_index_bounds() {
        let (heap, reg) = fixture();
        let i32t = reg.lookup("int32").unwrap();
        let arr = ValueProxy::array_zeroed(&heap, &reg, &i32t, 3).unwrap();
        assert_eq!(arr.len(), Some(3));
        arr.set_index(2, &Value::Int(5)).unwrap();
        assert_eq!(arr.get_index(2).unwrap(), Value::Int(5));
        assert_eq!(
            arr.index(3).unwrap_err(),
            FfiError::Index { index: 3, len: 3 }
        );
        assert_eq!(
            arr.index(-1).unwrap_err(),
            FfiError::Index { index: -1, len: 3 }
        );
    }

    #[test]
    fn test_array_from_int_and_seq_and_str() {
        let (heap, reg) = fixture();
        let i32t = reg.lookup("int32").unwrap();
        let a = ValueProxy::array_from(&heap, &reg, &i32t, &Value::Int(4)).unwrap();
        assert_eq!(a.len(), Some(4));
        assert_eq!(a.get_index(3).unwrap(), Value::Int(0));

        let b = ValueProxy::array_from(
            &heap,
            &reg,
            &i32t,
            &Value::Seq(vec![Value::Int(7), Value::Int(8)]),
        )
        .unwrap();
        assert_eq!(b.len(), Some(2));
        assert_eq!(b.get_index(1).unwrap(), Value::Int(8));

        let chart = reg.lookup("char").unwrap();
        let c = ValueProxy::array_from(&heap, &reg, &chart, &Value::Str("hi".into())).unwrap();
        assert_eq!(c.len(), Some(2));
        assert_eq!(c.get_index(0).unwrap(), Value::Bytes(vec![b'h']));
    }

    #[test]
    fn test_iter_is_lazy_and_restartable() {
        let (heap, reg) = fixture();
        let i32t = reg.lookup("int32").unwrap();
        let arr = ValueProxy::array_from(
            &heap,
            &reg,
            &i32t,
            &Value::Seq(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )
        .unwrap();
        let first: Vec<Value> = arr.iter().map(|p| p.get().unwrap()).collect();
        assert_eq!(first, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        // A second pass starts from the beginning and sees later writes.
        arr.set_index(0, &Value::Int(9)).unwrap();
        let second: Vec<Value> = arr.iter().map(|p| p.get().unwrap()).collect();
        assert_eq!(second[0], Value::Int(9));
    }

    #[test]
    fn test_pointer_roundtrip_and_null() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        let target = ValueProxy::from_value(
            &heap,
            &pt,
            &Value::Seq(vec![Value::Int(3), Value::Int(4)]),
        )
        .unwrap();
        let ptr_ty = reg.pointer_to(&pt);
        let holder =
            ValueProxy::from_value(&heap, &ptr_ty, &Value::Proxy(target.clone())).unwrap();
        match holder.get().unwrap() {
            Value::Proxy(p) => assert_eq!(p.at("x").unwrap(), Value::Int(3)),
            other => panic!("expected proxy, got {other}"),
        }
        holder.set(&Value::Null).unwrap();
        assert_eq!(holder.get().unwrap(), Value::Null);
    }

    #[test]
    fn test_assign_value_copy_between_proxies() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        let a = ValueProxy::from_value(
            &heap,
            &pt,
            &Value::Seq(vec![Value::Int(1), Value::Int(2)]),
        )
        .unwrap();
        let b = ValueProxy::zero(&heap, &pt).unwrap();
        b.assign(&Value::Proxy(a.clone())).unwrap();
        assert_eq!(b.at("x").unwrap(), Value::Int(1));
        // A later write to the source does not show through the copy.
        a.set_field("x", &Value::Int(50)).unwrap();
        assert_eq!(b.at("x").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_self_assignment_through_alias() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        let a = ValueProxy::from_value(
            &heap,
            &pt,
            &Value::Seq(vec![Value::Int(1), Value::Int(2)]),
        )
        .unwrap();
        let alias = a.alias();
        a.assign(&Value::Proxy(alias)).unwrap();
        assert_eq!(a.at("x").unwrap(), Value::Int(1));
        assert_eq!(a.at("y").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_display_and_structural_eq() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        let a = ValueProxy::from_value(
            &heap,
            &pt,
            &Value::Seq(vec![Value::Int(1), Value::Int(2)]),
        )
        .unwrap();
        assert_eq!(a.to_string(), "point(x=1, y=2)");
        let b = a.copy_of();
        assert_eq!(a, b);
        b.set_field("y", &Value::Int(3)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_cycle_guard() {
        let (heap, reg) = fixture();
        let i32t = reg.lookup("int32").unwrap();
        // Self-referential shape via an untyped pointer field.
        let voidp = reg.pointer_to(&reg.lookup("void").unwrap());
        let node = TypeDesc::layout("node", None, &[("v", &i32t), ("next", &voidp)]).unwrap();
        let n = ValueProxy::zero(&heap, &node).unwrap();
        n.set_field("v", &Value::Int(1)).unwrap();
        n.set_field("next", &Value::Proxy(n.alias())).unwrap();
        let shown = n.to_string();
        assert!(shown.contains("..."), "cycle not guarded: {shown}");
    }

    #[test]
    fn test_resolved_type_through_base_view() {
        let (heap, reg) = fixture();
        let i32t = reg.lookup("int32").unwrap();
        let base = TypeDesc::layout("base", None, &[("a", &i32t)]).unwrap();
        let derived =
            TypeDesc::layout("derived", Some(("b", &base)), &[("x", &i32t)]).unwrap();
        let d = ValueProxy::from_value(
            &heap,
            &derived,
            &Value::Seq(vec![Value::Seq(vec![Value::Int(1)]), Value::Int(2)]),
        )
        .unwrap();
        let as_base = d.view_as(&base).unwrap();
        assert_eq!(as_base.at("a").unwrap(), Value::Int(1));
        assert!(Rc::ptr_eq(&as_base.resolved_type(), &derived));
        // Dynamic formatting recovers the derived shape.
        assert_eq!(
            describe(&Value::Proxy(as_base)),
            "derived(b=base(a=1), x=2)"
        );
        // A mid-allocation view resolves to its static type only.
        let x = d.field("x").unwrap();
        assert!(Rc::ptr_eq(&x.resolved_type(), &i32t));
    }

    #[test]
    fn test_field_alias_keeps_allocation_alive() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        let x = {
            let p = ValueProxy::from_value(
                &heap,
                &pt,
                &Value::Seq(vec![Value::Int(42), Value::Int(0)]),
            )
            .unwrap();
            p.field("x").unwrap()
        };
        // Owning proxy dropped; the field alias still roots the storage.
        heap.collect();
        assert_eq!(x.get().unwrap(), Value::Int(42));
        drop(x);
        heap.collect();
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn test_view_as_rejects_oversized_view() {
        let (heap, reg) = fixture();
        let i32t = reg.lookup("int32").unwrap();
        let pt = point(&reg);
        let small = ValueProxy::zero(&heap, &i32t).unwrap();
        assert!(small.view_as(&pt).is_err());
    }
}
