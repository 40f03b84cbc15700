//! Descriptor interning and lookup
//!
//! The registry is the single source of descriptor identity: named lookup
//! returns the same `Rc` for the same name, and derived builders (arrays,
//! pointers, function types) are memoized by element identity, so two
//! structurally equal derived descriptors are pointer-equal. Coercion and
//! aliasing checks rely on this.

use crate::error::FfiError;
use crate::types::{ScalarKind, TypeDesc};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Memoization key for a derived descriptor, by element identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DerivedKey {
    Array { elem: usize, len: Option<usize> },
    Pointer { pointee: usize },
    Function { params: Vec<usize>, ret: usize },
}

fn ident(ty: &Rc<TypeDesc>) -> usize {
    Rc::as_ptr(ty) as usize
}

/// Named descriptor table plus derived-descriptor cache.
#[derive(Debug)]
pub struct TypeRegistry {
    named: RefCell<HashMap<String, Rc<TypeDesc>>>,
    derived: RefCell<HashMap<DerivedKey, Rc<TypeDesc>>>,
}

impl TypeRegistry {
    /// Registry pre-populated with the builtin scalars and `void`.
    pub fn new() -> Self {
        let reg = TypeRegistry {
            named: RefCell::new(HashMap::new()),
            derived: RefCell::new(HashMap::new()),
        };
        for width in [1usize, 2, 4, 8] {
            reg.insert(TypeDesc::scalar(
                &format!("int{}", width * 8),
                ScalarKind::Int {
                    signed: true,
                    width,
                },
            ));
            reg.insert(TypeDesc::scalar(
                &format!("uint{}", width * 8),
                ScalarKind::Int {
                    signed: false,
                    width,
                },
            ));
        }
        reg.insert(TypeDesc::scalar("float32", ScalarKind::Float { width: 4 }));
        reg.insert(TypeDesc::scalar("float64", ScalarKind::Float { width: 8 }));
        reg.insert(TypeDesc::scalar("char", ScalarKind::Char { signed: true }));
        reg.insert(TypeDesc::scalar("uchar", ScalarKind::Char { signed: false }));
        reg.insert(TypeDesc::scalar("bool", ScalarKind::Bool));
        reg.insert(TypeDesc::void());
        reg
    }

    fn insert(&self, ty: Rc<TypeDesc>) {
        self.named.borrow_mut().insert(ty.name.clone(), ty);
    }

    /// Register a descriptor under its own name, replacing any previous
    /// binding of that name. Returns the registered `Rc`.
    pub fn register(&self, ty: Rc<TypeDesc>) -> Rc<TypeDesc> {
        self.insert(ty.clone());
        ty
    }

    /// Look up a named descriptor.
    pub fn lookup(&self, name: &str) -> Result<Rc<TypeDesc>, FfiError> {
        self.named
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| FfiError::Lookup(name.to_string()))
    }

    /// Fixed-length (`len = Some`) or instance-sized (`len = None`) array
    /// descriptor over `elem`, memoized.
    pub fn array_of(&self, elem: &Rc<TypeDesc>, len: Option<usize>) -> Rc<TypeDesc> {
        let key = DerivedKey::Array {
            elem: ident(elem),
            len,
        };
        self.derived
            .borrow_mut()
            .entry(key)
            .or_insert_with(|| TypeDesc::array(elem, len))
            .clone()
    }

    /// Pointer descriptor over `pointee`, memoized.
    pub fn pointer_to(&self, pointee: &Rc<TypeDesc>) -> Rc<TypeDesc> {
        let key = DerivedKey::Pointer {
            pointee: ident(pointee),
        };
        self.derived
            .borrow_mut()
            .entry(key)
            .or_insert_with(|| TypeDesc::pointer(pointee))
            .clone()
    }

    /// Function descriptor with the given signature, memoized.
    pub fn function_of(&self, params: &[Rc<TypeDesc>], ret: &Rc<TypeDesc>) -> Rc<TypeDesc> {
        let key = DerivedKey::Function {
            params: params.iter().map(ident).collect(),
            ret: ident(ret),
        };
        self.derived
            .borrow_mut()
            .entry(key)
            .or_insert_with(|| TypeDesc::function(params, ret))
            .clone()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
