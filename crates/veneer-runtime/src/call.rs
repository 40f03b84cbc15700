//! Outbound foreign calls
//!
//! A `ForeignFunction` binds a native code address to a `Function`
//! descriptor and dispatches through libffi: arguments are staged by the
//! coercion engine into scratch buffers, the call goes out via `ffi_call`,
//! and the return value is marshaled back into a host [`Value`].
//!
//! libffi widens integral returns narrower than `ffi_arg` to a full
//! register slot; the return buffer is sized for that and decoded from its
//! low bytes (little-endian targets).

use crate::coerce::{read_scalar, stage};
use crate::error::FfiError;
use crate::heap::{Heap, Staged};
use crate::proxy::{Ownership, ValueProxy};
use crate::types::{ScalarKind, TypeDesc, TypeKind};
use crate::value::Value;
use libffi::low::ffi_arg;
use libffi::middle::{Cif, CodePtr, Type};
use libffi::raw;
use std::os::raw::c_void;
use std::rc::Rc;

/// Translate a descriptor to its libffi call-interface type.
pub(crate) fn ffi_type_of(ty: &Rc<TypeDesc>) -> Result<Type, FfiError> {
    match &ty.kind {
        TypeKind::Scalar(kind) => Ok(match kind {
            ScalarKind::Int { signed, width } => match (signed, width) {
                (true, 1) => Type::i8(),
                (true, 2) => Type::i16(),
                (true, 4) => Type::i32(),
                (true, 8) => Type::i64(),
                (false, 1) => Type::u8(),
                (false, 2) => Type::u16(),
                (false, 4) => Type::u32(),
                (false, 8) => Type::u64(),
                _ => {
                    return Err(FfiError::Unsupported(format!(
                        "integer width {width} in '{}'",
                        ty.name
                    )))
                }
            },
            ScalarKind::Float { width: 4 } => Type::f32(),
            ScalarKind::Float { .. } => Type::f64(),
            ScalarKind::Char { signed: true } => Type::i8(),
            ScalarKind::Char { signed: false } => Type::u8(),
            ScalarKind::Bool => Type::u8(),
        }),
        TypeKind::Pointer { .. } | TypeKind::Function { .. } => Ok(Type::pointer()),
        TypeKind::Void => Ok(Type::void()),
        TypeKind::Composite { fields, .. } => {
            let elems = fields
                .iter()
                .map(|f| ffi_type_of(&f.ty))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Type::structure(elems))
        }
        TypeKind::Array { elem, len: Some(n) } => {
            // Arrays pass by value as homogeneous structures.
            let e = ffi_type_of(elem)?;
            Ok(Type::structure(std::iter::repeat(e).take(*n)))
        }
        TypeKind::Array { len: None, .. } => Err(FfiError::Unsupported(format!(
            "unsized array '{}' in a call signature",
            ty.name
        ))),
    }
}

pub(crate) fn make_cif(params: &[Rc<TypeDesc>], ret: &Rc<TypeDesc>) -> Result<Cif, FfiError> {
    let args = params
        .iter()
        .map(ffi_type_of)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Cif::new(args, ffi_type_of(ret)?))
}

/// A callable native entry point with a declared signature.
#[derive(Clone)]
pub struct ForeignFunction {
    name: String,
    code: usize,
    ty: Rc<TypeDesc>,
    cif: Cif,
    heap: Heap,
}

impl ForeignFunction {
    /// Bind `code` as a function of type `ty`.
    ///
    /// # Safety
    ///
    /// `code` must be a valid function entry point whose true ABI matches
    /// `ty` exactly; a mismatch is undefined behavior at call time.
    pub unsafe fn new(
        code: *const (),
        name: &str,
        ty: &Rc<TypeDesc>,
        heap: &Heap,
    ) -> Result<ForeignFunction, FfiError> {
        let TypeKind::Function { params, ret } = &ty.kind else {
            return Err(FfiError::type_err(format!(
                "'{}' is not a function type",
                ty.name
            )));
        };
        Ok(ForeignFunction {
            name: name.to_string(),
            code: code as usize,
            ty: ty.clone(),
            cif: make_cif(params, ret)?,
            heap: heap.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Rc<TypeDesc> {
        &self.ty
    }

    /// Call with host arguments. Arity is checked first; each argument is
    /// then staged against its declared parameter type, so conversion
    /// failures surface before any native code runs.
    pub fn call(&self, args: &[Value]) -> Result<Value, FfiError> {
        let TypeKind::Function { params, ret } = &self.ty.kind else {
            return Err(FfiError::type_err(format!(
                "'{}' is not a function type",
                self.ty.name
            )));
        };
        if args.len() != params.len() {
            return Err(FfiError::arity(params.len(), args.len()));
        }
        let mut staged: Vec<Staged> = Vec::with_capacity(args.len());
        for (param, arg) in params.iter().zip(args) {
            staged.push(stage(&self.heap, param, arg)?);
        }
        let mut arg_ptrs: Vec<*mut c_void> = staged
            .iter_mut()
            .map(|s| s.bytes.as_mut_ptr() as *mut c_void)
            .collect();
        // Integral returns come back widened to a full ffi_arg.
        let ret_len = ret.size.max(std::mem::size_of::<ffi_arg>());
        let mut ret_buf = vec![0u8; ret_len];
        let entry = CodePtr(self.code as *mut c_void);
        unsafe {
            raw::ffi_call(
                self.cif.as_raw_ptr(),
                Some(*entry.as_safe_fun()),
                ret_buf.as_mut_ptr() as *mut c_void,
                arg_ptrs.as_mut_ptr(),
            );
        }
        decode_return(&self.heap, ret, &ret_buf)
    }
}

impl std::fmt::Debug for ForeignFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForeignFunction({}: {})", self.name, self.ty.name)
    }
}

/// Marshal a raw return buffer back to a host value under `ret`.
fn decode_return(heap: &Heap, ret: &Rc<TypeDesc>, buf: &[u8]) -> Result<Value, FfiError> {
    match &ret.kind {
        TypeKind::Void => Ok(Value::Null),
        TypeKind::Scalar(kind) => Ok(read_scalar(kind, buf)),
        TypeKind::Pointer { pointee } => {
            let mut addr_bytes = [0u8; std::mem::size_of::<usize>()];
            addr_bytes.copy_from_slice(&buf[..std::mem::size_of::<usize>()]);
            let addr = usize::from_le_bytes(addr_bytes);
            if addr == 0 {
                return Ok(Value::Null);
            }
            match heap.find_alloc(addr) {
                Some((alloc, offset)) => {
                    let ty = if offset == 0 {
                        heap.tag(alloc)
                    } else {
                        pointee.clone()
                    };
                    Ok(Value::Proxy(ValueProxy::attach(
                        heap,
                        alloc,
                        offset,
                        &ty,
                        Ownership::Borrowing,
                    )))
                }
                // Addresses the engine never allocated are not aliasable.
                None => Ok(Value::Null),
            }
        }
        TypeKind::Composite { .. } | TypeKind::Array { len: Some(_), .. } => {
            let alloc = heap.allocate(ret, ret.size);
            heap.commit(
                alloc,
                0,
                &Staged {
                    bytes: buf[..ret.size].to_vec(),
                    refs: Vec::new(),
                },
            );
            Ok(Value::Proxy(ValueProxy::attach(
                heap,
                alloc,
                0,
                ret,
                Ownership::Owning,
            )))
        }
        TypeKind::Function { .. } | TypeKind::Array { len: None, .. } => Err(
            FfiError::Unsupported(format!("return type '{}'", ret.name)),
        ),
    }
}
