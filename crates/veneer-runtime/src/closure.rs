//! Host callables as native function pointers
//!
//! [`closure`] wraps a host callable in a libffi closure, producing a real
//! native entry point that foreign code can store and call later. The
//! trampoline owns a strong handle to the callable, and the trampoline is
//! owned by a heap allocation whose address is the entry point itself, so
//! the callable lives exactly as long as the entry point is reachable
//! (from host proxies or from pointer fields in native-visible storage).
//! Storing the closure proxy into a function-pointer field records a
//! pointer-table edge like any other pointer store.
//!
//! A callable that returns an error or panics inside the trampoline has no
//! way to report failure to its native caller; the process aborts.

use crate::call::make_cif;
use crate::coerce::{read_scalar, stage, write_scalar};
use crate::error::FfiError;
use crate::heap::{Heap, Staged};
use crate::proxy::{Ownership, ValueProxy};
use crate::types::{ScalarKind, TypeDesc, TypeKind};
use crate::value::Value;
use libffi::low::{ffi_arg, ffi_cif};
use libffi::middle::Closure;
use std::os::raw::c_void;
use std::rc::Rc;

type Callable = Rc<dyn Fn(&[Value]) -> Result<Value, FfiError>>;

struct TrampState {
    callable: Callable,
    params: Vec<Rc<TypeDesc>>,
    ret: Rc<TypeDesc>,
    heap: Heap,
}

/// A live libffi closure plus its boxed state, owned by a heap allocation.
pub(crate) struct ClosureTrampoline {
    closure: Option<Closure<'static>>,
    state: *mut TrampState,
    code: usize,
}

impl ClosureTrampoline {
    pub(crate) fn code(&self) -> usize {
        self.code
    }

    pub(crate) fn callable(&self) -> Callable {
        // The state outlives every handout: it is freed only in Drop.
        unsafe { (*self.state).callable.clone() }
    }
}

impl Drop for ClosureTrampoline {
    fn drop(&mut self) {
        // The closure references the state; tear it down first.
        self.closure.take();
        drop(unsafe { Box::from_raw(self.state) });
    }
}

/// Wrap `callable` as a native function of type `fn_ty`. The result is an
/// owning proxy whose native address is the generated entry point; coerce
/// it into any matching function-pointer slot to hand it to foreign code.
pub fn closure<F>(
    heap: &Heap,
    fn_ty: &Rc<TypeDesc>,
    callable: F,
) -> Result<ValueProxy, FfiError>
where
    F: Fn(&[Value]) -> Result<Value, FfiError> + 'static,
{
    let TypeKind::Function { params, ret } = &fn_ty.kind else {
        return Err(FfiError::type_err(format!(
            "'{}' is not a function type",
            fn_ty.name
        )));
    };
    let cif = make_cif(params, ret)?;
    let state = Box::into_raw(Box::new(TrampState {
        callable: Rc::new(callable),
        params: params.clone(),
        ret: ret.clone(),
        heap: heap.clone(),
    }));
    // The state lives until the trampoline's Drop, which outlives the
    // closure; the 'static borrow never dangles while callable.
    let closure = Closure::new(cif, trampoline_entry, unsafe { &*state });
    let code = *closure.code_ptr() as usize;
    let trampoline = ClosureTrampoline {
        closure: Some(closure),
        state,
        code,
    };
    let alloc = heap.allocate_closure(fn_ty, trampoline);
    Ok(ValueProxy::attach(heap, alloc, 0, fn_ty, Ownership::Owning))
}

unsafe extern "C" fn trampoline_entry(
    _cif: &ffi_cif,
    result: &mut c_void,
    args: *const *const c_void,
    state: &TrampState,
) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut host_args = Vec::with_capacity(state.params.len());
        for (i, param) in state.params.iter().enumerate() {
            host_args.push(decode_native(&state.heap, param, *args.add(i)));
        }
        let value = (state.callable)(&host_args)?;
        write_native_return(&state.heap, &state.ret, &value, result as *mut c_void as *mut u8)
    }));
    match outcome {
        Ok(Ok(())) => {}
        // No error channel back to the native caller.
        Ok(Err(_)) | Err(_) => std::process::abort(),
    }
}

/// Marshal one native argument slot to a host value.
unsafe fn decode_native(heap: &Heap, ty: &Rc<TypeDesc>, slot: *const c_void) -> Value {
    match &ty.kind {
        TypeKind::Scalar(kind) => {
            let bytes = std::slice::from_raw_parts(slot as *const u8, ty.size);
            read_scalar(kind, bytes)
        }
        TypeKind::Pointer { pointee } => {
            let addr = *(slot as *const usize);
            if addr == 0 {
                return Value::Null;
            }
            match heap.find_alloc(addr) {
                Some((alloc, offset)) => {
                    let view = if offset == 0 {
                        heap.tag(alloc)
                    } else {
                        pointee.clone()
                    };
                    Value::Proxy(ValueProxy::attach(
                        heap,
                        alloc,
                        offset,
                        &view,
                        Ownership::Borrowing,
                    ))
                }
                None => Value::Null,
            }
        }
        TypeKind::Composite { .. } | TypeKind::Array { len: Some(_), .. } => {
            // By-value aggregates are copied into fresh engine storage.
            let bytes = std::slice::from_raw_parts(slot as *const u8, ty.size);
            let alloc = heap.allocate(ty, ty.size);
            heap.commit(
                alloc,
                0,
                &Staged {
                    bytes: bytes.to_vec(),
                    refs: Vec::new(),
                },
            );
            Value::Proxy(ValueProxy::attach(heap, alloc, 0, ty, Ownership::Owning))
        }
        _ => Value::Null,
    }
}

/// Write a host result into the native return slot, widening integral
/// values to a full `ffi_arg` as the closure ABI requires.
fn write_native_return(
    heap: &Heap,
    ret: &Rc<TypeDesc>,
    value: &Value,
    out: *mut u8,
) -> Result<(), FfiError> {
    match &ret.kind {
        TypeKind::Void => Ok(()),
        TypeKind::Scalar(kind) => {
            let mut narrow = [0u8; 8];
            write_scalar(kind, value, &mut narrow[..ret.size])?;
            match kind {
                ScalarKind::Float { width } => unsafe {
                    std::ptr::copy_nonoverlapping(narrow.as_ptr(), out, *width);
                },
                _ => {
                    // Sign- or zero-extend to the full return slot.
                    let wide: ffi_arg = match read_scalar(kind, &narrow) {
                        Value::Int(i) => i as ffi_arg,
                        Value::Uint(u) => u as ffi_arg,
                        Value::Bool(b) => b as ffi_arg,
                        Value::Bytes(b) => b[0] as ffi_arg,
                        _ => 0,
                    };
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            wide.to_ne_bytes().as_ptr(),
                            out,
                            std::mem::size_of::<ffi_arg>(),
                        );
                    }
                }
            }
            Ok(())
        }
        TypeKind::Pointer { .. } => {
            let staged = stage(heap, ret, value)?;
            unsafe {
                std::ptr::copy_nonoverlapping(staged.bytes.as_ptr(), out, staged.bytes.len());
            }
            Ok(())
        }
        TypeKind::Composite { .. } | TypeKind::Array { len: Some(_), .. } => {
            let staged = stage(heap, ret, value)?;
            unsafe {
                std::ptr::copy_nonoverlapping(staged.bytes.as_ptr(), out, staged.bytes.len());
            }
            Ok(())
        }
        _ => Err(FfiError::Unsupported(format!(
            "closure return type '{}'",
            ret.name
        ))),
    }
}
