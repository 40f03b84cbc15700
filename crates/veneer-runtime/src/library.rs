//! Shared-object resolution and exports
//!
//! Resolution is a thin boundary over `libloading`: a resolver holds an
//! ordered, user-editable list of search locations, where the empty string
//! means "the platform loader's own rules". Each location is tried in
//! order with the platform library extension; a location that fails to
//! load is skipped, and only after every location misses does resolution
//! fail, non-fatally, with `LibraryNotFound`.
//!
//! A loaded library exposes its contents through a declared export table:
//! types, functions and data symbols are declared with their descriptors
//! and looked up by name. Global data is accessed by value copy through
//! [`GlobalSymbol`], never as a live alias.

use crate::call::ForeignFunction;
use crate::coerce::{read_scalar, stage};
use crate::error::FfiError;
use crate::heap::{Heap, Staged};
use crate::proxy::{Ownership, ValueProxy};
use crate::types::{TypeDesc, TypeKind};
use crate::value::Value;
use libloading::Library;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

#[cfg(target_os = "windows")]
const LIB_EXTENSION: &str = ".dll";
#[cfg(target_os = "macos")]
const LIB_EXTENSION: &str = ".dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIB_EXTENSION: &str = ".so";

/// Ordered search locations for native libraries.
#[derive(Debug, Clone)]
pub struct LibraryResolver {
    pub search_paths: Vec<String>,
}

impl Default for LibraryResolver {
    fn default() -> Self {
        // The loader's default rules come first.
        LibraryResolver {
            search_paths: vec![String::new()],
        }
    }
}

impl LibraryResolver {
    pub fn new() -> Self {
        LibraryResolver::default()
    }

    /// Append a directory to try after the existing locations.
    pub fn push_path(&mut self, path: impl Into<String>) {
        self.search_paths.push(path.into());
    }

    /// Candidate file names for `name`, one per search location, in order.
    fn candidates(&self, name: &str) -> Vec<String> {
        let file = format!("{name}{LIB_EXTENSION}");
        self.search_paths
            .iter()
            .map(|loc| {
                if loc.is_empty() {
                    file.clone()
                } else {
                    Path::new(loc).join(&file).to_string_lossy().into_owned()
                }
            })
            .collect()
    }

    /// Load the first candidate that the platform loader accepts.
    pub fn resolve(&self, name: &str, heap: &Heap) -> Result<LibraryHandle, FfiError> {
        for candidate in self.candidates(name) {
            // A location miss or load failure just moves on to the next.
            if let Ok(library) = unsafe { Library::new(&candidate) } {
                return Ok(LibraryHandle {
                    name: name.to_string(),
                    path: candidate,
                    library,
                    heap: heap.clone(),
                    exports: RefCell::new(HashMap::new()),
                });
            }
        }
        Err(FfiError::LibraryNotFound(name.to_string()))
    }
}

/// One declared export of a loaded library.
#[derive(Debug, Clone)]
pub enum Export {
    Type(Rc<TypeDesc>),
    Function(ForeignFunction),
    Data(GlobalSymbol),
}

/// A loaded native library with its declared export table.
pub struct LibraryHandle {
    name: String,
    path: String,
    library: Library,
    heap: Heap,
    exports: RefCell<HashMap<String, Export>>,
}

impl LibraryHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The file name that actually loaded.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Record a type this library defines.
    pub fn declare_type(&self, ty: Rc<TypeDesc>) -> Rc<TypeDesc> {
        self.exports
            .borrow_mut()
            .insert(ty.name.clone(), Export::Type(ty.clone()));
        ty
    }

    /// Bind an exported function symbol with its signature.
    ///
    /// # Safety
    ///
    /// `fn_ty` must match the symbol's true ABI; a mismatch is undefined
    /// behavior when the function is called.
    pub unsafe fn declare_function(
        &self,
        symbol: &str,
        fn_ty: &Rc<TypeDesc>,
    ) -> Result<ForeignFunction, FfiError> {
        let sym: libloading::Symbol<unsafe extern "C" fn()> = self
            .library
            .get(symbol.as_bytes())
            .map_err(|_| self.missing(symbol))?;
        let func = ForeignFunction::new(*sym as *const (), symbol, fn_ty, &self.heap)?;
        self.exports
            .borrow_mut()
            .insert(symbol.to_string(), Export::Function(func.clone()));
        Ok(func)
    }

    /// Bind an exported data symbol with its type.
    ///
    /// # Safety
    ///
    /// `ty` must describe the symbol's true layout.
    pub unsafe fn declare_data(
        &self,
        symbol: &str,
        ty: &Rc<TypeDesc>,
    ) -> Result<GlobalSymbol, FfiError> {
        let sym: libloading::Symbol<*mut u8> = self
            .library
            .get(symbol.as_bytes())
            .map_err(|_| self.missing(symbol))?;
        let global = GlobalSymbol::new(*sym, symbol, ty, &self.heap);
        self.exports
            .borrow_mut()
            .insert(symbol.to_string(), Export::Data(global.clone()));
        Ok(global)
    }

    /// Look up a previously declared export.
    pub fn export(&self, name: &str) -> Result<Export, FfiError> {
        self.exports
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| FfiError::Lookup(format!("{}:{}", self.name, name)))
    }

    fn missing(&self, symbol: &str) -> FfiError {
        FfiError::SymbolNotFound {
            library: self.name.clone(),
            symbol: symbol.to_string(),
        }
    }
}

impl std::fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LibraryHandle({} from {})", self.name, self.path)
    }
}

/// A typed global data symbol, accessed by value copy.
#[derive(Debug, Clone)]
pub struct GlobalSymbol {
    name: String,
    addr: usize,
    ty: Rc<TypeDesc>,
    heap: Heap,
}

impl GlobalSymbol {
    /// Bind raw storage as a typed global.
    ///
    /// # Safety
    ///
    /// `addr` must point to storage of (at least) `ty.size` bytes that
    /// stays valid and uniquely accessible for the symbol's lifetime.
    pub unsafe fn new(addr: *mut u8, name: &str, ty: &Rc<TypeDesc>, heap: &Heap) -> GlobalSymbol {
        GlobalSymbol {
            name: name.to_string(),
            addr: addr as usize,
            ty: ty.clone(),
            heap: heap.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol_type(&self) -> &Rc<TypeDesc> {
        &self.ty
    }

    /// Read the current value. Scalars come back as host scalars; pointers
    /// resolve against the engine's allocations; aggregates are copied
    /// into fresh engine storage, never aliased in place.
    pub fn get(&self) -> Result<Value, FfiError> {
        let bytes = unsafe {
            std::slice::from_raw_parts(self.addr as *const u8, self.ty.size)
        };
        match &self.ty.kind {
            TypeKind::Scalar(kind) => Ok(read_scalar(kind, bytes)),
            TypeKind::Pointer { pointee } => {
                let mut buf = [0u8; std::mem::size_of::<usize>()];
                buf.copy_from_slice(bytes);
                let addr = usize::from_le_bytes(buf);
                if addr == 0 {
                    return Ok(Value::Null);
                }
                match self.heap.find_alloc(addr) {
                    Some((alloc, offset)) => {
                        let view = if offset == 0 {
                            self.heap.tag(alloc)
                        } else {
                            pointee.clone()
                        };
                        Ok(Value::Proxy(ValueProxy::attach(
                            &self.heap,
                            alloc,
                            offset,
                            &view,
                            Ownership::Borrowing,
                        )))
                    }
                    None => Ok(Value::Null),
                }
            }
            TypeKind::Composite { .. } | TypeKind::Array { len: Some(_), .. } => {
                let alloc = self.heap.allocate(&self.ty, self.ty.size);
                self.heap.commit(
                    alloc,
                    0,
                    &Staged {
                        bytes: bytes.to_vec(),
                        refs: Vec::new(),
                    },
                );
                Ok(Value::Proxy(ValueProxy::attach(
                    &self.heap,
                    alloc,
                    0,
                    &self.ty,
                    Ownership::Owning,
                )))
            }
            _ => Err(FfiError::Unsupported(format!(
                "global of type '{}'",
                self.ty.name
            ))),
        }
    }

    /// Overwrite the symbol's storage by coercing `value`. Staging runs to
    /// completion before any byte is written.
    pub fn set(&self, value: &Value) -> Result<(), FfiError> {
        let staged = stage(&self.heap, &self.ty, value)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                staged.bytes.as_ptr(),
                self.addr as *mut u8,
                staged.bytes.len(),
            );
        }
        Ok(())
    }
}
