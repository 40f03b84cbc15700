//! veneer-runtime: metadata-driven proxies over native memory
//!
//! The engine lets a host program manipulate native in-memory values
//! through typed proxies instead of serialized copies. Type descriptors
//! carry the layout metadata; a managed heap owns the storage and collects
//! reference cycles through a pointer side table; the coercion engine
//! converts host values to native bytes with staged, all-or-nothing
//! writes; and libffi bridges both call directions, foreign functions in
//! and host closures out.
//!
//! ```no_run
//! use veneer_runtime::{Heap, TypeRegistry, TypeDesc, Value, ValueProxy};
//!
//! # fn main() -> Result<(), veneer_runtime::FfiError> {
//! let heap = Heap::new();
//! let registry = TypeRegistry::new();
//! let int32 = registry.lookup("int32")?;
//! let point = TypeDesc::layout("point", None, &[("x", &int32), ("y", &int32)])?;
//!
//! let p = ValueProxy::from_value(&heap, &point, &Value::Seq(vec![
//!     Value::Int(3),
//!     Value::Int(4),
//! ]))?;
//! assert_eq!(p.at("x")?, Value::Int(3));
//! p.set_field("y", &Value::Int(7))?;
//! # Ok(())
//! # }
//! ```

mod call;
mod closure;
mod coerce;
mod error;
mod heap;
mod library;
mod proxy;
mod registry;
mod types;
mod value;

pub use call::ForeignFunction;
pub use closure::closure;
pub use error::FfiError;
pub use heap::{AllocId, Heap};
pub use library::{Export, GlobalSymbol, LibraryHandle, LibraryResolver};
pub use proxy::{describe, ArrayIter, Ownership, ValueProxy};
pub use registry::TypeRegistry;
pub use types::{FieldDesc, ScalarKind, TypeDesc, TypeKind};
pub use value::{map_of, Value};

/// Crate version, for embedders that report it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
