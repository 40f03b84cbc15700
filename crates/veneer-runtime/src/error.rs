//! Error taxonomy for the proxy engine
//!
//! Three failure classes surface to callers synchronously at the violating
//! operation: unknown names (`Lookup`), shape/kind/arity mismatches during
//! coercion (`Type`, always rejected with no partial effect) and
//! out-of-bounds array access (`Index`, local to the single access).
//! Library-resolution failures have their own variants so a caller can fall
//! back to another resolver on `LibraryNotFound`.

use thiserror::Error;

/// Errors produced by descriptor lookup, coercion, proxy access and the
/// library-resolution boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FfiError {
    /// Unknown type, field or symbol name
    #[error("unknown name: {0}")]
    Lookup(String),
    /// Coercion shape, kind or arity mismatch
    #[error("type error: {0}")]
    Type(String),
    /// Out-of-bounds array access
    #[error("index {index} out of range for length {len}")]
    Index { index: i64, len: usize },
    /// No matching native object at any configured search location
    #[error("library not found: {0}")]
    LibraryNotFound(String),
    /// Symbol missing from a loaded library
    #[error("symbol '{symbol}' not found in library '{library}'")]
    SymbolNotFound { library: String, symbol: String },
    /// Foreign construct the engine does not model (unions, bit-fields,
    /// variadic functions, unsized arrays in value position)
    #[error("unsupported foreign construct: {0}")]
    Unsupported(String),
}

impl FfiError {
    pub(crate) fn type_err(msg: impl Into<String>) -> Self {
        FfiError::Type(msg.into())
    }

    /// Arity mismatches are a species of type error (shape of the argument
    /// list does not match the declared parameter list).
    pub(crate) fn arity(expected: usize, got: usize) -> Self {
        FfiError::Type(format!(
            "expected {} argument{}, got {}",
            expected,
            if expected == 1 { "" } else { "s" },
            got
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = FfiError::Lookup("print_hw".into());
        assert_eq!(e.to_string(), "unknown name: print_hw");

        let e = FfiError::Index { index: 42, len: 3 };
        assert_eq!(e.to_string(), "index 42 out of range for length 3");
    }

    #[test]
    fn test_arity_is_a_type_error() {
        let e = FfiError::arity(2, 3);
        assert!(matches!(e, FfiError::Type(_)));
        assert_eq!(e.to_string(), "type error: expected 2 arguments, got 3");
    }

    #[test]
    fn test_symbol_not_found_display() {
        let e = FfiError::SymbolNotFound {
            library: "libm.so".into(),
            symbol: "cbrt".into(),
        };
        assert_eq!(e.to_string(), "symbol 'cbrt' not found in library 'libm.so'");
    }
}
