//! Host-to-native coercion
//!
//! Conversion is staged: the host value is rendered into a scratch
//! [`Staged`] buffer (bytes plus pointer-table entries), and only a fully
//! successful staging is committed to real storage. A failure anywhere in a
//! nested conversion therefore leaves the destination untouched.
//!
//! Source forms are tried in a fixed priority order: an existing proxy
//! (pointer store by identity, or byte-level value copy), a positional
//! sequence against fields or elements in declaration order, a name-keyed
//! mapping against the flattened field view, strings and byte strings
//! against character arrays and scalars, and null as all-zeroes.
//!
//! Multi-byte scalars are encoded little-endian, matching the targets the
//! engine runs on.

use crate::error::FfiError;
use crate::heap::{Heap, Staged};
use crate::proxy::ValueProxy;
use crate::types::{ScalarKind, TypeDesc, TypeKind};
use crate::value::Value;
use std::rc::Rc;

/// Stage `value` as an instance of `target`. The result is committed by the
/// caller; nothing is written here.
pub(crate) fn stage(
    heap: &Heap,
    target: &Rc<TypeDesc>,
    value: &Value,
) -> Result<Staged, FfiError> {
    let mut out = Staged::zeroed(target.size);
    stage_at(heap, target, value, &mut out, 0)?;
    Ok(out)
}

fn stage_at(
    heap: &Heap,
    target: &Rc<TypeDesc>,
    value: &Value,
    out: &mut Staged,
    at: usize,
) -> Result<(), FfiError> {
    // Highest priority: sources already bound to native memory.
    if let Value::Proxy(p) = value {
        return stage_proxy(heap, target, p, out, at);
    }
    // Null zeroes any target; the buffer already is.
    if matches!(value, Value::Null) {
        return Ok(());
    }
    match &target.kind {
        TypeKind::Scalar(kind) => {
            write_scalar(kind, value, &mut out.bytes[at..at + target.size])
                .map_err(|e| annotate(e, target))
        }
        TypeKind::Composite { fields, .. } => match value {
            Value::Seq(items) => {
                if items.len() > fields.len() {
                    return Err(FfiError::type_err(format!(
                        "too many values for '{}': {} fields, {} given",
                        target.name,
                        fields.len(),
                        items.len()
                    )));
                }
                // Positional, declaration order; a base member consumes one
                // (possibly nested) item. Unfilled fields stay zero.
                for (field, item) in fields.iter().zip(items) {
                    stage_at(heap, &field.ty, item, out, at + field.offset)?;
                }
                Ok(())
            }
            Value::Map(entries) => {
                for (key, item) in entries {
                    // Flattened view: own fields first, then the base
                    // chain. Unknown keys are ignored.
                    if let Some((offset, ty)) = target.field(key) {
                        stage_at(heap, &ty, item, out, at + offset)?;
                    }
                }
                Ok(())
            }
            _ => Err(mismatch(target, value)),
        },
        TypeKind::Array { elem, len } => {
            let Some(len) = len else {
                return Err(FfiError::Unsupported(format!(
                    "unsized array '{}' in value position",
                    target.name
                )));
            };
            match value {
                Value::Seq(items) => {
                    if items.len() > *len {
                        return Err(FfiError::type_err(format!(
                            "too many elements for '{}': {} given",
                            target.name,
                            items.len()
                        )));
                    }
                    for (i, item) in items.iter().enumerate() {
                        stage_at(heap, elem, item, out, at + i * elem.size)?;
                    }
                    Ok(())
                }
                Value::Str(s) if is_char(elem) => {
                    stage_char_array(s.as_bytes(), target, *len, out, at)
                }
                Value::Bytes(b) if is_char(elem) => {
                    stage_char_array(b, target, *len, out, at)
                }
                _ => Err(mismatch(target, value)),
            }
        }
        TypeKind::Pointer { .. } => Err(mismatch(target, value)),
        TypeKind::Function { .. } | TypeKind::Void => Err(FfiError::Unsupported(format!(
            "'{}' has no value representation",
            target.name
        ))),
    }
}

fn stage_char_array(
    src: &[u8],
    target: &Rc<TypeDesc>,
    len: usize,
    out: &mut Staged,
    at: usize,
) -> Result<(), FfiError> {
    if src.len() > len {
        return Err(FfiError::type_err(format!(
            "string of {} bytes does not fit '{}'",
            src.len(),
            target.name
        )));
    }
    out.bytes[at..at + src.len()].copy_from_slice(src);
    Ok(())
}

fn stage_proxy(
    heap: &Heap,
    target: &Rc<TypeDesc>,
    source: &ValueProxy,
    out: &mut Staged,
    at: usize,
) -> Result<(), FfiError> {
    let src_ty = source.static_type();
    if let TypeKind::Function { .. } = &target.kind {
        // A function argument slot takes the entry address.
        if !Rc::ptr_eq(src_ty, target) {
            return Err(FfiError::type_err(format!(
                "cannot pass '{}' where '{}' is expected",
                src_ty.name, target.name
            )));
        }
        let addr = source.native_addr();
        out.bytes[at..at + target.size].copy_from_slice(&addr.to_le_bytes());
        out.refs.push((at, source.alloc_id()));
        return Ok(());
    }
    if let TypeKind::Pointer { pointee } = &target.kind {
        // Pointer store by identity: the pointee type must be the source's
        // type, a base of it, or untyped.
        let ok = Rc::ptr_eq(pointee, src_ty)
            || src_ty.derives_from(pointee)
            || matches!(pointee.kind, TypeKind::Void);
        if !ok {
            return Err(FfiError::type_err(format!(
                "cannot point '{}' at a '{}'",
                target.name, src_ty.name
            )));
        }
        let addr = source.native_addr();
        out.bytes[at..at + target.size].copy_from_slice(&addr.to_le_bytes());
        out.refs.push((at, source.alloc_id()));
        return Ok(());
    }
    // Value copy: layout-compatible source, bytes and pointer-table entries
    // carried together.
    if Rc::ptr_eq(src_ty, target) || src_ty.derives_from(target) {
        let snap = source.snapshot(target.size);
        out.bytes[at..at + target.size].copy_from_slice(&snap.bytes);
        for (rel, id) in snap.refs {
            out.refs.push((at + rel, id));
        }
        return Ok(());
    }
    // A scalar proxy decays to its host value.
    if src_ty.is_scalar() {
        let v = source.get()?;
        return stage_at(heap, target, &v, out, at);
    }
    Err(FfiError::type_err(format!(
        "cannot convert '{}' proxy to '{}'",
        src_ty.name, target.name
    )))
}

fn is_char(ty: &Rc<TypeDesc>) -> bool {
    matches!(ty.kind, TypeKind::Scalar(ScalarKind::Char { .. }))
}

fn mismatch(target: &Rc<TypeDesc>, value: &Value) -> FfiError {
    FfiError::type_err(format!(
        "cannot convert {} to '{}'",
        value.type_name(),
        target.name
    ))
}

fn annotate(e: FfiError, target: &Rc<TypeDesc>) -> FfiError {
    match e {
        FfiError::Type(msg) => FfiError::Type(format!("{msg} (target '{}')", target.name)),
        other => other,
    }
}

/// Encode one host value into a scalar slot. Integer sources are
/// range-checked against the destination width; silent truncation is never
/// performed.
pub(crate) fn write_scalar(
    kind: &ScalarKind,
    value: &Value,
    out: &mut [u8],
) -> Result<(), FfiError> {
    match kind {
        ScalarKind::Int { signed, width } => {
            let (lo, hi): (i128, i128) = if *signed {
                let half = 1i128 << (width * 8 - 1);
                (-half, half - 1)
            } else {
                (0, (1i128 << (width * 8)) - 1)
            };
            let v: i128 = match value {
                Value::Int(i) => *i as i128,
                Value::Uint(u) => *u as i128,
                Value::Bool(b) => *b as i128,
                _ => return Err(FfiError::type_err(format!(
                    "expected integer, got {}",
                    value.type_name()
                ))),
            };
            if v < lo || v > hi {
                return Err(FfiError::type_err(format!(
                    "value {v} out of range [{lo}, {hi}]"
                )));
            }
            out.copy_from_slice(&v.to_le_bytes()[..*width]);
            Ok(())
        }
        ScalarKind::Float { width } => {
            let v = match value {
                Value::Float(x) => *x,
                Value::Int(i) => *i as f64,
                Value::Uint(u) => *u as f64,
                Value::Bool(b) => *b as u8 as f64,
                _ => return Err(FfiError::type_err(format!(
                    "expected number, got {}",
                    value.type_name()
                ))),
            };
            if *width == 4 {
                out.copy_from_slice(&(v as f32).to_le_bytes());
            } else {
                out.copy_from_slice(&v.to_le_bytes());
            }
            Ok(())
        }
        ScalarKind::Char { signed } => {
            let b: u8 = match value {
                Value::Str(s) => {
                    let mut chars = s.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) if (c as u32) < 256 => c as u32 as u8,
                        _ => return Err(FfiError::type_err(format!(
                            "expected a single one-byte character, got {s:?}"
                        ))),
                    }
                }
                Value::Bytes(bytes) if bytes.len() == 1 => bytes[0],
                Value::Int(i) => {
                    let (lo, hi) = if *signed { (-128i64, 127) } else { (0, 255) };
                    if *i < lo || *i > hi {
                        return Err(FfiError::type_err(format!(
                            "value {i} out of range for char"
                        )));
                    }
                    *i as u8
                }
                _ => return Err(FfiError::type_err(format!(
                    "expected char, got {}",
                    value.type_name()
                ))),
            };
            out[0] = b;
            Ok(())
        }
        ScalarKind::Bool => {
            let b = match value {
                Value::Bool(b) => *b,
                Value::Int(i) => *i != 0,
                Value::Uint(u) => *u != 0,
                _ => return Err(FfiError::type_err(format!(
                    "expected bool, got {}",
                    value.type_name()
                ))),
            };
            out[0] = b as u8;
            Ok(())
        }
    }
}

/// Decode one scalar slot to a host value. Chars surface as one-byte byte
/// strings; an unsigned 64-bit value above `i64::MAX` surfaces as `Uint`.
pub(crate) fn read_scalar(kind: &ScalarKind, bytes: &[u8]) -> Value {
    match kind {
        ScalarKind::Int { signed, width } => {
            let mut buf = [0u8; 8];
            buf[..*width].copy_from_slice(&bytes[..*width]);
            if *signed {
                let mut v = u64::from_le_bytes(buf) as i64;
                let shift = 64 - width * 8;
                if shift > 0 {
                    v = (v << shift) >> shift;
                }
                Value::Int(v)
            } else {
                let v = u64::from_le_bytes(buf);
                if v > i64::MAX as u64 {
                    Value::Uint(v)
                } else {
                    Value::Int(v as i64)
                }
            }
        }
        ScalarKind::Float { width } => {
            if *width == 4 {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes[..4]);
                Value::Float(f32::from_le_bytes(buf) as f64)
            } else {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                Value::Float(f64::from_le_bytes(buf))
            }
        }
        ScalarKind::Char { .. } => Value::Bytes(vec![bytes[0]]),
        ScalarKind::Bool => Value::Bool(bytes[0] != 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TypeRegistry;
    use crate::value::map_of;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn fixture() -> (Heap, TypeRegistry) {
        (Heap::new(), TypeRegistry::new())
    }

    #[rstest]
    #[case("int8", Value::Int(127), vec![127])]
    #[case("int8", Value::Int(-1), vec![0xff])]
    #[case("int32", Value::Int(0x0403_0201), vec![1, 2, 3, 4])]
    #[case("uint16", Value::Int(0xffff), vec![0xff, 0xff])]
    #[case("bool", Value::Bool(true), vec![1])]
    #[case("bool", Value::Int(7), vec![1])]
    #[case("char", Value::Str("A".into()), vec![65])]
    #[case("char", Value::Bytes(vec![0]), vec![0])]
    fn test_scalar_staging(
        #[case] ty: &str,
        #[case] value: Value,
        #[case] expected: Vec<u8>,
    ) {
        let (heap, reg) = fixture();
        let ty = reg.lookup(ty).unwrap();
        let staged = stage(&heap, &ty, &value).unwrap();
        assert_eq!(staged.bytes, expected);
    }

    #[rstest]
    #[case("int8", Value::Int(128))]
    #[case("int8", Value::Int(-129))]
    #[case("uint8", Value::Int(-1))]
    #[case("uint32", Value::Int(1 << 33))]
    #[case("int32", Value::Float(1.5))]
    #[case("char", Value::Str("ab".into()))]
    #[case("char", Value::Str("\u{0100}".into()))]
    fn test_scalar_rejections(#[case] ty: &str, #[case] value: Value) {
        let (heap, reg) = fixture();
        let ty = reg.lookup(ty).unwrap();
        assert!(matches!(stage(&heap, &ty, &value), Err(FfiError::Type(_))));
    }

    #[test]
    fn test_float_accepts_integers() {
        let (heap, reg) = fixture();
        let f64t = reg.lookup("float64").unwrap();
        let staged = stage(&heap, &f64t, &Value::Int(3)).unwrap();
        assert_eq!(staged.bytes, 3.0f64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_scalar_roundtrip_sign_extension() {
        let kind = ScalarKind::Int {
            signed: true,
            width: 2,
        };
        let mut buf = [0u8; 2];
        write_scalar(&kind, &Value::Int(-2), &mut buf).unwrap();
        assert_eq!(read_scalar(&kind, &buf), Value::Int(-2));
    }

    #[test]
    fn test_uint64_reads_above_i64_max_as_uint() {
        let kind = ScalarKind::Int {
            signed: false,
            width: 8,
        };
        let bytes = u64::MAX.to_le_bytes();
        assert_eq!(read_scalar(&kind, &bytes), Value::Uint(u64::MAX));
        let bytes = 5u64.to_le_bytes();
        assert_eq!(read_scalar(&kind, &bytes), Value::Int(5));
    }

    fn point(reg: &TypeRegistry) -> Rc<TypeDesc> {
        let i32t = reg.lookup("int32").unwrap();
        TypeDesc::layout("point", None, &[("x", &i32t), ("y", &i32t)]).unwrap()
    }

    #[test]
    fn test_composite_from_seq_positional() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        let staged = stage(
            &heap,
            &pt,
            &Value::Seq(vec![Value::Int(1), Value::Int(2)]),
        )
        .unwrap();
        assert_eq!(&staged.bytes[..4], &1i32.to_le_bytes());
        assert_eq!(&staged.bytes[4..], &2i32.to_le_bytes());
    }

    #[test]
    fn test_composite_from_short_seq_zero_fills() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        let staged = stage(&heap, &pt, &Value::Seq(vec![Value::Int(9)])).unwrap();
        assert_eq!(&staged.bytes[..4], &9i32.to_le_bytes());
        assert_eq!(&staged.bytes[4..], &[0; 4]);
    }

    #[test]
    fn test_composite_rejects_long_seq() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        let long = Value::Seq(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert!(matches!(stage(&heap, &pt, &long), Err(FfiError::Type(_))));
    }

    #[test]
    fn test_composite_from_map_ignores_unknown_keys() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        let staged = stage(
            &heap,
            &pt,
            &map_of([("y", Value::Int(5)), ("zzz", Value::Int(1))]),
        )
        .unwrap();
        assert_eq!(&staged.bytes[..4], &[0; 4]);
        assert_eq!(&staged.bytes[4..], &5i32.to_le_bytes());
    }

    #[test]
    fn test_composite_map_known_key_wrong_kind_errors() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        let bad = map_of([("x", Value::Str("no".into()))]);
        assert!(matches!(stage(&heap, &pt, &bad), Err(FfiError::Type(_))));
    }

    #[test]
    fn test_derived_from_seq_nests_base() {
        let (heap, reg) = fixture();
        let i32t = reg.lookup("int32").unwrap();
        let base = TypeDesc::layout("base", None, &[("a", &i32t)]).unwrap();
        let derived =
            TypeDesc::layout("derived", Some(("b", &base)), &[("x", &i32t)]).unwrap();
        // The base member consumes one nested sub-sequence.
        let staged = stage(
            &heap,
            &derived,
            &Value::Seq(vec![Value::Seq(vec![Value::Int(1)]), Value::Int(2)]),
        )
        .unwrap();
        assert_eq!(&staged.bytes[..4], &1i32.to_le_bytes());
        assert_eq!(&staged.bytes[4..8], &2i32.to_le_bytes());
    }

    #[test]
    fn test_map_reaches_base_fields_through_flattened_view() {
        let (heap, reg) = fixture();
        let i32t = reg.lookup("int32").unwrap();
        let base = TypeDesc::layout("base", None, &[("a", &i32t)]).unwrap();
        let derived =
            TypeDesc::layout("derived", Some(("b", &base)), &[("x", &i32t)]).unwrap();
        let staged = stage(&heap, &derived, &map_of([("a", Value::Int(7))])).unwrap();
        assert_eq!(&staged.bytes[..4], &7i32.to_le_bytes());
    }

    #[test]
    fn test_char_array_from_str_zero_fills_tail() {
        let (heap, reg) = fixture();
        let chart = reg.lookup("char").unwrap();
        let arr = reg.array_of(&chart, Some(6));
        let staged = stage(&heap, &arr, &Value::Str("hey".into())).unwrap();
        assert_eq!(staged.bytes, b"hey\0\0\0".to_vec());
        assert!(stage(&heap, &arr, &Value::Str("toolonger".into())).is_err());
    }

    #[test]
    fn test_int_array_from_seq() {
        let (heap, reg) = fixture();
        let i32t = reg.lookup("int32").unwrap();
        let arr = reg.array_of(&i32t, Some(3));
        let staged =
            stage(&heap, &arr, &Value::Seq(vec![Value::Int(1), Value::Int(2)])).unwrap();
        assert_eq!(&staged.bytes[..4], &1i32.to_le_bytes());
        assert_eq!(&staged.bytes[4..8], &2i32.to_le_bytes());
        assert_eq!(&staged.bytes[8..], &[0; 4]);
    }

    #[test]
    fn test_null_zeroes_any_target() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        let staged = stage(&heap, &pt, &Value::Null).unwrap();
        assert_eq!(staged.bytes, vec![0; 8]);
        let ptr = reg.pointer_to(&pt);
        let staged = stage(&heap, &ptr, &Value::Null).unwrap();
        assert_eq!(staged.bytes, vec![0; std::mem::size_of::<usize>()]);
        assert!(staged.refs.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn test_int16_range_check_is_exact(v in proptest::num::i64::ANY) {
            let kind = ScalarKind::Int { signed: true, width: 2 };
            let mut buf = [0u8; 2];
            let res = write_scalar(&kind, &Value::Int(v), &mut buf);
            proptest::prop_assert_eq!(
                res.is_ok(),
                (i16::MIN as i64..=i16::MAX as i64).contains(&v)
            );
            if res.is_ok() {
                proptest::prop_assert_eq!(read_scalar(&kind, &buf), Value::Int(v));
            }
        }
    }

    #[test]
    fn test_staging_failure_is_all_or_nothing() {
        let (heap, reg) = fixture();
        let pt = point(&reg);
        // Second element fails; the caller never sees a partial buffer.
        let bad = Value::Seq(vec![Value::Int(1), Value::Str("no".into())]);
        assert!(stage(&heap, &pt, &bad).is_err());
    }
}
