//! Native type descriptors
//!
//! A `TypeDesc` is the static metadata the whole engine runs on: identity
//! name, byte size, alignment and a kind describing the shape of the memory.
//! Descriptors are immutable and shared behind `Rc`; the registry interns
//! them so reference equality is meaningful for type-identity checks.
//!
//! Single inheritance follows the C first-member idiom: a composite whose
//! `base` is set has that base as its field at offset 0, so the base layout
//! is a byte prefix of the derived layout and a derived value can be viewed
//! through a base-typed proxy. "is-a" is the explicit offset-0 prefix walk
//! in [`TypeDesc::derives_from`], never a nominal class check.

use crate::error::FfiError;
use std::rc::Rc;

/// Scalar encodings supported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalarKind {
    /// Integer of `width` bytes (1, 2, 4 or 8)
    Int { signed: bool, width: usize },
    /// IEEE float of `width` bytes (4 or 8)
    Float { width: usize },
    /// One-byte character; reads materialize as byte strings
    Char { signed: bool },
    /// One-byte boolean (0 or 1)
    Bool,
}

/// A named field of a composite type.
#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: String,
    pub offset: usize,
    pub ty: Rc<TypeDesc>,
}

/// Shape of a described native type.
#[derive(Debug, Clone)]
pub enum TypeKind {
    Scalar(ScalarKind),
    /// Ordered fields; when `base` is set, `fields[0]` is the base member
    /// at offset 0 (layout-prefix compatibility).
    Composite {
        fields: Vec<FieldDesc>,
        base: Option<Rc<TypeDesc>>,
    },
    /// Element type plus optional fixed length; `None` means the length is
    /// carried by the instance (its allocation tag).
    Array {
        elem: Rc<TypeDesc>,
        len: Option<usize>,
    },
    Pointer {
        pointee: Rc<TypeDesc>,
    },
    Function {
        params: Vec<Rc<TypeDesc>>,
        ret: Rc<TypeDesc>,
    },
    /// Only meaningful as a function return type or pointee
    Void,
}

/// Static metadata for one native type.
#[derive(Debug)]
pub struct TypeDesc {
    pub name: String,
    pub size: usize,
    pub align: usize,
    pub kind: TypeKind,
}

impl TypeDesc {
    /// Build a scalar descriptor. Size is implied by the encoding.
    pub fn scalar(name: &str, kind: ScalarKind) -> Rc<TypeDesc> {
        let size = match &kind {
            ScalarKind::Int { width, .. } => *width,
            ScalarKind::Float { width } => *width,
            ScalarKind::Char { .. } | ScalarKind::Bool => 1,
        };
        Rc::new(TypeDesc {
            name: name.to_string(),
            size,
            align: size,
            kind: TypeKind::Scalar(kind),
        })
    }

    pub(crate) fn void() -> Rc<TypeDesc> {
        Rc::new(TypeDesc {
            name: "void".to_string(),
            size: 0,
            align: 1,
            kind: TypeKind::Void,
        })
    }

    /// Build a composite descriptor from explicit offsets, validating the
    /// layout invariants: offsets in declaration order, non-overlapping,
    /// fitting inside `size`, and the base (if any) as the offset-0 field.
    pub fn composite(
        name: &str,
        size: usize,
        align: usize,
        base: Option<&Rc<TypeDesc>>,
        fields: Vec<FieldDesc>,
    ) -> Result<Rc<TypeDesc>, FfiError> {
        if !align.is_power_of_two() {
            return Err(FfiError::type_err(format!(
                "composite '{name}': alignment {align} is not a power of two"
            )));
        }
        let mut prev_end = 0usize;
        for field in &fields {
            if field.offset < prev_end {
                return Err(FfiError::type_err(format!(
                    "composite '{name}': field '{}' overlaps the previous field",
                    field.name
                )));
            }
            let end = field.offset + field.ty.size;
            if end > size {
                return Err(FfiError::type_err(format!(
                    "composite '{name}': field '{}' extends past size {size}",
                    field.name
                )));
            }
            prev_end = end;
        }
        if let Some(base_ty) = base {
            let ok = fields
                .first()
                .map(|f| f.offset == 0 && Rc::ptr_eq(&f.ty, base_ty))
                .unwrap_or(false);
            if !ok {
                return Err(FfiError::type_err(format!(
                    "composite '{name}': base '{}' must be the field at offset 0",
                    base_ty.name
                )));
            }
            if base_ty.size > size {
                return Err(FfiError::type_err(format!(
                    "composite '{name}': smaller than its base '{}'",
                    base_ty.name
                )));
            }
        }
        Ok(Rc::new(TypeDesc {
            name: name.to_string(),
            size,
            align,
            kind: TypeKind::Composite {
                fields,
                base: base.cloned(),
            },
        }))
    }

    /// Build a composite descriptor with offsets computed by the usual C
    /// layout rules (each field aligned to its own alignment, total size
    /// padded to the struct alignment). The base member, when present, is
    /// placed first at offset 0.
    pub fn layout(
        name: &str,
        base: Option<(&str, &Rc<TypeDesc>)>,
        fields: &[(&str, &Rc<TypeDesc>)],
    ) -> Result<Rc<TypeDesc>, FfiError> {
        let mut descs = Vec::with_capacity(fields.len() + 1);
        let mut offset = 0usize;
        let mut align = 1usize;
        let mut push = |name: &str, ty: &Rc<TypeDesc>| {
            let a = ty.align.max(1);
            offset = (offset + a - 1) & !(a - 1);
            descs.push(FieldDesc {
                name: name.to_string(),
                offset,
                ty: ty.clone(),
            });
            offset += ty.size;
            align = align.max(a);
        };
        if let Some((base_name, base_ty)) = base {
            push(base_name, base_ty);
        }
        for (field_name, ty) in fields {
            push(field_name, ty);
        }
        let size = (offset + align - 1) & !(align - 1);
        TypeDesc::composite(name, size.max(1), align, base.map(|(_, t)| t), descs)
    }

    pub(crate) fn array(elem: &Rc<TypeDesc>, len: Option<usize>) -> Rc<TypeDesc> {
        let name = match len {
            Some(n) => format!("{}[{}]", elem.name, n),
            None => format!("{}[]", elem.name),
        };
        Rc::new(TypeDesc {
            name,
            size: elem.size * len.unwrap_or(0),
            align: elem.align,
            kind: TypeKind::Array {
                elem: elem.clone(),
                len,
            },
        })
    }

    pub(crate) fn pointer(pointee: &Rc<TypeDesc>) -> Rc<TypeDesc> {
        Rc::new(TypeDesc {
            name: format!("{}*", pointee.name),
            size: std::mem::size_of::<usize>(),
            align: std::mem::align_of::<usize>(),
            kind: TypeKind::Pointer {
                pointee: pointee.clone(),
            },
        })
    }

    pub(crate) fn function(params: &[Rc<TypeDesc>], ret: &Rc<TypeDesc>) -> Rc<TypeDesc> {
        let args = params
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        // Function values travel as their entry address.
        Rc::new(TypeDesc {
            name: format!("{}({})", ret.name, args),
            size: std::mem::size_of::<usize>(),
            align: std::mem::align_of::<usize>(),
            kind: TypeKind::Function {
                params: params.to_vec(),
                ret: ret.clone(),
            },
        })
    }

    /// Layout-prefix check: does this type start with an exact copy of
    /// `base`'s layout? True for the type itself and for every composite
    /// whose offset-0 base chain reaches `base`.
    pub fn derives_from(self: &Rc<Self>, base: &Rc<TypeDesc>) -> bool {
        let mut cur = self.clone();
        loop {
            if Rc::ptr_eq(&cur, base) {
                return true;
            }
            let next = match &cur.kind {
                TypeKind::Composite { base: Some(b), .. } => b.clone(),
                _ => return false,
            };
            cur = next;
        }
    }

    /// Resolve a field name to its offset and type. Own fields win; unknown
    /// names fall through to the base chain (flattened view), so a derived
    /// proxy exposes inherited fields transparently.
    pub fn field(&self, name: &str) -> Option<(usize, Rc<TypeDesc>)> {
        let TypeKind::Composite { fields, base } = &self.kind else {
            return None;
        };
        for f in fields {
            if f.name == name {
                return Some((f.offset, f.ty.clone()));
            }
        }
        // The base member sits at offset 0, so its field offsets are valid
        // in the derived layout unchanged.
        base.as_ref().and_then(|b| b.field(name))
    }

    /// Declaration-order fields for composite kinds, empty otherwise.
    pub fn fields(&self) -> &[FieldDesc] {
        match &self.kind {
            TypeKind::Composite { fields, .. } => fields,
            _ => &[],
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, TypeKind::Composite { .. })
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, TypeKind::Scalar(_))
    }
}

/// Structural equality used by the registry to memoize derived descriptors.
impl PartialEq for TypeDesc {
    fn eq(&self, other: &Self) -> bool {
        if self.size != other.size || self.align != other.align {
            return false;
        }
        match (&self.kind, &other.kind) {
            (TypeKind::Scalar(a), TypeKind::Scalar(b)) => a == b,
            (TypeKind::Void, TypeKind::Void) => true,
            (
                TypeKind::Array { elem: ea, len: la },
                TypeKind::Array { elem: eb, len: lb },
            ) => la == lb && Rc::ptr_eq(ea, eb),
            (TypeKind::Pointer { pointee: a }, TypeKind::Pointer { pointee: b }) => {
                Rc::ptr_eq(a, b)
            }
            (
                TypeKind::Function { params: pa, ret: ra },
                TypeKind::Function { params: pb, ret: rb },
            ) => {
                pa.len() == pb.len()
                    && pa.iter().zip(pb).all(|(x, y)| Rc::ptr_eq(x, y))
                    && Rc::ptr_eq(ra, rb)
            }
            // Composites are nominal: identity only.
            (TypeKind::Composite { .. }, TypeKind::Composite { .. }) => {
                std::ptr::eq(self, other)
            }
            _ => false,
        }
    }
}
