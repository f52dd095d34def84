//! Operand values.
//!
//! Values are the things instructions operate on: SSA references, typed
//! constants, globals and constant address expressions over them. All
//! values are immutable and compared structurally.

use std::fmt;

use crate::types::{ValueName, VmType};

/// An operand value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Reference to an SSA value (parameter or instruction result).
    SsaRef(ValueName),
    /// Integer constant with its declared type.
    Const { value: i64, ty: VmType },
    /// Reference to a module global.
    GlobalRef(String),
    /// Constant address-of-global-plus-offset expression.
    InlineGep(InlineGep),
    /// Undefined value; reads as zero wherever one is materialized.
    Undef(VmType),
    /// Null reference constant.
    Null,
}

impl Value {
    pub fn const_short(value: i64) -> Self {
        Self::Const { value, ty: VmType::Short }
    }

    pub fn const_int(value: i64) -> Self {
        Self::Const { value, ty: VmType::Int }
    }

    pub fn ssa(name: impl Into<String>) -> Self {
        Self::SsaRef(ValueName::new(name))
    }

    /// The SSA name, if this value is an SSA reference.
    pub fn as_ssa(&self) -> Option<&ValueName> {
        match self {
            Self::SsaRef(name) => Some(name),
            _ => None,
        }
    }
}

/// Addressing shape of a GEP, as declared by its source type.
#[derive(Debug, Clone, PartialEq)]
pub enum GepSource {
    /// Byte-addressed (`i8` source): indices are raw byte offsets.
    Byte,
    /// Array of scalars: indices address whole elements.
    Array { element: VmType, count: u32 },
    /// Array of named structs; stride comes from debug metadata.
    Struct { name: String },
}

/// Base of a constant GEP expression: a global, possibly through another GEP.
#[derive(Debug, Clone, PartialEq)]
pub enum GepBase {
    Global(String),
    Gep(Box<InlineGep>),
}

/// A constant GEP expression (address of a global plus a constant offset).
#[derive(Debug, Clone, PartialEq)]
pub struct InlineGep {
    pub base: GepBase,
    pub indices: Vec<i64>,
    pub source: GepSource,
}

impl InlineGep {
    /// The root global name, traversing nested GEP bases.
    pub fn root_global(&self) -> &str {
        match &self.base {
            GepBase::Global(name) => name,
            GepBase::Gep(inner) => inner.root_global(),
        }
    }

    /// Constant byte offset of this GEP level alone (not including nested
    /// bases). `None` for struct-shaped GEPs, whose stride is only known to
    /// the global allocator.
    pub fn byte_offset(&self) -> Option<i64> {
        match &self.source {
            GepSource::Byte => Some(self.indices.iter().sum()),
            GepSource::Array { element, count } => {
                let elem = element.byte_size() as i64;
                match self.indices.as_slice() {
                    [i] => Some(i * elem),
                    [outer, inner] => Some(outer * (*count as i64) * elem + inner * elem),
                    _ => None,
                }
            }
            GepSource::Struct { .. } => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsaRef(name) => write!(f, "{name}"),
            Self::Const { value, ty } => write!(f, "{ty} {value}"),
            Self::GlobalRef(name) => write!(f, "@{name}"),
            Self::InlineGep(gep) => {
                write!(f, "gep(@{}", gep.root_global())?;
                for idx in &gep.indices {
                    write!(f, ", {idx}")?;
                }
                write!(f, ")")
            }
            Self::Undef(ty) => write!(f, "{ty} undef"),
            Self::Null => f.write_str("null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_global_traverses_nested_bases() {
        let inner = InlineGep {
            base: GepBase::Global("table".into()),
            indices: vec![0, 4],
            source: GepSource::Array { element: VmType::Short, count: 8 },
        };
        let outer = InlineGep {
            base: GepBase::Gep(Box::new(inner)),
            indices: vec![2],
            source: GepSource::Byte,
        };
        assert_eq!(outer.root_global(), "table");
    }

    #[test]
    fn byte_offsets_by_shape() {
        let byte = InlineGep {
            base: GepBase::Global("g".into()),
            indices: vec![5],
            source: GepSource::Byte,
        };
        assert_eq!(byte.byte_offset(), Some(5));

        let array = InlineGep {
            base: GepBase::Global("g".into()),
            indices: vec![0, 3],
            source: GepSource::Array { element: VmType::Short, count: 10 },
        };
        assert_eq!(array.byte_offset(), Some(6));

        let st = InlineGep {
            base: GepBase::Global("g".into()),
            indices: vec![1],
            source: GepSource::Struct { name: "Entry".into() },
        };
        assert_eq!(st.byte_offset(), None);
    }

    #[test]
    fn values_compare_structurally() {
        assert_eq!(Value::ssa("%x"), Value::ssa("%x"));
        assert_ne!(Value::const_short(1), Value::const_int(1));
    }
}
