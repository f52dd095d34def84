//! Debug-type metadata attached to module globals.
//!
//! The front end extracts authoritative layout information (scalar sizes,
//! array counts, struct field offsets) from its debug metadata and attaches
//! it here. The global allocator treats this as ground truth instead of
//! inferring layouts from access patterns.

use crate::types::VmType;

/// Layout description of a global's type.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugType {
    /// A single scalar value.
    Scalar { ty: VmType },
    /// A homogeneous array.
    Array { element: Box<DebugType>, count: u32 },
    /// A struct with explicit field offsets. `byte_size` is the stride when
    /// the struct appears as an array element (may include tail padding).
    Struct { name: String, byte_size: u32, fields: Vec<DebugField> },
}

/// A struct field with its byte offset from the struct start.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugField {
    pub name: String,
    pub byte_offset: u32,
    pub ty: DebugType,
}

impl DebugType {
    pub fn scalar(ty: VmType) -> Self {
        Self::Scalar { ty }
    }

    pub fn array(element: DebugType, count: u32) -> Self {
        Self::Array { element: Box::new(element), count }
    }

    /// Total size in bytes. Struct sizes are declared (stride-accurate);
    /// scalar and array sizes are computed.
    pub fn byte_size(&self) -> u32 {
        match self {
            Self::Scalar { ty } => ty.byte_size(),
            Self::Array { element, count } => element.byte_size() * count,
            Self::Struct { byte_size, .. } => *byte_size,
        }
    }

    /// Whether any scalar anywhere in this layout is 64-bit.
    pub fn contains_long(&self) -> bool {
        match self {
            Self::Scalar { ty } => *ty == VmType::Long,
            Self::Array { element, .. } => element.contains_long(),
            Self::Struct { fields, .. } => fields.iter().any(|f| f.ty.contains_long()),
        }
    }

    /// The scalar VM type, if this is a scalar descriptor.
    pub fn as_scalar(&self) -> Option<VmType> {
        match self {
            Self::Scalar { ty } => Some(*ty),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_size_is_count_times_element() {
        let arr = DebugType::array(DebugType::scalar(VmType::Short), 100);
        assert_eq!(arr.byte_size(), 200);
    }

    #[test]
    fn struct_size_is_declared_not_summed() {
        // {byte tag; short value;} padded to 4 bytes by the front end.
        let st = DebugType::Struct {
            name: "Entry".into(),
            byte_size: 4,
            fields: vec![
                DebugField {
                    name: "tag".into(),
                    byte_offset: 0,
                    ty: DebugType::scalar(VmType::Byte),
                },
                DebugField {
                    name: "value".into(),
                    byte_offset: 1,
                    ty: DebugType::scalar(VmType::Short),
                },
            ],
        };
        assert_eq!(st.byte_size(), 4);
    }
}
