//! Value types and name newtypes for the Opal IR.
//!
//! The target VM has a narrow execution model: locals and the operand stack
//! are addressed in 16-bit slots, with 32-bit values occupying two
//! contiguous slots. `Long` exists only as a marker so the front end can
//! report 64-bit values; it must never survive into slot or stack
//! allocation, and validation rejects it before any width query runs.

use std::borrow::Borrow;
use std::fmt;

use serde::Serialize;

/// Value type in the target VM's model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VmType {
    Byte,
    Short,
    Int,
    Ref,
    Void,
    /// 64-bit marker. Rejected by validation; never allocated.
    Long,
}

impl VmType {
    /// Number of local/stack slots this type occupies.
    ///
    /// Panics on `Long`: validation rejects 64-bit values before any
    /// allocation-time width query, so reaching this is a compiler bug.
    pub fn slots(&self) -> u16 {
        match self {
            Self::Byte | Self::Short | Self::Ref => 1,
            Self::Int => 2,
            Self::Void => 0,
            Self::Long => panic!("64-bit value reached slot allocation"),
        }
    }

    /// Size in bytes when stored in a memory region.
    pub fn byte_size(&self) -> u32 {
        match self {
            Self::Byte => 1,
            Self::Short => 2,
            Self::Int | Self::Ref => 4,
            Self::Void => 0,
            Self::Long => panic!("64-bit value reached size computation"),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Byte | Self::Short | Self::Int | Self::Long)
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Ref => "ref",
            Self::Void => "void",
            Self::Long => "long",
        };
        f.write_str(s)
    }
}

/// An SSA value name (e.g. `%x`, `%add.1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ValueName(String);

impl ValueName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ValueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ValueName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for ValueName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A basic block label, unique within its function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BlockLabel(String);

impl BlockLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockLabel {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for BlockLabel {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_widths() {
        assert_eq!(VmType::Byte.slots(), 1);
        assert_eq!(VmType::Short.slots(), 1);
        assert_eq!(VmType::Ref.slots(), 1);
        assert_eq!(VmType::Int.slots(), 2);
        assert_eq!(VmType::Void.slots(), 0);
    }

    #[test]
    #[should_panic(expected = "64-bit value")]
    fn long_has_no_slot_width() {
        let _ = VmType::Long.slots();
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(VmType::Byte.byte_size(), 1);
        assert_eq!(VmType::Short.byte_size(), 2);
        assert_eq!(VmType::Int.byte_size(), 4);
        assert_eq!(VmType::Ref.byte_size(), 4);
    }

    #[test]
    fn names_display_verbatim() {
        assert_eq!(ValueName::from("%x").to_string(), "%x");
        assert_eq!(BlockLabel::from("entry").to_string(), "entry");
        assert_eq!(VmType::Short.to_string(), "short");
    }
}
