//! Typed expression trees.
//!
//! The unit of emission. Tree building resolves everything the emitter
//! would otherwise need context for: register types are baked in after
//! narrowing, slots after coloring, and memory accesses after global
//! allocation. The emitter walks these trees with no analysis results in
//! hand.
//!
//! Statements are `Expr` variants with `Void` type; terminators are always
//! the last root of a block.

use serde::Serialize;

use opal_ir::{BinaryOp, BlockLabel, CmpPred, VmType};

use crate::api::MethodInfo;

/// Explicit width conversion between register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CastKind {
    S2B,
    S2I,
    I2S,
    I2B,
    /// Sign-extension no-op: byte values already sit in short registers.
    B2S,
    B2I,
    /// Zero-extension from byte: mask with 0xFF (array loads sign-extend).
    ZextB2S,
    ZextB2I,
    ZextS2I,
    Bitcast,
}

/// How an array access reaches its array reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArrayRef {
    /// Static region array, resolved to its constant pool index.
    Static { cp: u16 },
    /// Externally provided array held in a local slot.
    Slot { slot: u16 },
}

/// A typed expression or statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Const {
        ty: VmType,
        value: i64,
    },
    LoadSlot {
        ty: VmType,
        slot: u16,
    },
    /// Reference to a static region array, for argument positions.
    StaticRef {
        cp: u16,
    },
    ArrayLoad {
        ty: VmType,
        array: ArrayRef,
        offset: Box<Expr>,
        element: VmType,
    },
    Neg {
        ty: VmType,
        operand: Box<Expr>,
    },
    Cast {
        ty: VmType,
        kind: CastKind,
        operand: Box<Expr>,
    },
    Binary {
        ty: VmType,
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Comparison producing 0 or 1 as a short.
    Compare {
        pred: CmpPred,
        operand_ty: VmType,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Select {
        ty: VmType,
        cond: Box<Expr>,
        then_val: Box<Expr>,
        else_val: Box<Expr>,
    },
    ApiCall {
        ty: VmType,
        method: MethodInfo,
        args: Vec<Expr>,
    },
    UserCall {
        ty: VmType,
        target: String,
        cp: u16,
        arg_slots: u16,
        args: Vec<Expr>,
    },
    /// Call whose result (if any) is discarded.
    CallStmt {
        call: Box<Expr>,
    },
    StoreSlot {
        ty: VmType,
        slot: u16,
        value: Box<Expr>,
    },
    ArrayStore {
        array: ArrayRef,
        offset: Box<Expr>,
        value: Box<Expr>,
        element: VmType,
    },
    Branch {
        target: BlockLabel,
    },
    CondBranch {
        cond: Box<Expr>,
        then_label: BlockLabel,
        else_label: BlockLabel,
    },
    Return {
        ty: VmType,
        value: Option<Box<Expr>>,
    },
    Switch {
        ty: VmType,
        value: Box<Expr>,
        default: BlockLabel,
        cases: Vec<(i64, BlockLabel)>,
    },
    Unreachable,
}

impl Expr {
    /// The type this expression leaves on the stack; `Void` for statements.
    pub fn ty(&self) -> VmType {
        match self {
            Self::Const { ty, .. }
            | Self::LoadSlot { ty, .. }
            | Self::ArrayLoad { ty, .. }
            | Self::Neg { ty, .. }
            | Self::Cast { ty, .. }
            | Self::Binary { ty, .. }
            | Self::Select { ty, .. }
            | Self::ApiCall { ty, .. }
            | Self::UserCall { ty, .. } => *ty,
            Self::StaticRef { .. } => VmType::Ref,
            Self::Compare { .. } => VmType::Short,
            Self::CallStmt { .. }
            | Self::StoreSlot { .. }
            | Self::ArrayStore { .. }
            | Self::Branch { .. }
            | Self::CondBranch { .. }
            | Self::Return { .. }
            | Self::Switch { .. }
            | Self::Unreachable => VmType::Void,
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Branch { .. }
                | Self::CondBranch { .. }
                | Self::Return { .. }
                | Self::Switch { .. }
                | Self::Unreachable
        )
    }

    pub fn const_value(&self) -> Option<i64> {
        match self {
            Self::Const { value, .. } => Some(*value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_results_are_short() {
        let cmp = Expr::Compare {
            pred: CmpPred::Slt,
            operand_ty: VmType::Int,
            lhs: Box::new(Expr::Const { ty: VmType::Int, value: 1 }),
            rhs: Box::new(Expr::Const { ty: VmType::Int, value: 2 }),
        };
        assert_eq!(cmp.ty(), VmType::Short);
    }

    #[test]
    fn statements_have_void_type() {
        let store = Expr::StoreSlot {
            ty: VmType::Short,
            slot: 3,
            value: Box::new(Expr::Const { ty: VmType::Short, value: 0 }),
        };
        assert_eq!(store.ty(), VmType::Void);
        assert!(!store.is_terminator());
        assert!(Expr::Unreachable.is_terminator());
    }
}
