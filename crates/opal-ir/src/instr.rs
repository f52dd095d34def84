//! Instruction representation.
//!
//! One closed enum with a variant per IR opcode, matched exhaustively by
//! every analysis. Terminators (branch, conditional branch, switch, return,
//! unreachable) are exactly one per block and always last.

use std::fmt;

use serde::Serialize;

use crate::range::ValueRange;
use crate::types::{BlockLabel, ValueName, VmType};
use crate::value::{GepSource, Value};

/// Binary arithmetic/logic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Sdiv,
    Udiv,
    Srem,
    Urem,
    And,
    Or,
    Xor,
    Shl,
    Ashr,
    Lshr,
}

impl BinaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Sdiv => "sdiv",
            Self::Udiv => "udiv",
            Self::Srem => "srem",
            Self::Urem => "urem",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::Ashr => "ashr",
            Self::Lshr => "lshr",
        }
    }

    /// Division and remainder: both operands forced wide on the target
    /// (the narrow ALU has no 16-bit divide with defined overflow).
    pub fn is_div_rem(&self) -> bool {
        matches!(self, Self::Sdiv | Self::Udiv | Self::Srem | Self::Urem)
    }
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CmpPred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl CmpPred {
    pub fn is_unsigned(&self) -> bool {
        matches!(self, Self::Ult | Self::Ule | Self::Ugt | Self::Uge)
    }

    /// Signed predicate with the same ordering after a sign-bit flip.
    pub fn to_signed(&self) -> CmpPred {
        match self {
            Self::Ult => Self::Slt,
            Self::Ule => Self::Sle,
            Self::Ugt => Self::Sgt,
            Self::Uge => Self::Sge,
            other => *other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Slt => "slt",
            Self::Sle => "sle",
            Self::Sgt => "sgt",
            Self::Sge => "sge",
            Self::Ult => "ult",
            Self::Ule => "ule",
            Self::Ugt => "ugt",
            Self::Uge => "uge",
        }
    }
}

/// Cast operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    Trunc,
    Sext,
    Zext,
    Bitcast,
}

impl CastOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Trunc => "trunc",
            Self::Sext => "sext",
            Self::Zext => "zext",
            Self::Bitcast => "bitcast",
        }
    }
}

/// An IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Binary {
        result: ValueName,
        op: BinaryOp,
        ty: VmType,
        lhs: Value,
        rhs: Value,
        /// Optional range metadata from the front end's range analysis.
        range: Option<ValueRange>,
    },
    ICmp {
        result: ValueName,
        pred: CmpPred,
        /// Operand type; the result is always a byte-sized boolean.
        ty: VmType,
        lhs: Value,
        rhs: Value,
    },
    Load {
        result: ValueName,
        ty: VmType,
        addr: Value,
    },
    Store {
        ty: VmType,
        value: Value,
        addr: Value,
    },
    Gep {
        result: ValueName,
        base: Value,
        indices: Vec<Value>,
        source: GepSource,
    },
    Cast {
        result: ValueName,
        op: CastOp,
        from_ty: VmType,
        to_ty: VmType,
        value: Value,
    },
    Phi {
        result: ValueName,
        ty: VmType,
        /// Ordered (value, predecessor) pairs.
        sources: Vec<(Value, BlockLabel)>,
    },
    Select {
        result: ValueName,
        ty: VmType,
        cond: Value,
        then_val: Value,
        else_val: Value,
    },
    Call {
        /// `None` for void calls or discarded results.
        result: Option<ValueName>,
        ty: VmType,
        callee: String,
        args: Vec<Value>,
    },
    Br {
        target: BlockLabel,
    },
    CondBr {
        cond: Value,
        then_label: BlockLabel,
        else_label: BlockLabel,
    },
    Switch {
        value: Value,
        ty: VmType,
        default: BlockLabel,
        cases: Vec<(i64, BlockLabel)>,
    },
    Ret {
        ty: VmType,
        value: Option<Value>,
    },
    Unreachable,
}

impl Inst {
    /// The SSA name this instruction defines, if any.
    pub fn result(&self) -> Option<&ValueName> {
        match self {
            Self::Binary { result, .. }
            | Self::ICmp { result, .. }
            | Self::Load { result, .. }
            | Self::Gep { result, .. }
            | Self::Cast { result, .. }
            | Self::Phi { result, .. }
            | Self::Select { result, .. } => Some(result),
            Self::Call { result, .. } => result.as_ref(),
            _ => None,
        }
    }

    /// Declared type of the defined value, if any.
    pub fn result_type(&self) -> Option<VmType> {
        match self {
            Self::Binary { ty, .. }
            | Self::Load { ty, .. }
            | Self::Phi { ty, .. }
            | Self::Select { ty, .. } => Some(*ty),
            Self::ICmp { .. } => Some(VmType::Byte),
            Self::Gep { .. } => Some(VmType::Ref),
            Self::Cast { to_ty, .. } => Some(*to_ty),
            Self::Call { result, ty, .. } => result.as_ref().map(|_| *ty),
            _ => None,
        }
    }

    /// All operand values, in order.
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Self::Binary { lhs, rhs, .. } | Self::ICmp { lhs, rhs, .. } => vec![lhs, rhs],
            Self::Load { addr, .. } => vec![addr],
            Self::Store { value, addr, .. } => vec![value, addr],
            Self::Gep { base, indices, .. } => {
                let mut ops = vec![base];
                ops.extend(indices.iter());
                ops
            }
            Self::Cast { value, .. } => vec![value],
            Self::Phi { sources, .. } => sources.iter().map(|(v, _)| v).collect(),
            Self::Select { cond, then_val, else_val, .. } => vec![cond, then_val, else_val],
            Self::Call { args, .. } => args.iter().collect(),
            Self::CondBr { cond, .. } => vec![cond],
            Self::Switch { value, .. } => vec![value],
            Self::Ret { value, .. } => value.iter().collect(),
            Self::Br { .. } | Self::Unreachable => vec![],
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Br { .. }
                | Self::CondBr { .. }
                | Self::Switch { .. }
                | Self::Ret { .. }
                | Self::Unreachable
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Self::Phi { .. })
    }

    /// Successor labels of a terminator; empty for non-terminators.
    pub fn successor_labels(&self) -> Vec<&BlockLabel> {
        match self {
            Self::Br { target } => vec![target],
            Self::CondBr { then_label, else_label, .. } => vec![then_label, else_label],
            Self::Switch { default, cases, .. } => {
                let mut labels = vec![default];
                labels.extend(cases.iter().map(|(_, l)| l));
                labels
            }
            _ => vec![],
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary { result, op, ty, lhs, rhs, .. } => {
                write!(f, "{result} = {} {ty} {lhs}, {rhs}", op.name())
            }
            Self::ICmp { result, pred, ty, lhs, rhs } => {
                write!(f, "{result} = icmp {} {ty} {lhs}, {rhs}", pred.name())
            }
            Self::Load { result, ty, addr } => write!(f, "{result} = load {ty}, {addr}"),
            Self::Store { ty, value, addr } => write!(f, "store {ty} {value}, {addr}"),
            Self::Gep { result, base, indices, .. } => {
                write!(f, "{result} = gep {base}")?;
                for idx in indices {
                    write!(f, ", {idx}")?;
                }
                Ok(())
            }
            Self::Cast { result, op, from_ty, to_ty, value } => {
                write!(f, "{result} = {} {from_ty} {value} to {to_ty}", op.name())
            }
            Self::Phi { result, ty, sources } => {
                write!(f, "{result} = phi {ty}")?;
                for (i, (value, label)) in sources.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}[{value}, {label}]")?;
                }
                Ok(())
            }
            Self::Select { result, ty, cond, then_val, else_val } => {
                write!(f, "{result} = select {cond}, {ty} {then_val}, {else_val}")
            }
            Self::Call { result, ty, callee, args } => {
                if let Some(result) = result {
                    write!(f, "{result} = ")?;
                }
                write!(f, "call {ty} @{callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Self::Br { target } => write!(f, "br {target}"),
            Self::CondBr { cond, then_label, else_label } => {
                write!(f, "br {cond}, {then_label}, {else_label}")
            }
            Self::Switch { value, default, cases, .. } => {
                write!(f, "switch {value}, default {default}")?;
                for (case, label) in cases {
                    write!(f, ", [{case} -> {label}]")?;
                }
                Ok(())
            }
            Self::Ret { value: Some(value), .. } => write!(f, "ret {value}"),
            Self::Ret { value: None, .. } => f.write_str("ret void"),
            Self::Unreachable => f.write_str("unreachable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_and_type_queries() {
        let add = Inst::Binary {
            result: "%sum".into(),
            op: BinaryOp::Add,
            ty: VmType::Short,
            lhs: Value::ssa("%a"),
            rhs: Value::const_short(1),
            range: None,
        };
        assert_eq!(add.result().map(|n| n.as_str()), Some("%sum"));
        assert_eq!(add.result_type(), Some(VmType::Short));
        assert!(!add.is_terminator());

        let store = Inst::Store {
            ty: VmType::Short,
            value: Value::ssa("%sum"),
            addr: Value::GlobalRef("counter".into()),
        };
        assert_eq!(store.result(), None);
    }

    #[test]
    fn icmp_result_is_boolean_byte() {
        let cmp = Inst::ICmp {
            result: "%c".into(),
            pred: CmpPred::Slt,
            ty: VmType::Int,
            lhs: Value::ssa("%x"),
            rhs: Value::const_int(0),
        };
        assert_eq!(cmp.result_type(), Some(VmType::Byte));
    }

    #[test]
    fn switch_successors_include_default_and_cases() {
        let sw = Inst::Switch {
            value: Value::ssa("%x"),
            ty: VmType::Short,
            default: "exit".into(),
            cases: vec![(1, "one".into()), (2, "two".into())],
        };
        let succs: Vec<&str> = sw.successor_labels().iter().map(|l| l.as_str()).collect();
        assert_eq!(succs, vec!["exit", "one", "two"]);
    }

    #[test]
    fn unsigned_predicates_map_to_signed() {
        assert_eq!(CmpPred::Ult.to_signed(), CmpPred::Slt);
        assert_eq!(CmpPred::Uge.to_signed(), CmpPred::Sge);
        assert_eq!(CmpPred::Eq.to_signed(), CmpPred::Eq);
    }

    #[test]
    fn display_renders_compact_text() {
        let phi = Inst::Phi {
            result: "%z".into(),
            ty: VmType::Int,
            sources: vec![
                (Value::ssa("%x"), "entry".into()),
                (Value::ssa("%y"), "loop".into()),
            ],
        };
        assert_eq!(phi.to_string(), "%z = phi int [%x, entry], [%y, loop]");
    }
}
