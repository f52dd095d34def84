//! Bytecode instruction layer.
//!
//! One `Opcode` per VM mnemonic, including the compact encodings
//! (`sconst_3`, `sload_0`, ...). Constructor functions pick the shortest
//! encoding for a given operand, so the emitter never chooses encodings
//! itself. Every `Insn` carries its own stack effect, which is all the
//! max-stack pass needs.
//!
//! `Label` is a pseudo-instruction: it marks a branch target and occupies
//! no bytes on the target.

use std::fmt;

use serde::Serialize;

use opal_ir::{BinaryOp, BlockLabel, CmpPred, VmType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Opcode {
    AconstNull,
    SconstM1,
    Sconst0,
    Sconst1,
    Sconst2,
    Sconst3,
    Sconst4,
    Sconst5,
    Bspush,
    Sspush,
    IconstM1,
    Iconst0,
    Iconst1,
    Iconst2,
    Iconst3,
    Iconst4,
    Iconst5,
    Bipush,
    Sipush,
    Iipush,
    Sload0,
    Sload1,
    Sload2,
    Sload3,
    Sload,
    Iload0,
    Iload1,
    Iload2,
    Iload3,
    Iload,
    Aload0,
    Aload1,
    Aload2,
    Aload3,
    Aload,
    Sstore0,
    Sstore1,
    Sstore2,
    Sstore3,
    Sstore,
    Istore0,
    Istore1,
    Istore2,
    Istore3,
    Istore,
    Astore0,
    Astore1,
    Astore2,
    Astore3,
    Astore,
    Baload,
    Saload,
    Iaload,
    Aaload,
    Bastore,
    Sastore,
    Iastore,
    Aastore,
    Sadd,
    Ssub,
    Smul,
    Sdiv,
    Srem,
    Sneg,
    Sand,
    Sor,
    Sxor,
    Sshl,
    Sshr,
    Sushr,
    Iadd,
    Isub,
    Imul,
    Idiv,
    Irem,
    Ineg,
    Iand,
    Ior,
    Ixor,
    Ishl,
    Ishr,
    Iushr,
    Sinc,
    Iinc,
    S2b,
    S2i,
    I2b,
    I2s,
    Icmp,
    GotoW,
    Ifeq,
    Ifne,
    Iflt,
    Ifge,
    Ifgt,
    Ifle,
    Ifnull,
    Ifnonnull,
    IfScmpeq,
    IfScmpne,
    IfScmplt,
    IfScmpge,
    IfScmpgt,
    IfScmple,
    IfAcmpeq,
    IfAcmpne,
    Stableswitch,
    Slookupswitch,
    Itableswitch,
    Ilookupswitch,
    Sreturn,
    Ireturn,
    Areturn,
    Return,
    Invokestatic,
    Invokevirtual,
    GetstaticA,
    Dup,
    Dup2,
    Pop,
    Pop2,
    Athrow,
    Label,
}

impl Opcode {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::AconstNull => "aconst_null",
            Self::SconstM1 => "sconst_m1",
            Self::Sconst0 => "sconst_0",
            Self::Sconst1 => "sconst_1",
            Self::Sconst2 => "sconst_2",
            Self::Sconst3 => "sconst_3",
            Self::Sconst4 => "sconst_4",
            Self::Sconst5 => "sconst_5",
            Self::Bspush => "bspush",
            Self::Sspush => "sspush",
            Self::IconstM1 => "iconst_m1",
            Self::Iconst0 => "iconst_0",
            Self::Iconst1 => "iconst_1",
            Self::Iconst2 => "iconst_2",
            Self::Iconst3 => "iconst_3",
            Self::Iconst4 => "iconst_4",
            Self::Iconst5 => "iconst_5",
            Self::Bipush => "bipush",
            Self::Sipush => "sipush",
            Self::Iipush => "iipush",
            Self::Sload0 => "sload_0",
            Self::Sload1 => "sload_1",
            Self::Sload2 => "sload_2",
            Self::Sload3 => "sload_3",
            Self::Sload => "sload",
            Self::Iload0 => "iload_0",
            Self::Iload1 => "iload_1",
            Self::Iload2 => "iload_2",
            Self::Iload3 => "iload_3",
            Self::Iload => "iload",
            Self::Aload0 => "aload_0",
            Self::Aload1 => "aload_1",
            Self::Aload2 => "aload_2",
            Self::Aload3 => "aload_3",
            Self::Aload => "aload",
            Self::Sstore0 => "sstore_0",
            Self::Sstore1 => "sstore_1",
            Self::Sstore2 => "sstore_2",
            Self::Sstore3 => "sstore_3",
            Self::Sstore => "sstore",
            Self::Istore0 => "istore_0",
            Self::Istore1 => "istore_1",
            Self::Istore2 => "istore_2",
            Self::Istore3 => "istore_3",
            Self::Istore => "istore",
            Self::Astore0 => "astore_0",
            Self::Astore1 => "astore_1",
            Self::Astore2 => "astore_2",
            Self::Astore3 => "astore_3",
            Self::Astore => "astore",
            Self::Baload => "baload",
            Self::Saload => "saload",
            Self::Iaload => "iaload",
            Self::Aaload => "aaload",
            Self::Bastore => "bastore",
            Self::Sastore => "sastore",
            Self::Iastore => "iastore",
            Self::Aastore => "aastore",
            Self::Sadd => "sadd",
            Self::Ssub => "ssub",
            Self::Smul => "smul",
            Self::Sdiv => "sdiv",
            Self::Srem => "srem",
            Self::Sneg => "sneg",
            Self::Sand => "sand",
            Self::Sor => "sor",
            Self::Sxor => "sxor",
            Self::Sshl => "sshl",
            Self::Sshr => "sshr",
            Self::Sushr => "sushr",
            Self::Iadd => "iadd",
            Self::Isub => "isub",
            Self::Imul => "imul",
            Self::Idiv => "idiv",
            Self::Irem => "irem",
            Self::Ineg => "ineg",
            Self::Iand => "iand",
            Self::Ior => "ior",
            Self::Ixor => "ixor",
            Self::Ishl => "ishl",
            Self::Ishr => "ishr",
            Self::Iushr => "iushr",
            Self::Sinc => "sinc",
            Self::Iinc => "iinc",
            Self::S2b => "s2b",
            Self::S2i => "s2i",
            Self::I2b => "i2b",
            Self::I2s => "i2s",
            Self::Icmp => "icmp",
            Self::GotoW => "goto_w",
            Self::Ifeq => "ifeq",
            Self::Ifne => "ifne",
            Self::Iflt => "iflt",
            Self::Ifge => "ifge",
            Self::Ifgt => "ifgt",
            Self::Ifle => "ifle",
            Self::Ifnull => "ifnull",
            Self::Ifnonnull => "ifnonnull",
            Self::IfScmpeq => "if_scmpeq",
            Self::IfScmpne => "if_scmpne",
            Self::IfScmplt => "if_scmplt",
            Self::IfScmpge => "if_scmpge",
            Self::IfScmpgt => "if_scmpgt",
            Self::IfScmple => "if_scmple",
            Self::IfAcmpeq => "if_acmpeq",
            Self::IfAcmpne => "if_acmpne",
            Self::Stableswitch => "stableswitch",
            Self::Slookupswitch => "slookupswitch",
            Self::Itableswitch => "itableswitch",
            Self::Ilookupswitch => "ilookupswitch",
            Self::Sreturn => "sreturn",
            Self::Ireturn => "ireturn",
            Self::Areturn => "areturn",
            Self::Return => "return",
            Self::Invokestatic => "invokestatic",
            Self::Invokevirtual => "invokevirtual",
            Self::GetstaticA => "getstatic_a",
            Self::Dup => "dup",
            Self::Dup2 => "dup2",
            Self::Pop => "pop",
            Self::Pop2 => "pop2",
            Self::Athrow => "athrow",
            Self::Label => "label",
        }
    }

    /// Conditional branch with exactly one label operand.
    pub fn is_conditional_branch(&self) -> bool {
        matches!(
            self,
            Self::Ifeq
                | Self::Ifne
                | Self::Iflt
                | Self::Ifge
                | Self::Ifgt
                | Self::Ifle
                | Self::Ifnull
                | Self::Ifnonnull
                | Self::IfScmpeq
                | Self::IfScmpne
                | Self::IfScmplt
                | Self::IfScmpge
                | Self::IfScmpgt
                | Self::IfScmple
                | Self::IfAcmpeq
                | Self::IfAcmpne
        )
    }

    pub fn is_branch(&self) -> bool {
        *self == Self::GotoW || self.is_conditional_branch()
    }

    pub fn is_switch(&self) -> bool {
        matches!(
            self,
            Self::Stableswitch | Self::Slookupswitch | Self::Itableswitch | Self::Ilookupswitch
        )
    }

    /// Control leaves the instruction stream here and never falls through.
    pub fn ends_flow(&self) -> bool {
        matches!(
            self,
            Self::GotoW | Self::Sreturn | Self::Ireturn | Self::Areturn | Self::Return | Self::Athrow
        ) || self.is_switch()
    }

    /// The branch taking the opposite outcome, for conditional branches.
    pub fn inverted(&self) -> Option<Opcode> {
        let inv = match self {
            Self::Ifeq => Self::Ifne,
            Self::Ifne => Self::Ifeq,
            Self::Iflt => Self::Ifge,
            Self::Ifge => Self::Iflt,
            Self::Ifgt => Self::Ifle,
            Self::Ifle => Self::Ifgt,
            Self::Ifnull => Self::Ifnonnull,
            Self::Ifnonnull => Self::Ifnull,
            Self::IfScmpeq => Self::IfScmpne,
            Self::IfScmpne => Self::IfScmpeq,
            Self::IfScmplt => Self::IfScmpge,
            Self::IfScmpge => Self::IfScmplt,
            Self::IfScmpgt => Self::IfScmple,
            Self::IfScmple => Self::IfScmpgt,
            Self::IfAcmpeq => Self::IfAcmpne,
            Self::IfAcmpne => Self::IfAcmpeq,
            _ => return None,
        };
        Some(inv)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// An instruction operand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operand {
    Slot(u16),
    Imm(i64),
    Label(BlockLabel),
    /// Constant pool index.
    Cp(u16),
}

/// One VM instruction with its encoded operands and stack effect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insn {
    pub op: Opcode,
    pub operands: Vec<Operand>,
    pub pops: u16,
    pub pushes: u16,
}

impl Insn {
    fn new(op: Opcode, operands: Vec<Operand>, pops: u16, pushes: u16) -> Self {
        Self { op, operands, pops, pushes }
    }

    fn bare(op: Opcode, pops: u16, pushes: u16) -> Self {
        Self::new(op, Vec::new(), pops, pushes)
    }

    /// The label this pseudo-instruction marks, if it is one.
    pub fn label_name(&self) -> Option<&BlockLabel> {
        if self.op != Opcode::Label {
            return None;
        }
        match self.operands.first() {
            Some(Operand::Label(l)) => Some(l),
            _ => None,
        }
    }

    /// Target of a (non-switch) branch.
    pub fn branch_target(&self) -> Option<&BlockLabel> {
        if !self.op.is_branch() {
            return None;
        }
        match self.operands.first() {
            Some(Operand::Label(l)) => Some(l),
            _ => None,
        }
    }

    /// Rewrites every label operand, including switch target tables.
    pub fn for_each_label_mut(&mut self, mut f: impl FnMut(&mut BlockLabel)) {
        for operand in &mut self.operands {
            if let Operand::Label(l) = operand {
                f(l);
            }
        }
    }

    fn slot_operand(&self) -> Option<u16> {
        match self.operands.first() {
            Some(Operand::Slot(n)) => Some(*n),
            _ => None,
        }
    }

    fn imm_operand(&self) -> Option<i64> {
        match self.operands.first() {
            Some(Operand::Imm(v)) => Some(*v),
            _ => None,
        }
    }

    /// Slot of a short load, decoding compact forms.
    pub fn sload_slot(&self) -> Option<u16> {
        match self.op {
            Opcode::Sload0 => Some(0),
            Opcode::Sload1 => Some(1),
            Opcode::Sload2 => Some(2),
            Opcode::Sload3 => Some(3),
            Opcode::Sload => self.slot_operand(),
            _ => None,
        }
    }

    pub fn sstore_slot(&self) -> Option<u16> {
        match self.op {
            Opcode::Sstore0 => Some(0),
            Opcode::Sstore1 => Some(1),
            Opcode::Sstore2 => Some(2),
            Opcode::Sstore3 => Some(3),
            Opcode::Sstore => self.slot_operand(),
            _ => None,
        }
    }

    pub fn iload_slot(&self) -> Option<u16> {
        match self.op {
            Opcode::Iload0 => Some(0),
            Opcode::Iload1 => Some(1),
            Opcode::Iload2 => Some(2),
            Opcode::Iload3 => Some(3),
            Opcode::Iload => self.slot_operand(),
            _ => None,
        }
    }

    pub fn istore_slot(&self) -> Option<u16> {
        match self.op {
            Opcode::Istore0 => Some(0),
            Opcode::Istore1 => Some(1),
            Opcode::Istore2 => Some(2),
            Opcode::Istore3 => Some(3),
            Opcode::Istore => self.slot_operand(),
            _ => None,
        }
    }

    pub fn aload_slot(&self) -> Option<u16> {
        match self.op {
            Opcode::Aload0 => Some(0),
            Opcode::Aload1 => Some(1),
            Opcode::Aload2 => Some(2),
            Opcode::Aload3 => Some(3),
            Opcode::Aload => self.slot_operand(),
            _ => None,
        }
    }

    pub fn astore_slot(&self) -> Option<u16> {
        match self.op {
            Opcode::Astore0 => Some(0),
            Opcode::Astore1 => Some(1),
            Opcode::Astore2 => Some(2),
            Opcode::Astore3 => Some(3),
            Opcode::Astore => self.slot_operand(),
            _ => None,
        }
    }

    /// Value of a short constant push, decoding compact forms.
    pub fn sconst_value(&self) -> Option<i64> {
        match self.op {
            Opcode::SconstM1 => Some(-1),
            Opcode::Sconst0 => Some(0),
            Opcode::Sconst1 => Some(1),
            Opcode::Sconst2 => Some(2),
            Opcode::Sconst3 => Some(3),
            Opcode::Sconst4 => Some(4),
            Opcode::Sconst5 => Some(5),
            Opcode::Bspush | Opcode::Sspush => self.imm_operand(),
            _ => None,
        }
    }

    pub fn iconst_value(&self) -> Option<i64> {
        match self.op {
            Opcode::IconstM1 => Some(-1),
            Opcode::Iconst0 => Some(0),
            Opcode::Iconst1 => Some(1),
            Opcode::Iconst2 => Some(2),
            Opcode::Iconst3 => Some(3),
            Opcode::Iconst4 => Some(4),
            Opcode::Iconst5 => Some(5),
            Opcode::Bipush | Opcode::Sipush | Opcode::Iipush => self.imm_operand(),
            _ => None,
        }
    }

    /// Constant pool index of a getstatic/invoke instruction.
    pub fn cp_index(&self) -> Option<u16> {
        self.operands.iter().find_map(|o| match o {
            Operand::Cp(cp) => Some(*cp),
            _ => None,
        })
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(label) = self.label_name() {
            return write!(f, "{label}:");
        }
        f.write_str(self.op.mnemonic())?;
        for (i, operand) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            match operand {
                Operand::Slot(n) => write!(f, "{sep}{n}")?,
                Operand::Imm(v) => write!(f, "{sep}{v}")?,
                Operand::Label(l) => write!(f, "{sep}{l}")?,
                Operand::Cp(cp) => write!(f, "{sep}#{cp}")?,
            }
        }
        Ok(())
    }
}

// === Constructors ===

pub fn label(l: BlockLabel) -> Insn {
    Insn::new(Opcode::Label, vec![Operand::Label(l)], 0, 0)
}

pub fn aconst_null() -> Insn {
    Insn::bare(Opcode::AconstNull, 0, 1)
}

/// Push a short constant, picking the shortest encoding.
pub fn sconst(value: i64) -> Insn {
    let op = match value {
        -1 => Opcode::SconstM1,
        0 => Opcode::Sconst0,
        1 => Opcode::Sconst1,
        2 => Opcode::Sconst2,
        3 => Opcode::Sconst3,
        4 => Opcode::Sconst4,
        5 => Opcode::Sconst5,
        -128..=127 => return Insn::new(Opcode::Bspush, vec![Operand::Imm(value)], 0, 1),
        _ => return Insn::new(Opcode::Sspush, vec![Operand::Imm(value)], 0, 1),
    };
    Insn::bare(op, 0, 1)
}

/// Push an int constant, picking the shortest encoding.
pub fn iconst(value: i64) -> Insn {
    let op = match value {
        -1 => Opcode::IconstM1,
        0 => Opcode::Iconst0,
        1 => Opcode::Iconst1,
        2 => Opcode::Iconst2,
        3 => Opcode::Iconst3,
        4 => Opcode::Iconst4,
        5 => Opcode::Iconst5,
        -128..=127 => return Insn::new(Opcode::Bipush, vec![Operand::Imm(value)], 0, 2),
        -32768..=32767 => return Insn::new(Opcode::Sipush, vec![Operand::Imm(value)], 0, 2),
        _ => return Insn::new(Opcode::Iipush, vec![Operand::Imm(value)], 0, 2),
    };
    Insn::bare(op, 0, 2)
}

fn slot_insn(compact: [Opcode; 4], wide: Opcode, slot: u16, pops: u16, pushes: u16) -> Insn {
    if (slot as usize) < compact.len() {
        Insn::bare(compact[slot as usize], pops, pushes)
    } else {
        Insn::new(wide, vec![Operand::Slot(slot)], pops, pushes)
    }
}

pub fn sload(slot: u16) -> Insn {
    slot_insn(
        [Opcode::Sload0, Opcode::Sload1, Opcode::Sload2, Opcode::Sload3],
        Opcode::Sload,
        slot,
        0,
        1,
    )
}

pub fn iload(slot: u16) -> Insn {
    slot_insn(
        [Opcode::Iload0, Opcode::Iload1, Opcode::Iload2, Opcode::Iload3],
        Opcode::Iload,
        slot,
        0,
        2,
    )
}

pub fn aload(slot: u16) -> Insn {
    slot_insn(
        [Opcode::Aload0, Opcode::Aload1, Opcode::Aload2, Opcode::Aload3],
        Opcode::Aload,
        slot,
        0,
        1,
    )
}

pub fn sstore(slot: u16) -> Insn {
    slot_insn(
        [Opcode::Sstore0, Opcode::Sstore1, Opcode::Sstore2, Opcode::Sstore3],
        Opcode::Sstore,
        slot,
        1,
        0,
    )
}

pub fn istore(slot: u16) -> Insn {
    slot_insn(
        [Opcode::Istore0, Opcode::Istore1, Opcode::Istore2, Opcode::Istore3],
        Opcode::Istore,
        slot,
        2,
        0,
    )
}

pub fn astore(slot: u16) -> Insn {
    slot_insn(
        [Opcode::Astore0, Opcode::Astore1, Opcode::Astore2, Opcode::Astore3],
        Opcode::Astore,
        slot,
        1,
        0,
    )
}

/// In-place increment of a short slot by a signed byte delta.
pub fn sinc(slot: u16, delta: i64) -> Insn {
    Insn::new(Opcode::Sinc, vec![Operand::Slot(slot), Operand::Imm(delta)], 0, 0)
}

pub fn iinc(slot: u16, delta: i64) -> Insn {
    Insn::new(Opcode::Iinc, vec![Operand::Slot(slot), Operand::Imm(delta)], 0, 0)
}

pub fn s2b() -> Insn {
    Insn::bare(Opcode::S2b, 1, 1)
}

pub fn s2i() -> Insn {
    Insn::bare(Opcode::S2i, 1, 2)
}

pub fn i2b() -> Insn {
    Insn::bare(Opcode::I2b, 2, 1)
}

pub fn i2s() -> Insn {
    Insn::bare(Opcode::I2s, 2, 1)
}

/// Three-way int comparison pushing -1/0/1 as a short.
pub fn icmp() -> Insn {
    Insn::bare(Opcode::Icmp, 4, 1)
}

pub fn goto(target: BlockLabel) -> Insn {
    Insn::new(Opcode::GotoW, vec![Operand::Label(target)], 0, 0)
}

/// Branch consuming one short, taken when it satisfies `pred` against zero.
///
/// Unsigned predicates must be lowered to signed (sign-bit flip) before
/// reaching the instruction layer.
pub fn branch_on_zero(pred: CmpPred, target: BlockLabel) -> Insn {
    let op = match pred.to_signed() {
        CmpPred::Eq => Opcode::Ifeq,
        CmpPred::Ne => Opcode::Ifne,
        CmpPred::Slt => Opcode::Iflt,
        CmpPred::Sge => Opcode::Ifge,
        CmpPred::Sgt => Opcode::Ifgt,
        CmpPred::Sle => Opcode::Ifle,
        _ => unreachable!("to_signed produced an unsigned predicate"),
    };
    Insn::new(op, vec![Operand::Label(target)], 1, 0)
}

/// Branch consuming two shorts, taken when `lhs pred rhs` holds.
pub fn branch_scmp(pred: CmpPred, target: BlockLabel) -> Insn {
    let op = match pred.to_signed() {
        CmpPred::Eq => Opcode::IfScmpeq,
        CmpPred::Ne => Opcode::IfScmpne,
        CmpPred::Slt => Opcode::IfScmplt,
        CmpPred::Sge => Opcode::IfScmpge,
        CmpPred::Sgt => Opcode::IfScmpgt,
        CmpPred::Sle => Opcode::IfScmple,
        _ => unreachable!("to_signed produced an unsigned predicate"),
    };
    Insn::new(op, vec![Operand::Label(target)], 2, 0)
}

pub fn branch_acmp(equal: bool, target: BlockLabel) -> Insn {
    let op = if equal { Opcode::IfAcmpeq } else { Opcode::IfAcmpne };
    Insn::new(op, vec![Operand::Label(target)], 2, 0)
}

pub fn ifnull(target: BlockLabel) -> Insn {
    Insn::new(Opcode::Ifnull, vec![Operand::Label(target)], 1, 0)
}

pub fn ifnonnull(target: BlockLabel) -> Insn {
    Insn::new(Opcode::Ifnonnull, vec![Operand::Label(target)], 1, 0)
}

/// Table switch over a dense case range `low..=high`.
///
/// Operands are `[default, low, high, target(low), ..., target(high)]`.
pub fn table_switch(wide: bool, default: BlockLabel, low: i64, high: i64, targets: Vec<BlockLabel>) -> Insn {
    let (op, pops) = if wide { (Opcode::Itableswitch, 2) } else { (Opcode::Stableswitch, 1) };
    let mut operands = vec![Operand::Label(default), Operand::Imm(low), Operand::Imm(high)];
    operands.extend(targets.into_iter().map(Operand::Label));
    Insn::new(op, operands, pops, 0)
}

/// Lookup switch over sorted `(match, target)` pairs.
///
/// Operands are `[default, match1, target1, match2, target2, ...]`.
pub fn lookup_switch(wide: bool, default: BlockLabel, cases: Vec<(i64, BlockLabel)>) -> Insn {
    let (op, pops) = if wide { (Opcode::Ilookupswitch, 2) } else { (Opcode::Slookupswitch, 1) };
    let mut operands = vec![Operand::Label(default)];
    for (value, target) in cases {
        operands.push(Operand::Imm(value));
        operands.push(Operand::Label(target));
    }
    Insn::new(op, operands, pops, 0)
}

pub fn invokestatic(cp: u16, arg_slots: u16, ret_slots: u16) -> Insn {
    Insn::new(Opcode::Invokestatic, vec![Operand::Cp(cp)], arg_slots, ret_slots)
}

pub fn invokevirtual(cp: u16, arg_slots: u16, ret_slots: u16) -> Insn {
    Insn::new(Opcode::Invokevirtual, vec![Operand::Cp(cp)], arg_slots, ret_slots)
}

/// Push the array reference of a static region field.
pub fn getstatic_a(cp: u16) -> Insn {
    Insn::new(Opcode::GetstaticA, vec![Operand::Cp(cp)], 0, 1)
}

pub fn dup() -> Insn {
    Insn::bare(Opcode::Dup, 1, 2)
}

pub fn dup2() -> Insn {
    Insn::bare(Opcode::Dup2, 2, 4)
}

pub fn pop() -> Insn {
    Insn::bare(Opcode::Pop, 1, 0)
}

pub fn pop2() -> Insn {
    Insn::bare(Opcode::Pop2, 2, 0)
}

pub fn athrow() -> Insn {
    Insn::bare(Opcode::Athrow, 1, 0)
}

// === Typed helpers ===
//
// Byte values live in short registers; `Byte` maps to the short family
// everywhere except array access, where element width matters.

pub fn load_for_type(ty: VmType, slot: u16) -> Insn {
    match ty {
        VmType::Int => iload(slot),
        VmType::Ref => aload(slot),
        _ => sload(slot),
    }
}

pub fn store_for_type(ty: VmType, slot: u16) -> Insn {
    match ty {
        VmType::Int => istore(slot),
        VmType::Ref => astore(slot),
        _ => sstore(slot),
    }
}

pub fn const_for_type(ty: VmType, value: i64) -> Insn {
    match ty {
        VmType::Int => iconst(value),
        VmType::Ref => aconst_null(),
        _ => sconst(value),
    }
}

pub fn array_load_for_type(element: VmType) -> Insn {
    match element {
        VmType::Byte => Insn::bare(Opcode::Baload, 2, 1),
        VmType::Int => Insn::bare(Opcode::Iaload, 2, 2),
        VmType::Ref => Insn::bare(Opcode::Aaload, 2, 1),
        _ => Insn::bare(Opcode::Saload, 2, 1),
    }
}

pub fn array_store_for_type(element: VmType) -> Insn {
    match element {
        VmType::Byte => Insn::bare(Opcode::Bastore, 3, 0),
        VmType::Int => Insn::bare(Opcode::Iastore, 4, 0),
        VmType::Ref => Insn::bare(Opcode::Aastore, 3, 0),
        _ => Insn::bare(Opcode::Sastore, 3, 0),
    }
}

/// Arithmetic/logic instruction for an operand type.
///
/// `Udiv`/`Urem` map to the signed instructions; narrowing keeps unsigned
/// division operands in non-negative ranges, where the two agree.
pub fn binary_op_for_type(op: BinaryOp, ty: VmType) -> Insn {
    let wide = ty == VmType::Int;
    let opcode = match op {
        BinaryOp::Add => [Opcode::Sadd, Opcode::Iadd],
        BinaryOp::Sub => [Opcode::Ssub, Opcode::Isub],
        BinaryOp::Mul => [Opcode::Smul, Opcode::Imul],
        BinaryOp::Sdiv | BinaryOp::Udiv => [Opcode::Sdiv, Opcode::Idiv],
        BinaryOp::Srem | BinaryOp::Urem => [Opcode::Srem, Opcode::Irem],
        BinaryOp::And => [Opcode::Sand, Opcode::Iand],
        BinaryOp::Or => [Opcode::Sor, Opcode::Ior],
        BinaryOp::Xor => [Opcode::Sxor, Opcode::Ixor],
        BinaryOp::Shl => [Opcode::Sshl, Opcode::Ishl],
        BinaryOp::Ashr => [Opcode::Sshr, Opcode::Ishr],
        BinaryOp::Lshr => [Opcode::Sushr, Opcode::Iushr],
    };
    if wide {
        Insn::bare(opcode[1], 4, 2)
    } else {
        Insn::bare(opcode[0], 2, 1)
    }
}

pub fn neg_for_type(ty: VmType) -> Insn {
    if ty == VmType::Int {
        Insn::bare(Opcode::Ineg, 2, 2)
    } else {
        Insn::bare(Opcode::Sneg, 1, 1)
    }
}

pub fn return_for_type(ty: VmType) -> Insn {
    match ty {
        VmType::Void => Insn::bare(Opcode::Return, 0, 0),
        VmType::Int => Insn::bare(Opcode::Ireturn, 2, 0),
        VmType::Ref => Insn::bare(Opcode::Areturn, 1, 0),
        _ => Insn::bare(Opcode::Sreturn, 1, 0),
    }
}
