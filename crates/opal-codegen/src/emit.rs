//! Bytecode emission.
//!
//! Walks the expression trees of each block and appends instructions.
//! Notable lowerings:
//!
//! - comparisons used as values materialize 0/1 through a branch; used
//!   as a branch condition they fuse into the conditional branch instead
//! - the target compares 32-bit values with `icmp` (pushing -1/0/1)
//!   followed by a single-operand branch
//! - unsigned predicates do not exist in the instruction set; both
//!   operands get their sign bit flipped, then the signed predicate
//!   gives the unsigned ordering
//! - every control-flow edge runs its phi moves before the jump; a
//!   conditional or switch target that needs moves is edge-split
//!   through a synthetic label
//!
//! After emission the instruction list goes through the peephole pass
//! and the stack-depth computation; the result is a self-contained
//! `FunctionCode`.

use serde::Serialize;

use opal_analysis::{FunctionLocals, PhiInfo};
use opal_common::{CodegenError, Limits, Phase};
use opal_ir::{BinaryOp, Block, BlockLabel, CmpPred, Function, VmType};

use crate::build::BuildContext;
use crate::expr::{ArrayRef, CastKind, Expr};
use crate::ops::{self, Insn};
use crate::peephole::peephole;
use crate::phi_moves::{build_phi_moves, schedule_phi_moves, TempAllocator};
use crate::stack::compute_max_stack;

/// Finished bytecode for one function.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionCode {
    pub insns: Vec<Insn>,
    pub max_stack: u16,
    pub max_locals: u16,
}

struct EmitContext<'a> {
    func: &'a Function,
    locals: &'a FunctionLocals,
    phi_info: &'a PhiInfo,
    limits: &'a Limits,
    insns: Vec<Insn>,
    temps: TempAllocator,
    label_counter: u32,
}

/// Compile one function: trees, emission, peephole, stack depth.
pub fn compile_function(
    build: &BuildContext,
    phi_info: &PhiInfo,
    limits: &Limits,
) -> Result<FunctionCode, CodegenError> {
    let func = build.func;
    let locals = build.locals;
    let mut emit = EmitContext {
        func,
        locals,
        phi_info,
        limits,
        insns: Vec::new(),
        temps: TempAllocator::new(locals.first_temp_slot),
        label_counter: 0,
    };

    for block in &func.blocks {
        emit.insns.push(ops::label(block.label.clone()));
        let trees = build.build_block_trees(block)?;
        let (terminator, body) = trees
            .split_last()
            .ok_or_else(|| emit.err(format!("block {} produced no terminator", block.label)))?;
        for tree in body {
            emit.emit_expr(tree)?;
        }
        emit.emit_terminator(block, terminator)?;
    }

    let temp_slots = emit.temps.max_used();
    let first_free = locals.first_temp_slot + temp_slots;
    let (insns, extra_locals) = peephole(emit.insns, first_free);
    let max_locals = first_free + extra_locals;
    let max_stack = compute_max_stack(&func.name, &insns)?;

    if max_locals > limits.max_locals_hard {
        return Err(CodegenError::new(
            Phase::Emit,
            &func.name,
            format!("{max_locals} locals exceed the frame limit {}", limits.max_locals_hard),
        ));
    }
    if max_stack > limits.max_stack_hard {
        return Err(CodegenError::new(
            Phase::Emit,
            &func.name,
            format!("stack depth {max_stack} exceeds the frame limit {}", limits.max_stack_hard),
        ));
    }

    Ok(FunctionCode { insns, max_stack, max_locals })
}

impl<'a> EmitContext<'a> {
    fn err(&self, message: impl Into<String>) -> CodegenError {
        CodegenError::new(Phase::Emit, &self.func.name, message)
    }

    fn fresh_label(&mut self) -> BlockLabel {
        let label = BlockLabel::new(format!(".L{}", self.label_counter));
        self.label_counter += 1;
        label
    }

    fn emit_expr(&mut self, expr: &Expr) -> Result<(), CodegenError> {
        match expr {
            Expr::Const { ty, value } => {
                self.insns.push(ops::const_for_type(*ty, *value));
            }
            Expr::LoadSlot { ty, slot } => {
                self.insns.push(ops::load_for_type(*ty, *slot));
            }
            Expr::StaticRef { cp } => {
                self.insns.push(ops::getstatic_a(*cp));
            }
            Expr::ArrayLoad { array, offset, element, .. } => {
                self.emit_array_ref(array);
                self.emit_expr(offset)?;
                self.insns.push(ops::array_load_for_type(*element));
            }
            Expr::Neg { ty, operand } => {
                self.emit_expr(operand)?;
                self.insns.push(ops::neg_for_type(*ty));
            }
            Expr::Cast { kind, operand, .. } => {
                self.emit_expr(operand)?;
                self.emit_cast(*kind);
            }
            Expr::Binary { ty, op, lhs, rhs } => {
                self.emit_expr(lhs)?;
                self.emit_expr(rhs)?;
                self.insns.push(ops::binary_op_for_type(*op, *ty));
            }
            Expr::Compare { pred, operand_ty, lhs, rhs } => {
                // Materialize 0/1: branch to the true arm, fall through 0.
                let true_label = self.fresh_label();
                let end_label = self.fresh_label();
                self.emit_compare_branch(*pred, *operand_ty, lhs, rhs, true_label.clone())?;
                self.insns.push(ops::sconst(0));
                self.insns.push(ops::goto(end_label.clone()));
                self.insns.push(ops::label(true_label));
                self.insns.push(ops::sconst(1));
                self.insns.push(ops::label(end_label));
            }
            Expr::Select { cond, then_val, else_val, .. } => {
                let else_label = self.fresh_label();
                let end_label = self.fresh_label();
                self.emit_branch_cond(cond, else_label.clone(), false)?;
                self.emit_expr(then_val)?;
                self.insns.push(ops::goto(end_label.clone()));
                self.insns.push(ops::label(else_label));
                self.emit_expr(else_val)?;
                self.insns.push(ops::label(end_label));
            }
            Expr::ApiCall { method, args, .. } => {
                for arg in args {
                    self.emit_expr(arg)?;
                }
                let insn = if method.is_static {
                    ops::invokestatic(method.cp_index, method.arg_slots(), method.ret_slots())
                } else {
                    ops::invokevirtual(method.cp_index, method.arg_slots(), method.ret_slots())
                };
                self.insns.push(insn);
            }
            Expr::UserCall { ty, cp, arg_slots, args, .. } => {
                for arg in args {
                    self.emit_expr(arg)?;
                }
                self.insns.push(ops::invokestatic(*cp, *arg_slots, ty.slots()));
            }
            Expr::CallStmt { call } => {
                let ret_slots = call.ty().slots();
                self.emit_expr(call)?;
                match ret_slots {
                    0 => {}
                    1 => self.insns.push(ops::pop()),
                    _ => self.insns.push(ops::pop2()),
                }
            }
            Expr::StoreSlot { ty, slot, value } => {
                self.emit_expr(value)?;
                self.insns.push(ops::store_for_type(*ty, *slot));
            }
            Expr::ArrayStore { array, offset, value, element } => {
                self.emit_array_ref(array);
                self.emit_expr(offset)?;
                self.emit_expr(value)?;
                self.insns.push(ops::array_store_for_type(*element));
            }
            Expr::Branch { .. }
            | Expr::CondBranch { .. }
            | Expr::Return { .. }
            | Expr::Switch { .. }
            | Expr::Unreachable => {
                return Err(self.err("terminator emitted outside block tail"));
            }
        }
        Ok(())
    }

    fn emit_array_ref(&mut self, array: &ArrayRef) {
        match array {
            ArrayRef::Static { cp } => self.insns.push(ops::getstatic_a(*cp)),
            ArrayRef::Slot { slot } => self.insns.push(ops::aload(*slot)),
        }
    }

    fn emit_cast(&mut self, kind: CastKind) {
        match kind {
            CastKind::S2B | CastKind::B2S => self.insns.push(ops::s2b()),
            CastKind::S2I => self.insns.push(ops::s2i()),
            CastKind::I2S => self.insns.push(ops::i2s()),
            CastKind::I2B => self.insns.push(ops::i2b()),
            CastKind::B2I => {
                self.insns.push(ops::s2b());
                self.insns.push(ops::s2i());
            }
            CastKind::ZextB2S => {
                self.insns.push(ops::sconst(0xff));
                self.insns.push(ops::binary_op_for_type(BinaryOp::And, VmType::Short));
            }
            CastKind::ZextB2I => {
                self.insns.push(ops::sconst(0xff));
                self.insns.push(ops::binary_op_for_type(BinaryOp::And, VmType::Short));
                self.insns.push(ops::s2i());
            }
            CastKind::ZextS2I => {
                self.insns.push(ops::s2i());
                self.insns.push(ops::iconst(0xffff));
                self.insns.push(ops::binary_op_for_type(BinaryOp::And, VmType::Int));
            }
            CastKind::Bitcast => {}
        }
    }

    /// Branch to `target` when `cond` is true (`when_true`) or false.
    ///
    /// A comparison condition fuses into the branch; anything else is
    /// evaluated and tested against zero.
    fn emit_branch_cond(
        &mut self,
        cond: &Expr,
        target: BlockLabel,
        when_true: bool,
    ) -> Result<(), CodegenError> {
        if let Expr::Compare { pred, operand_ty, lhs, rhs } = cond {
            let pred = if when_true { *pred } else { invert_pred(*pred) };
            return self.emit_compare_branch(pred, *operand_ty, lhs, rhs, target);
        }
        self.emit_expr(cond)?;
        let pred = if when_true { CmpPred::Ne } else { CmpPred::Eq };
        self.insns.push(ops::branch_on_zero(pred, target));
        Ok(())
    }

    fn emit_compare_branch(
        &mut self,
        pred: CmpPred,
        operand_ty: VmType,
        lhs: &Expr,
        rhs: &Expr,
        target: BlockLabel,
    ) -> Result<(), CodegenError> {
        match operand_ty {
            VmType::Ref => {
                if pred != CmpPred::Eq && pred != CmpPred::Ne {
                    return Err(self.err(format!("ordered compare {} on references", pred.name())));
                }
                // Null tests have dedicated single-operand branches.
                if is_null(rhs) {
                    self.emit_expr(lhs)?;
                    let insn = if pred == CmpPred::Eq {
                        ops::ifnull(target)
                    } else {
                        ops::ifnonnull(target)
                    };
                    self.insns.push(insn);
                    return Ok(());
                }
                if is_null(lhs) {
                    self.emit_expr(rhs)?;
                    let insn = if pred == CmpPred::Eq {
                        ops::ifnull(target)
                    } else {
                        ops::ifnonnull(target)
                    };
                    self.insns.push(insn);
                    return Ok(());
                }
                self.emit_expr(lhs)?;
                self.emit_expr(rhs)?;
                self.insns.push(ops::branch_acmp(pred == CmpPred::Eq, target));
                Ok(())
            }
            VmType::Int => {
                self.emit_operand_flipped(lhs, VmType::Int, pred.is_unsigned())?;
                self.emit_operand_flipped(rhs, VmType::Int, pred.is_unsigned())?;
                self.insns.push(ops::icmp());
                self.insns.push(ops::branch_on_zero(pred.to_signed(), target));
                Ok(())
            }
            _ => {
                // Short compare against zero has a single-operand form.
                if !pred.is_unsigned() && is_zero(rhs) {
                    self.emit_expr(lhs)?;
                    self.insns.push(ops::branch_on_zero(pred, target));
                    return Ok(());
                }
                self.emit_operand_flipped(lhs, VmType::Short, pred.is_unsigned())?;
                self.emit_operand_flipped(rhs, VmType::Short, pred.is_unsigned())?;
                self.insns.push(ops::branch_scmp(pred.to_signed(), target));
                Ok(())
            }
        }
    }

    /// Emit an operand, XOR-flipping its sign bit for unsigned compares.
    fn emit_operand_flipped(
        &mut self,
        operand: &Expr,
        ty: VmType,
        flip: bool,
    ) -> Result<(), CodegenError> {
        self.emit_expr(operand)?;
        if flip {
            match ty {
                VmType::Int => {
                    self.insns.push(ops::iconst(i32::MIN as i64));
                    self.insns.push(ops::binary_op_for_type(BinaryOp::Xor, VmType::Int));
                }
                _ => {
                    self.insns.push(ops::sconst(i16::MIN as i64));
                    self.insns.push(ops::binary_op_for_type(BinaryOp::Xor, VmType::Short));
                }
            }
        }
        Ok(())
    }

    // === Terminators and edges ===

    fn emit_terminator(&mut self, block: &Block, expr: &Expr) -> Result<(), CodegenError> {
        match expr {
            Expr::Branch { target } => {
                let moves = self.edge_moves(block, target)?;
                self.insns.extend(moves);
                self.insns.push(ops::goto(target.clone()));
                Ok(())
            }
            Expr::CondBranch { cond, then_label, else_label } => {
                let mut stubs = Vec::new();
                let then_target = self.edge_label(block, then_label, &mut stubs)?;
                self.emit_branch_cond(cond, then_target, true)?;
                let else_moves = self.edge_moves(block, else_label)?;
                self.insns.extend(else_moves);
                self.insns.push(ops::goto(else_label.clone()));
                self.flush_stubs(stubs);
                Ok(())
            }
            Expr::Return { ty, value } => {
                if let Some(value) = value {
                    self.emit_expr(value)?;
                }
                self.insns.push(ops::return_for_type(*ty));
                Ok(())
            }
            Expr::Switch { ty, value, default, cases } => {
                self.emit_switch(block, *ty, value, default, cases)
            }
            Expr::Unreachable => {
                // Trap: throwing a null reference aborts the VM.
                self.insns.push(ops::aconst_null());
                self.insns.push(ops::athrow());
                Ok(())
            }
            other => Err(self.err(format!("block {} ends in a non-terminator {other:?}", block.label))),
        }
    }

    fn emit_switch(
        &mut self,
        block: &Block,
        ty: VmType,
        value: &Expr,
        default: &BlockLabel,
        cases: &[(i64, BlockLabel)],
    ) -> Result<(), CodegenError> {
        self.emit_expr(value)?;
        let wide = ty == VmType::Int;

        let mut stubs = Vec::new();
        let default_target = self.edge_label(block, default, &mut stubs)?;

        if cases.is_empty() {
            // Value still on the stack; a goto would leave it there.
            self.insns.push(if wide { ops::pop2() } else { ops::pop() });
            self.insns.push(ops::goto(default_target));
            self.flush_stubs(stubs);
            return Ok(());
        }

        let mut routed = Vec::with_capacity(cases.len());
        for (value, label) in cases {
            routed.push((*value, self.edge_label(block, label, &mut stubs)?));
        }

        let low = routed.iter().map(|(v, _)| *v).min().unwrap_or(0);
        let high = routed.iter().map(|(v, _)| *v).max().unwrap_or(0);
        let range = high - low + 1;
        let density = routed.len() as f64 / range as f64;
        let use_table =
            density >= self.limits.switch_density_threshold && range <= self.limits.switch_max_range;

        if use_table {
            // Fill holes with the default target.
            let mut targets = vec![default_target.clone(); range as usize];
            for (value, label) in &routed {
                targets[(value - low) as usize] = label.clone();
            }
            self.insns.push(ops::table_switch(wide, default_target, low, high, targets));
        } else {
            routed.sort_by_key(|(v, _)| *v);
            self.insns.push(ops::lookup_switch(wide, default_target, routed));
        }
        self.flush_stubs(stubs);
        Ok(())
    }

    /// Phi-move instructions for the edge `block -> target`.
    fn edge_moves(&mut self, block: &Block, target: &BlockLabel) -> Result<Vec<Insn>, CodegenError> {
        let succ = self
            .func
            .block(target.as_str())
            .ok_or_else(|| self.err(format!("branch to unknown block {target}")))?;
        let moves = build_phi_moves(self.func, block, succ, self.phi_info, self.locals)?;
        self.temps.reset();
        schedule_phi_moves(&moves, &mut self.temps)
    }

    /// Direct label for a move-free edge, or a synthetic label whose stub
    /// runs the moves and jumps on.
    fn edge_label(
        &mut self,
        block: &Block,
        target: &BlockLabel,
        stubs: &mut Vec<(BlockLabel, Vec<Insn>, BlockLabel)>,
    ) -> Result<BlockLabel, CodegenError> {
        let moves = self.edge_moves(block, target)?;
        if moves.is_empty() {
            return Ok(target.clone());
        }
        // One stub per distinct target is enough.
        if let Some((label, _, _)) = stubs.iter().find(|(_, _, t)| t == target) {
            return Ok(label.clone());
        }
        let label = self.fresh_label();
        stubs.push((label.clone(), moves, target.clone()));
        Ok(label)
    }

    fn flush_stubs(&mut self, stubs: Vec<(BlockLabel, Vec<Insn>, BlockLabel)>) {
        for (label, moves, target) in stubs {
            self.insns.push(ops::label(label));
            self.insns.extend(moves);
            self.insns.push(ops::goto(target));
        }
    }
}

fn invert_pred(pred: CmpPred) -> CmpPred {
    match pred {
        CmpPred::Eq => CmpPred::Ne,
        CmpPred::Ne => CmpPred::Eq,
        CmpPred::Slt => CmpPred::Sge,
        CmpPred::Sle => CmpPred::Sgt,
        CmpPred::Sgt => CmpPred::Sle,
        CmpPred::Sge => CmpPred::Slt,
        CmpPred::Ult => CmpPred::Uge,
        CmpPred::Ule => CmpPred::Ugt,
        CmpPred::Ugt => CmpPred::Ule,
        CmpPred::Uge => CmpPred::Ult,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(expr, Expr::Const { ty: VmType::Ref, value: 0 })
}

fn is_zero(expr: &Expr) -> bool {
    matches!(expr, Expr::Const { value: 0, .. })
}
