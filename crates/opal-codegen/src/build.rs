//! Expression tree building from IR.
//!
//! Lowers a function's blocks into the trees the emitter walks. All
//! context is resolved here:
//!
//! - types come from the narrowed register types in `FunctionLocals`
//! - slots come from graph coloring
//! - global and GEP addresses resolve through `AllocationResult` to a
//!   `(region array, element offset)` pair
//! - calls classify against the API registry, falling back to the
//!   module's own functions
//!
//! Roots are stores, calls, terminators and escaping definitions.
//! Non-escaping definitions are folded into their consumers as
//! sub-trees. Any pointer shape the resolver does not recognize is a
//! fatal error naming the instruction.

use rustc_hash::FxHashMap;

use opal_analysis::{AllocatedStruct, AllocationResult, FunctionLocals, MemRegion};
use opal_common::{CodegenError, Phase};
use opal_ir::{
    BinaryOp, Block, CastOp, Function, GepSource, InlineGep, Inst, Value, ValueName, VmType,
};

use crate::api::ApiRegistry;
use crate::expr::{ArrayRef, CastKind, Expr};

/// Everything tree construction needs, bundled once per function.
pub struct BuildContext<'a> {
    pub func: &'a Function,
    pub locals: &'a FunctionLocals,
    pub allocation: &'a AllocationResult,
    pub registry: &'a ApiRegistry,
    /// Constant pool index of each region's static array field.
    pub region_cp: &'a FxHashMap<MemRegion, u16>,
    /// Constant pool index of each module function.
    pub user_method_cp: &'a FxHashMap<String, u16>,
    def_map: FxHashMap<ValueName, &'a Inst>,
    param_slots: FxHashMap<ValueName, u16>,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        func: &'a Function,
        locals: &'a FunctionLocals,
        allocation: &'a AllocationResult,
        registry: &'a ApiRegistry,
        region_cp: &'a FxHashMap<MemRegion, u16>,
        user_method_cp: &'a FxHashMap<String, u16>,
    ) -> Self {
        let mut def_map = FxHashMap::default();
        for block in &func.blocks {
            for inst in &block.instrs {
                if let Some(result) = inst.result() {
                    def_map.insert(result.clone(), inst);
                }
            }
        }
        Self {
            func,
            locals,
            allocation,
            registry,
            region_cp,
            user_method_cp,
            def_map,
            param_slots: func.param_slots(),
        }
    }

    fn err(&self, message: impl Into<String>) -> CodegenError {
        CodegenError::new(Phase::TreeBuild, &self.func.name, message)
    }

    fn register_type(&self, name: &ValueName) -> Result<VmType, CodegenError> {
        self.locals
            .register_type(name)
            .ok_or_else(|| self.err(format!("no register type for {name}")))
    }

    fn slot_of(&self, name: &ValueName) -> Result<u16, CodegenError> {
        self.locals
            .slot_of(name)
            .ok_or_else(|| self.err(format!("{name} escapes but has no slot")))
    }

    /// Whether `inst` starts its own tree instead of folding into a consumer.
    pub fn is_root(&self, inst: &Inst) -> bool {
        match inst {
            Inst::Store { .. } | Inst::Call { .. } => true,
            Inst::Phi { .. } | Inst::Gep { .. } => false,
            // Selects between pointers resolve at their load/store use sites.
            Inst::Select { then_val, else_val, .. }
                if is_pointer_value(then_val) || is_pointer_value(else_val) =>
            {
                false
            }
            _ if inst.is_terminator() => true,
            _ => inst.result().is_some_and(|r| self.locals.has_slot(r)),
        }
    }

    /// Build the ordered root trees of one block; the last is the terminator.
    pub fn build_block_trees(&self, block: &Block) -> Result<Vec<Expr>, CodegenError> {
        let mut roots = Vec::new();
        for inst in &block.instrs {
            if !self.is_root(inst) {
                continue;
            }
            if let Some(tree) = self.build_root(inst)? {
                roots.push(tree);
            }
        }
        Ok(roots)
    }

    fn build_root(&self, inst: &Inst) -> Result<Option<Expr>, CodegenError> {
        if inst.is_terminator() {
            return self.build_terminator(inst).map(Some);
        }
        match inst {
            Inst::Store { ty, value, addr } => self.build_store(*ty, value, addr).map(Some),
            Inst::Call { .. } => self.build_call_root(inst).map(Some),
            _ => {
                let result = match inst.result() {
                    Some(r) if self.locals.has_slot(r) => r,
                    _ => return Ok(None),
                };
                let slot = self.slot_of(result)?;
                let ty = self.register_type(result)?;
                let value = self.build_value_tree(inst)?;
                let value = self.coerce(value, ty)?;
                Ok(Some(Expr::StoreSlot { ty, slot, value: Box::new(value) }))
            }
        }
    }

    /// Tree for a value-producing instruction, root or folded alike.
    fn build_value_tree(&self, inst: &Inst) -> Result<Expr, CodegenError> {
        match inst {
            Inst::Binary { result, op, lhs, rhs, .. } => self.build_binary(result, *op, lhs, rhs),
            Inst::ICmp { pred, ty, lhs, rhs, .. } => {
                let operand_ty = register_width(*ty);
                Ok(Expr::Compare {
                    pred: *pred,
                    operand_ty,
                    lhs: Box::new(self.build_typed_operand(lhs, operand_ty)?),
                    rhs: Box::new(self.build_typed_operand(rhs, operand_ty)?),
                })
            }
            Inst::Load { result, ty, addr } => self.build_load(result, *ty, addr),
            Inst::Select { result, cond, then_val, else_val, .. } => {
                let ty = self.register_type(result)?;
                Ok(Expr::Select {
                    ty,
                    cond: Box::new(self.build_typed_operand(cond, VmType::Short)?),
                    then_val: Box::new(self.build_typed_operand(then_val, ty)?),
                    else_val: Box::new(self.build_typed_operand(else_val, ty)?),
                })
            }
            Inst::Cast { result, op, from_ty, value, .. } => {
                self.build_cast(result, *op, *from_ty, value)
            }
            Inst::Call { .. } => self.build_call_expr(inst),
            Inst::Phi { result, .. } => {
                // Phi values are materialized by edge moves; read the slot.
                Ok(Expr::LoadSlot {
                    ty: self.register_type(result)?,
                    slot: self.slot_of(result)?,
                })
            }
            Inst::Gep { .. } => Err(self.err(format!("gep used as a plain value: {inst}"))),
            _ => Err(self.err(format!("instruction produces no value: {inst}"))),
        }
    }

    /// Resolve an operand: slot read for escaping values, folded sub-tree
    /// for non-escaping ones.
    fn build_operand(&self, value: &Value) -> Result<Expr, CodegenError> {
        match value {
            Value::Const { value, ty } => {
                Ok(Expr::Const { ty: register_width(*ty), value: *value })
            }
            Value::SsaRef(name) => {
                if self.param_slots.contains_key(name) || self.locals.has_slot(name) {
                    return Ok(Expr::LoadSlot {
                        ty: self.register_type(name)?,
                        slot: self.slot_of(name)?,
                    });
                }
                let def = self
                    .def_map
                    .get(name)
                    .ok_or_else(|| self.err(format!("no definition for {name}")))?;
                self.build_value_tree(def)
            }
            Value::Undef(ty) => Ok(Expr::Const { ty: register_width(*ty), value: 0 }),
            Value::Null => Ok(Expr::Const { ty: VmType::Ref, value: 0 }),
            Value::GlobalRef(name) => {
                Err(self.err(format!("global @{name} used as a plain operand")))
            }
            Value::InlineGep(gep) => Err(self.err(format!(
                "address of @{} used as a plain operand",
                gep.root_global()
            ))),
        }
    }

    fn build_typed_operand(&self, value: &Value, expected: VmType) -> Result<Expr, CodegenError> {
        match value {
            Value::Const { value, .. } => Ok(Expr::Const { ty: expected, value: *value }),
            Value::Undef(_) => Ok(Expr::Const { ty: expected, value: 0 }),
            _ => {
                let operand = self.build_operand(value)?;
                self.coerce(operand, expected)
            }
        }
    }

    /// Insert the exact cast node when widths disagree.
    fn coerce(&self, operand: Expr, target: VmType) -> Result<Expr, CodegenError> {
        let source = operand.ty();
        if source == target || source == VmType::Void {
            return Ok(operand);
        }
        let kind = match (source, target) {
            (VmType::Int, VmType::Short) => CastKind::I2S,
            (VmType::Int, VmType::Byte) => CastKind::I2B,
            (VmType::Short, VmType::Byte) => CastKind::S2B,
            (VmType::Short, VmType::Int) => CastKind::S2I,
            (VmType::Byte, VmType::Short) => CastKind::B2S,
            (VmType::Byte, VmType::Int) => CastKind::B2I,
            _ => return Err(self.err(format!("cannot convert {source} to {target}"))),
        };
        Ok(Expr::Cast { ty: target, kind, operand: Box::new(operand) })
    }

    fn build_binary(
        &self,
        result: &ValueName,
        op: BinaryOp,
        lhs: &Value,
        rhs: &Value,
    ) -> Result<Expr, CodegenError> {
        let ty = self.register_type(result)?;

        // `sub 0, x` is negation; the VM has a dedicated instruction.
        if op == BinaryOp::Sub {
            if let Value::Const { value: 0, .. } = lhs {
                let operand = self.build_typed_operand(rhs, ty)?;
                return Ok(Expr::Neg { ty, operand: Box::new(operand) });
            }
        }

        Ok(Expr::Binary {
            ty,
            op,
            lhs: Box::new(self.build_typed_operand(lhs, ty)?),
            rhs: Box::new(self.build_typed_operand(rhs, ty)?),
        })
    }

    fn build_load(&self, result: &ValueName, ty: VmType, addr: &Value) -> Result<Expr, CodegenError> {
        let reg_ty = self.register_type(result)?;
        let (array, offset, element) = self.resolve_addr(addr)?;
        if ty != element {
            return Err(self.err(format!(
                "load of {ty} from a {element} array at {addr}"
            )));
        }
        Ok(Expr::ArrayLoad { ty: reg_ty, array, offset: Box::new(offset), element })
    }

    fn build_store(&self, ty: VmType, value: &Value, addr: &Value) -> Result<Expr, CodegenError> {
        let (array, offset, element) = self.resolve_addr(addr)?;
        if ty != element {
            return Err(self.err(format!(
                "store of {ty} into a {element} array at {addr}"
            )));
        }
        let value = self.build_typed_operand(value, register_width(element))?;
        Ok(Expr::ArrayStore {
            array,
            offset: Box::new(offset),
            value: Box::new(value),
            element,
        })
    }

    fn build_cast(
        &self,
        result: &ValueName,
        op: CastOp,
        from_ty: VmType,
        value: &Value,
    ) -> Result<Expr, CodegenError> {
        let eff_to = self.register_type(result)?;
        // The source may itself be narrowed; use its register type.
        let eff_from = match value.as_ssa().and_then(|n| self.locals.register_type(n)) {
            Some(ty) => ty,
            None => register_width(from_ty),
        };
        let operand = self.build_typed_operand(value, eff_from)?;

        // zext from byte must mask even when both registers are short:
        // byte array loads sign-extend, zext requires unsigned bits.
        if op == CastOp::Zext && from_ty == VmType::Byte {
            let kind = self
                .cast_kind(VmType::Byte, eff_to, op)?
                .unwrap_or(CastKind::ZextB2S);
            return Ok(Expr::Cast { ty: eff_to, kind, operand: Box::new(operand) });
        }

        match self.cast_kind(eff_from, eff_to, op)? {
            Some(kind) => Ok(Expr::Cast { ty: eff_to, kind, operand: Box::new(operand) }),
            None => Ok(operand),
        }
    }

    /// Cast node for a conversion; `None` when it is a register no-op.
    fn cast_kind(
        &self,
        from: VmType,
        to: VmType,
        op: CastOp,
    ) -> Result<Option<CastKind>, CodegenError> {
        if from == VmType::Long || to == VmType::Long {
            return Err(self.err(format!("64-bit cast {from} -> {to} reached tree building")));
        }
        if from == to {
            return Ok(None);
        }
        if op == CastOp::Bitcast {
            return Ok(Some(CastKind::Bitcast));
        }
        Ok(match (from, to) {
            (VmType::Short, VmType::Byte) => Some(CastKind::S2B),
            (VmType::Short, VmType::Int) if op == CastOp::Zext => Some(CastKind::ZextS2I),
            (VmType::Short, VmType::Int) => Some(CastKind::S2I),
            (VmType::Int, VmType::Byte) => Some(CastKind::I2B),
            (VmType::Int, VmType::Short) => Some(CastKind::I2S),
            (VmType::Byte, VmType::Short) if op == CastOp::Zext => Some(CastKind::ZextB2S),
            (VmType::Byte, VmType::Short) => Some(CastKind::B2S),
            (VmType::Byte, VmType::Int) if op == CastOp::Zext => Some(CastKind::ZextB2I),
            (VmType::Byte, VmType::Int) => Some(CastKind::B2I),
            // Reference casts never change representation.
            (VmType::Ref, _) | (_, VmType::Ref) => None,
            _ => None,
        })
    }

    // === Calls ===

    fn build_call_root(&self, inst: &Inst) -> Result<Expr, CodegenError> {
        let call = self.build_call_expr(inst)?;
        if let Inst::Call { result: Some(result), .. } = inst {
            if self.locals.has_slot(result) {
                let slot = self.slot_of(result)?;
                let ty = self.register_type(result)?;
                let call = self.coerce(call, ty)?;
                return Ok(Expr::StoreSlot { ty, slot, value: Box::new(call) });
            }
        }
        Ok(Expr::CallStmt { call: Box::new(call) })
    }

    fn build_call_expr(&self, inst: &Inst) -> Result<Expr, CodegenError> {
        let (ty, callee, args) = match inst {
            Inst::Call { ty, callee, args, .. } => (*ty, callee, args),
            _ => return Err(self.err(format!("not a call: {inst}"))),
        };

        if let Some(method) = self.registry.lookup(callee) {
            let args = self.build_api_args(args)?;
            return Ok(Expr::ApiCall {
                ty: method.return_type,
                method: method.clone(),
                args,
            });
        }

        if let Some(&cp) = self.user_method_cp.get(callee) {
            let args = args
                .iter()
                .map(|a| self.build_operand(a))
                .collect::<Result<Vec<_>, _>>()?;
            let arg_slots = args.iter().map(|a| a.ty().slots()).sum();
            return Ok(Expr::UserCall { ty, target: callee.clone(), cp, arg_slots, args });
        }

        Err(self.err(format!("unknown callee @{callee}")))
    }

    /// API arguments, with global-pointer pairs collapsed.
    ///
    /// A `GlobalRef` argument means an array is passed to the platform. The
    /// target passes arrays as `(array_ref, offset)` pairs, so the global
    /// resolves to its region array and its region offset folds into the
    /// following offset argument.
    fn build_api_args(&self, args: &[Value]) -> Result<Vec<Expr>, CodegenError> {
        let mut built = Vec::with_capacity(args.len());
        let mut pending_offset: Option<Expr> = None;

        for arg in args {
            if let Value::GlobalRef(name) = arg {
                let (region, offset) = self.resolve_global_base(name)?;
                built.push(Expr::StaticRef { cp: self.region_cp_of(region)? });
                pending_offset = Some(Expr::Const { ty: VmType::Short, value: offset as i64 });
                continue;
            }
            if let Some(base) = pending_offset.take() {
                let sub = self.build_typed_operand(arg, VmType::Short)?;
                built.push(add_offsets(base, sub));
                continue;
            }
            built.push(self.build_operand(arg)?);
        }

        if pending_offset.is_some() {
            return Err(self.err("array argument without a following offset argument"));
        }
        Ok(built)
    }

    // === Terminators ===

    fn build_terminator(&self, inst: &Inst) -> Result<Expr, CodegenError> {
        match inst {
            Inst::Br { target } => Ok(Expr::Branch { target: target.clone() }),
            Inst::CondBr { cond, then_label, else_label } => Ok(Expr::CondBranch {
                cond: Box::new(self.build_typed_operand(cond, VmType::Short)?),
                then_label: then_label.clone(),
                else_label: else_label.clone(),
            }),
            Inst::Ret { ty, value } => match value {
                None => Ok(Expr::Return { ty: VmType::Void, value: None }),
                Some(value) => {
                    let reg_ty = register_width(*ty);
                    let value = self.build_typed_operand(value, reg_ty)?;
                    Ok(Expr::Return { ty: reg_ty, value: Some(Box::new(value)) })
                }
            },
            Inst::Switch { value, ty, default, cases } => {
                let reg_ty = register_width(*ty);
                Ok(Expr::Switch {
                    ty: reg_ty,
                    value: Box::new(self.build_typed_operand(value, reg_ty)?),
                    default: default.clone(),
                    cases: cases.clone(),
                })
            }
            Inst::Unreachable => Ok(Expr::Unreachable),
            _ => Err(self.err(format!("not a terminator: {inst}"))),
        }
    }

    // === Pointer resolution ===

    fn region_cp_of(&self, region: MemRegion) -> Result<u16, CodegenError> {
        self.region_cp
            .get(&region)
            .copied()
            .ok_or_else(|| self.err(format!("no constant pool entry for {} region", region.name())))
    }

    fn region_array(&self, region: MemRegion) -> Result<ArrayRef, CodegenError> {
        Ok(ArrayRef::Static { cp: self.region_cp_of(region)? })
    }

    /// Region and region offset of a global's first element.
    fn resolve_global_base(&self, name: &str) -> Result<(MemRegion, u32), CodegenError> {
        if let Some(info) = self.allocation.global(name) {
            return Ok((info.region, info.offset));
        }
        if let Some(st) = self.allocation.struct_global(name) {
            // Pointer to a struct is a pointer to its first field's column.
            let field = st
                .fields
                .first()
                .ok_or_else(|| self.err(format!("struct @{name} has no fields")))?;
            return Ok((field.region, field.offset));
        }
        Err(self.err(format!("unknown global @{name}")))
    }

    /// Resolve a pointer value to `(array, offset expression, element type)`.
    fn resolve_addr(&self, addr: &Value) -> Result<(ArrayRef, Expr, VmType), CodegenError> {
        match addr {
            Value::GlobalRef(name) => {
                let (region, offset) = self.resolve_global_base(name)?;
                Ok((
                    self.region_array(region)?,
                    Expr::Const { ty: VmType::Short, value: offset as i64 },
                    region.element_type(),
                ))
            }
            Value::InlineGep(gep) => self.resolve_inline_gep(gep),
            Value::SsaRef(name) => {
                if let Some(def) = self.def_map.get(name) {
                    match def {
                        Inst::Gep { base, indices, source, .. } => {
                            return self.resolve_gep(base, indices, source)
                        }
                        Inst::Select { cond, then_val, else_val, .. } => {
                            return self.resolve_select_addr(cond, then_val, else_val)
                        }
                        Inst::Call { .. } => {
                            // Platform call returning an external byte array.
                            let slot = self.slot_of(name)?;
                            return Ok((
                                ArrayRef::Slot { slot },
                                Expr::Const { ty: VmType::Short, value: 0 },
                                VmType::Byte,
                            ));
                        }
                        _ => {}
                    }
                }
                if self.is_ref_param(name) {
                    let slot = self.slot_of(name)?;
                    return Ok((
                        ArrayRef::Slot { slot },
                        Expr::Const { ty: VmType::Short, value: 0 },
                        VmType::Byte,
                    ));
                }
                Err(self.err(format!("cannot resolve pointer {name}")))
            }
            _ => Err(self.err(format!("cannot resolve pointer {addr}"))),
        }
    }

    fn is_ref_param(&self, name: &ValueName) -> bool {
        self.func
            .params
            .iter()
            .any(|p| p.name == *name && p.ty == VmType::Ref)
    }

    /// Select between two resolvable pointers in the same region.
    fn resolve_select_addr(
        &self,
        cond: &Value,
        then_val: &Value,
        else_val: &Value,
    ) -> Result<(ArrayRef, Expr, VmType), CodegenError> {
        let (then_arr, then_off, then_elem) = self.resolve_addr(then_val)?;
        let (else_arr, else_off, else_elem) = self.resolve_addr(else_val)?;
        if then_arr != else_arr || then_elem != else_elem {
            return Err(self.err("select between pointers into different arrays"));
        }
        let cond = self.build_typed_operand(cond, VmType::Short)?;
        let offset = Expr::Select {
            ty: VmType::Short,
            cond: Box::new(cond),
            then_val: Box::new(then_off),
            else_val: Box::new(else_off),
        };
        Ok((then_arr, offset, then_elem))
    }

    fn resolve_gep(
        &self,
        base: &Value,
        indices: &[Value],
        source: &GepSource,
    ) -> Result<(ArrayRef, Expr, VmType), CodegenError> {
        match source {
            GepSource::Array { .. } => self.resolve_array_gep(base, indices),
            GepSource::Struct { .. } => self.resolve_struct_gep(base, indices),
            GepSource::Byte => self.resolve_byte_gep(base, indices),
        }
    }

    /// Element-addressed GEP on an array of scalars or an external array.
    fn resolve_array_gep(
        &self,
        base: &Value,
        indices: &[Value],
    ) -> Result<(ArrayRef, Expr, VmType), CodegenError> {
        // `[i]` addresses elements directly; `[0, i]` first derefs the
        // array pointer. Both land on element i.
        let index = match indices {
            [i] => i,
            [Value::Const { value: 0, .. }, i] => i,
            _ => return Err(self.err(format!("unsupported gep index shape on {base}"))),
        };
        let idx = self.build_typed_operand(index, VmType::Short)?;

        match base {
            Value::GlobalRef(name) => {
                if let Some(info) = self.allocation.global(name) {
                    let base_off = Expr::Const { ty: VmType::Short, value: info.offset as i64 };
                    return Ok((
                        self.region_array(info.region)?,
                        add_offsets(base_off, idx),
                        info.region.element_type(),
                    ));
                }
                Err(self.err(format!("gep on unknown global @{name}")))
            }
            Value::SsaRef(inner) => {
                // Chained GEP: resolve the inner pointer, add this index.
                if let Some(Inst::Gep { base, indices, source, .. }) = self.def_map.get(inner) {
                    let (array, base_off, elem) = self.resolve_gep(base, indices, source)?;
                    return Ok((array, add_offsets(base_off, idx), elem));
                }
                // External byte array held in a slot (parameter or call result).
                if self.is_ref_param(inner) || self.locals.register_type(inner) == Some(VmType::Ref)
                {
                    let slot = self.slot_of(inner)?;
                    return Ok((ArrayRef::Slot { slot }, idx, VmType::Byte));
                }
                Err(self.err(format!("cannot resolve gep base {inner}")))
            }
            _ => Err(self.err(format!("cannot resolve gep base {base}"))),
        }
    }

    /// GEP on an array of structs: `(instance, field, [element])`.
    ///
    /// The field index must be constant; the column layout has no single
    /// address for "field number i of instance j" otherwise.
    fn resolve_struct_gep(
        &self,
        base: &Value,
        indices: &[Value],
    ) -> Result<(ArrayRef, Expr, VmType), CodegenError> {
        let name = match base {
            Value::GlobalRef(name) => name,
            _ => return Err(self.err(format!("struct gep base is not a global: {base}"))),
        };
        let st = self
            .allocation
            .struct_global(name)
            .ok_or_else(|| self.err(format!("gep on unknown struct @{name}")))?;

        let (instance, rest) = indices
            .split_first()
            .ok_or_else(|| self.err(format!("struct gep on @{name} has no instance index")))?;

        let field_idx = match rest.first() {
            None => 0,
            Some(Value::Const { value, .. }) => *value as usize,
            Some(other) => {
                return Err(self.err(format!("dynamic field index {other} on struct @{name}")))
            }
        };
        let field = st.fields.get(field_idx).ok_or_else(|| {
            self.err(format!("field index {field_idx} out of range on struct @{name}"))
        })?;

        // offset = field.offset + instance * elem_count (+ element)
        let instance = self.build_typed_operand(instance, VmType::Short)?;
        let scaled = scale_offset(instance, field.elem_count as i64);
        let mut offset = add_offsets(
            Expr::Const { ty: VmType::Short, value: field.offset as i64 },
            scaled,
        );
        if let Some(element) = rest.get(1) {
            let element = self.build_typed_operand(element, VmType::Short)?;
            offset = add_offsets(offset, element);
        }

        Ok((self.region_array(field.region)?, offset, field.ty))
    }

    /// Byte-addressed GEP, the front end's raw-offset form.
    fn resolve_byte_gep(
        &self,
        base: &Value,
        indices: &[Value],
    ) -> Result<(ArrayRef, Expr, VmType), CodegenError> {
        let index = match indices {
            [i] => i,
            _ => return Err(self.err(format!("byte gep on {base} needs a single index"))),
        };

        match base {
            Value::GlobalRef(name) => {
                if let Some(info) = self.allocation.global(name) {
                    let elem_size = info.region.element_type().byte_size() as i64;
                    let offset = match index {
                        Value::Const { value, .. } => {
                            if value % elem_size != 0 {
                                return Err(self.err(format!(
                                    "unaligned byte offset {value} into @{name}"
                                )));
                            }
                            Expr::Const {
                                ty: VmType::Short,
                                value: info.offset as i64 + value / elem_size,
                            }
                        }
                        _ if elem_size == 1 => {
                            let idx = self.build_typed_operand(index, VmType::Short)?;
                            add_offsets(
                                Expr::Const { ty: VmType::Short, value: info.offset as i64 },
                                idx,
                            )
                        }
                        _ => {
                            return Err(self.err(format!(
                                "dynamic byte offset into {} array @{name}",
                                info.region.element_type()
                            )))
                        }
                    };
                    return Ok((
                        self.region_array(info.region)?,
                        offset,
                        info.region.element_type(),
                    ));
                }
                if let Some(st) = self.allocation.struct_global(name) {
                    let bytes = match index {
                        Value::Const { value, .. } => *value as u32,
                        _ => {
                            return Err(self.err(format!(
                                "dynamic byte offset into struct @{name}"
                            )))
                        }
                    };
                    return self.resolve_struct_byte_offset(name, st, bytes, None);
                }
                Err(self.err(format!("byte gep on unknown global @{name}")))
            }
            Value::SsaRef(inner) => {
                // Chained onto a struct-instance pointer: the byte offset
                // selects the field within that instance.
                if let Some(Inst::Gep { base: inner_base, indices: inner_idx, source, .. }) =
                    self.def_map.get(inner)
                {
                    if let GepSource::Struct { .. } = source {
                        let name = match inner_base {
                            Value::GlobalRef(name) => name,
                            _ => {
                                return Err(
                                    self.err(format!("struct gep base is not a global: {inner_base}"))
                                )
                            }
                        };
                        let st = self.allocation.struct_global(name).ok_or_else(|| {
                            self.err(format!("gep on unknown struct @{name}"))
                        })?;
                        let bytes = match index {
                            Value::Const { value, .. } => *value as u32,
                            _ => {
                                return Err(self.err(format!(
                                    "dynamic byte offset into struct @{name}"
                                )))
                            }
                        };
                        let instance = inner_idx.first().ok_or_else(|| {
                            self.err(format!("struct gep on @{name} has no instance index"))
                        })?;
                        let instance = self.build_typed_operand(instance, VmType::Short)?;
                        return self.resolve_struct_byte_offset(name, st, bytes, Some(instance));
                    }
                    // Chained byte GEPs on plain arrays accumulate offsets.
                    let (array, base_off, elem) =
                        self.resolve_addr(&Value::SsaRef(inner.clone()))?;
                    let idx = self.build_typed_operand(index, VmType::Short)?;
                    if elem != VmType::Byte {
                        return Err(self.err(format!(
                            "dynamic byte offset into {elem} array via {inner}"
                        )));
                    }
                    return Ok((array, add_offsets(base_off, idx), elem));
                }
                // Byte offset into an external byte array.
                if self.is_ref_param(inner) || self.locals.register_type(inner) == Some(VmType::Ref)
                {
                    let slot = self.slot_of(inner)?;
                    let idx = self.build_typed_operand(index, VmType::Short)?;
                    return Ok((ArrayRef::Slot { slot }, idx, VmType::Byte));
                }
                Err(self.err(format!("cannot resolve byte gep base {inner}")))
            }
            _ => Err(self.err(format!("cannot resolve byte gep base {base}"))),
        }
    }

    /// Map a byte offset into a struct (array) onto its field column.
    ///
    /// Without an instance expression the offset is absolute over the whole
    /// array (`total = instance * stride + field_offset`); with one, it is
    /// relative to that instance.
    fn resolve_struct_byte_offset(
        &self,
        name: &str,
        st: &AllocatedStruct,
        bytes: u32,
        instance: Option<Expr>,
    ) -> Result<(ArrayRef, Expr, VmType), CodegenError> {
        let (field, const_instance, in_instance) = match instance {
            Some(_) => {
                let field = st.field_at_byte_offset(bytes).ok_or_else(|| {
                    self.err(format!("byte offset {bytes} lands in padding of @{name}"))
                })?;
                (field, 0, bytes)
            }
            None => {
                let (field, index) = st.decompose_byte_offset(bytes).ok_or_else(|| {
                    self.err(format!("byte offset {bytes} lands outside @{name}"))
                })?;
                (field, index, bytes % st.stride)
            }
        };
        let elem_in_field = (in_instance - field.byte_offset) / field.ty.byte_size();

        let base = field.offset + const_instance * field.elem_count + elem_in_field;
        let offset = match instance {
            Some(instance) => add_offsets(
                Expr::Const { ty: VmType::Short, value: base as i64 },
                scale_offset(instance, field.elem_count as i64),
            ),
            None => Expr::Const { ty: VmType::Short, value: base as i64 },
        };
        Ok((self.region_array(field.region)?, offset, field.ty))
    }

    fn resolve_inline_gep(&self, gep: &InlineGep) -> Result<(ArrayRef, Expr, VmType), CodegenError> {
        let name = gep.root_global();
        let bytes = total_byte_offset(gep)
            .ok_or_else(|| self.err(format!("non-constant inline gep on @{name}")))?;

        if let Some(info) = self.allocation.global(name) {
            let elem_size = info.region.element_type().byte_size() as i64;
            if bytes % elem_size != 0 {
                return Err(self.err(format!("unaligned byte offset {bytes} into @{name}")));
            }
            return Ok((
                self.region_array(info.region)?,
                Expr::Const {
                    ty: VmType::Short,
                    value: info.offset as i64 + bytes / elem_size,
                },
                info.region.element_type(),
            ));
        }
        if let Some(st) = self.allocation.struct_global(name) {
            return self.resolve_struct_byte_offset(name, st, bytes as u32, None);
        }
        Err(self.err(format!("inline gep on unknown global @{name}")))
    }
}

fn is_pointer_value(value: &Value) -> bool {
    matches!(value, Value::GlobalRef(_) | Value::InlineGep(_))
}

/// Byte registers do not exist; byte values compute in short registers.
pub(crate) fn register_width(ty: VmType) -> VmType {
    if ty == VmType::Byte {
        VmType::Short
    } else {
        ty
    }
}

/// Total constant byte offset of an inline GEP chain, if every level has one.
fn total_byte_offset(gep: &InlineGep) -> Option<i64> {
    let mut total = gep.byte_offset()?;
    let mut base = &gep.base;
    while let opal_ir::GepBase::Gep(inner) = base {
        total += inner.byte_offset()?;
        base = &inner.base;
    }
    Some(total)
}

/// Sum two offset expressions, folding constants and dropping zeros.
fn add_offsets(lhs: Expr, rhs: Expr) -> Expr {
    match (lhs.const_value(), rhs.const_value()) {
        (Some(a), Some(b)) => Expr::Const { ty: VmType::Short, value: a + b },
        (Some(0), None) => rhs,
        (None, Some(0)) => lhs,
        _ => Expr::Binary {
            ty: VmType::Short,
            op: BinaryOp::Add,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    }
}

/// Scale an index by a constant factor, folding and skipping factor 1.
fn scale_offset(index: Expr, factor: i64) -> Expr {
    if factor == 1 {
        return index;
    }
    match index.const_value() {
        Some(v) => Expr::Const { ty: VmType::Short, value: v * factor },
        None => Expr::Binary {
            ty: VmType::Short,
            op: BinaryOp::Mul,
            lhs: Box::new(index),
            rhs: Box::new(Expr::Const { ty: VmType::Short, value: factor }),
        },
    }
}
