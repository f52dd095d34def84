//! Unified per-function local variable view for code generation.
//!
//! Combines the IR's declared types, narrowing results, and graph-coloring
//! slots into one queryable package. Two type vocabularies coexist:
//!
//! - value types: declared in the IR (byte, short, int, ref)
//! - register types: what local slots actually hold after narrowing and
//!   after byte-to-short promotion (the VM has no byte-width locals;
//!   `sload`/`sstore` and `sadd` serve both widths)
//!
//! The declared type survives for array access opcode selection and for
//! truncation at observation points.

use rustc_hash::FxHashMap;

use opal_common::{AnalysisError, Phase};
use opal_ir::{Function, ValueName, VmType};

use crate::color::SlotAssignments;
use crate::escape::EscapeInfo;
use crate::narrowing::NarrowingInfo;

#[derive(Debug, Clone)]
pub struct FunctionLocals {
    /// Declared IR type per value.
    pub value_types: FxHashMap<ValueName, VmType>,
    /// Slot type per value: narrowing applied, byte promoted to short.
    pub register_types: FxHashMap<ValueName, VmType>,
    pub slots: FxHashMap<ValueName, u16>,
    pub slot_types: FxHashMap<u16, VmType>,
    /// Where emission may claim scratch slots.
    pub first_temp_slot: u16,
}

impl FunctionLocals {
    fn validate(&self, func: &Function, escapes: &EscapeInfo) -> Result<(), AnalysisError> {
        for (name, ty) in &self.value_types {
            if *ty == VmType::Long {
                return Err(AnalysisError::new(
                    Phase::Locals,
                    &func.name,
                    format!("{name} is 64-bit; the target has no long support"),
                ));
            }
        }
        for name in &escapes.escaping {
            if !self.slots.contains_key(name) {
                return Err(AnalysisError::new(
                    Phase::Locals,
                    &func.name,
                    format!("escaping value {name} was never assigned a slot"),
                ));
            }
        }
        for (name, &slot) in &self.slots {
            let Some(&reg_ty) = self.register_types.get(name) else {
                return Err(AnalysisError::new(
                    Phase::Locals,
                    &func.name,
                    format!("{name} has a slot but no register type"),
                ));
            };
            for offset in 0..reg_ty.slots() {
                if !self.slot_types.contains_key(&(slot + offset)) {
                    return Err(AnalysisError::new(
                        Phase::Locals,
                        &func.name,
                        format!("slot {} (for {name}) has no type", slot + offset),
                    ));
                }
            }
            // Ref slots are invariant; numeric widths may share.
            let slot_ty = self.slot_types[&slot];
            if (reg_ty == VmType::Ref) != (slot_ty == VmType::Ref) {
                return Err(AnalysisError::new(
                    Phase::Locals,
                    &func.name,
                    format!("{name}: register type {reg_ty} against {slot_ty} slot"),
                ));
            }
        }
        Ok(())
    }

    pub fn value_type(&self, name: &ValueName) -> Option<VmType> {
        self.value_types.get(name).copied()
    }

    pub fn register_type(&self, name: &ValueName) -> Option<VmType> {
        self.register_types.get(name).copied()
    }

    pub fn slot_of(&self, name: &ValueName) -> Option<u16> {
        self.slots.get(name).copied()
    }

    pub fn has_slot(&self, name: &ValueName) -> bool {
        self.slots.contains_key(name)
    }
}

/// Assemble the codegen-facing locals view from the analysis results.
pub fn build_function_locals(
    func: &Function,
    narrowing: &NarrowingInfo,
    escapes: &EscapeInfo,
    slots: &SlotAssignments,
) -> Result<FunctionLocals, AnalysisError> {
    let value_types = collect_value_types(func);

    let mut register_types: FxHashMap<ValueName, VmType> = FxHashMap::default();
    for (name, &ty) in &value_types {
        let narrowed = narrowing.storage_type(name, ty);
        register_types.insert(name.clone(), to_register_type(narrowed));
    }

    let locals = FunctionLocals {
        value_types,
        register_types,
        slots: slots.assignments.clone(),
        slot_types: slots.slot_types.clone(),
        first_temp_slot: slots.num_slots,
    };
    locals.validate(func, escapes)?;
    Ok(locals)
}

fn to_register_type(ty: VmType) -> VmType {
    if ty == VmType::Byte {
        VmType::Short
    } else {
        ty
    }
}

fn collect_value_types(func: &Function) -> FxHashMap<ValueName, VmType> {
    let mut result = FxHashMap::default();
    for param in &func.params {
        result.insert(param.name.clone(), param.ty);
    }
    for block in &func.blocks {
        for inst in &block.instrs {
            if let (Some(name), Some(ty)) = (inst.result(), inst.result_type()) {
                result.insert(name.clone(), ty);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::analyze_escapes;
    use crate::narrowing::{analyze_narrowing, ParamNarrowing};
    use crate::phi::analyze_phis;
    use opal_ir::{BinaryOp, Block, Inst, Param, Value};

    fn build(func: &Function, slots: SlotAssignments) -> Result<FunctionLocals, AnalysisError> {
        let phi_info = analyze_phis(func);
        let escapes = analyze_escapes(func, &phi_info);
        let narrowing = analyze_narrowing(func, &ParamNarrowing::default()).unwrap();
        build_function_locals(func, &narrowing, &escapes, &slots)
    }

    fn simple_func() -> Function {
        Function {
            name: "f".into(),
            params: vec![Param { name: "%b".into(), ty: VmType::Byte }],
            return_type: VmType::Byte,
            blocks: vec![
                Block::new("entry", vec![Inst::Br { target: "exit".into() }]),
                Block::new(
                    "exit",
                    vec![
                        Inst::Binary {
                            result: "%r".into(),
                            op: BinaryOp::Add,
                            ty: VmType::Byte,
                            lhs: Value::ssa("%b"),
                            rhs: Value::const_short(1),
                            range: None,
                        },
                        Inst::Ret { ty: VmType::Byte, value: Some(Value::ssa("%r")) },
                    ],
                ),
            ],
        }
    }

    #[test]
    fn bytes_promote_to_short_registers() {
        let func = simple_func();
        let mut assignments = FxHashMap::default();
        assignments.insert(ValueName::from("%b"), 0u16);
        let mut slot_types = FxHashMap::default();
        slot_types.insert(0u16, VmType::Byte);
        let locals = build(
            &func,
            SlotAssignments { assignments, slot_types, num_slots: 1 },
        )
        .unwrap();
        assert_eq!(locals.value_type(&"%b".into()), Some(VmType::Byte));
        assert_eq!(locals.register_type(&"%b".into()), Some(VmType::Short));
        assert_eq!(locals.first_temp_slot, 1);
    }

    #[test]
    fn escaping_value_without_slot_is_rejected() {
        let func = simple_func();
        // %b escapes (cross-block use) but gets no slot.
        let err = build(
            &func,
            SlotAssignments {
                assignments: FxHashMap::default(),
                slot_types: FxHashMap::default(),
                num_slots: 0,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("never assigned a slot"));
    }

    #[test]
    fn long_values_are_rejected() {
        let func = Function {
            name: "f".into(),
            params: vec![Param { name: "%l".into(), ty: VmType::Long }],
            return_type: VmType::Void,
            blocks: vec![Block::new(
                "entry",
                vec![Inst::Ret { ty: VmType::Void, value: None }],
            )],
        };
        let phi_info = analyze_phis(&func);
        let escapes = analyze_escapes(&func, &phi_info);
        let narrowing = analyze_narrowing(&func, &ParamNarrowing::default()).unwrap();
        let err = build_function_locals(
            &func,
            &narrowing,
            &escapes,
            &SlotAssignments {
                assignments: FxHashMap::default(),
                slot_types: FxHashMap::default(),
                num_slots: 0,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("64-bit"));
    }
}
