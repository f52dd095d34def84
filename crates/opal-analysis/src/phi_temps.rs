//! Temp slot budget for parallel phi moves.
//!
//! Phis read all sources before any destination is written. A move set
//! like `%a := %b; %b := %a` clobbers a value if emitted naively, so the
//! emitter may route values through scratch slots. This phase computes a
//! per-type upper bound on how many scratch slots any single edge can
//! need (the non-coalesced slot-to-slot move count) and reserves that
//! many slots after the regular ones. Emission allocates from the
//! reservation on demand and usually uses far fewer.

use rustc_hash::FxHashMap;

use opal_ir::{Function, VmType};

use crate::color::SlotAssignments;
use crate::phi::PhiInfo;

/// Scratch slots reserved after the regular locals.
#[derive(Debug, Clone)]
pub struct TempSlots {
    /// Reserved slot count per move type.
    pub by_type: FxHashMap<VmType, u16>,
    pub first_temp_slot: u16,
    pub total: u16,
}

impl TempSlots {
    pub fn none(first_temp_slot: u16) -> Self {
        Self { by_type: FxHashMap::default(), first_temp_slot, total: 0 }
    }
}

/// Bound the scratch slots needed by any one edge's phi moves.
pub fn compute_phi_temps(
    func: &Function,
    phi_info: &PhiInfo,
    slots: &SlotAssignments,
) -> TempSlots {
    if phi_info.phi_names().next().is_none() {
        return TempSlots::none(slots.num_slots);
    }

    let mut max_by_type: FxHashMap<VmType, u16> = FxHashMap::default();

    for block in &func.blocks {
        for succ_label in block.successors() {
            let Some(succ) = func.block(succ_label.as_str()) else { continue };

            let mut edge_counts: FxHashMap<VmType, u16> = FxHashMap::default();
            for inst in succ.phi_instrs() {
                let Some(result) = inst.result() else { continue };
                let Some(dest_slot) = slots.slot_of(result) else { continue };

                let Ok(source) =
                    phi_info.source_for_block(&func.name, result, block.label.as_str())
                else {
                    continue;
                };
                // Constants load inline; only slot-to-slot moves that
                // actually change slots can conflict.
                let Some(src_name) = source.as_ssa() else { continue };
                let Some(src_slot) = slots.slot_of(src_name) else { continue };
                if src_slot == dest_slot {
                    continue;
                }

                let ty = move_type(slots, dest_slot);
                *edge_counts.entry(ty).or_insert(0) += ty.slots();
            }

            for (ty, count) in edge_counts {
                let max = max_by_type.entry(ty).or_insert(0);
                *max = (*max).max(count);
            }
        }
    }

    max_by_type.retain(|_, count| *count > 0);
    let total: u16 = max_by_type.values().sum();

    TempSlots { by_type: max_by_type, first_temp_slot: slots.num_slots, total }
}

/// Moves run through registers, where bytes widen to shorts.
fn move_type(slots: &SlotAssignments, dest_slot: u16) -> VmType {
    match slots.slot_types.get(&dest_slot) {
        Some(VmType::Byte) | Some(VmType::Short) | None => VmType::Short,
        Some(&ty) => ty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::{Block, Inst, Param, Value, ValueName, VmType};
    use rustc_hash::FxHashMap;

    fn swap_func() -> Function {
        Function {
            name: "f".into(),
            params: vec![
                Param { name: "%x".into(), ty: VmType::Short },
                Param { name: "%y".into(), ty: VmType::Short },
            ],
            return_type: VmType::Short,
            blocks: vec![
                Block::new("entry", vec![Inst::Br { target: "loop".into() }]),
                Block::new(
                    "loop",
                    vec![
                        Inst::Phi {
                            result: "%p".into(),
                            ty: VmType::Short,
                            sources: vec![
                                (Value::ssa("%x"), "entry".into()),
                                (Value::ssa("%q"), "loop".into()),
                            ],
                        },
                        Inst::Phi {
                            result: "%q".into(),
                            ty: VmType::Short,
                            sources: vec![
                                (Value::ssa("%y"), "entry".into()),
                                (Value::ssa("%p"), "loop".into()),
                            ],
                        },
                        Inst::Br { target: "loop".into() },
                    ],
                ),
            ],
        }
    }

    fn slots(pairs: &[(&str, u16, VmType)]) -> SlotAssignments {
        let mut assignments = FxHashMap::default();
        let mut slot_types = FxHashMap::default();
        let mut num_slots = 0u16;
        for (name, slot, ty) in pairs {
            assignments.insert(ValueName::from(*name), *slot);
            for offset in 0..ty.slots() {
                slot_types.insert(slot + offset, *ty);
            }
            num_slots = num_slots.max(slot + ty.slots());
        }
        SlotAssignments { assignments, slot_types, num_slots }
    }

    #[test]
    fn swap_edge_reserves_a_temp_per_move() {
        let func = swap_func();
        let phi_info = crate::phi::analyze_phis(&func);
        let slots = slots(&[
            ("%x", 0, VmType::Short),
            ("%y", 1, VmType::Short),
            ("%p", 2, VmType::Short),
            ("%q", 3, VmType::Short),
        ]);
        let temps = compute_phi_temps(&func, &phi_info, &slots);
        // loop->loop edge carries two non-coalesced short moves.
        assert_eq!(temps.by_type[&VmType::Short], 2);
        assert_eq!(temps.first_temp_slot, 4);
        assert_eq!(temps.total, 2);
    }

    #[test]
    fn coalesced_moves_need_no_temps() {
        // Loop-free: the only edge move is %x -> %p, coalesced onto slot 0.
        let func = Function {
            name: "f".into(),
            params: vec![Param { name: "%x".into(), ty: VmType::Short }],
            return_type: VmType::Short,
            blocks: vec![
                Block::new("entry", vec![Inst::Br { target: "join".into() }]),
                Block::new(
                    "join",
                    vec![
                        Inst::Phi {
                            result: "%p".into(),
                            ty: VmType::Short,
                            sources: vec![(Value::ssa("%x"), "entry".into())],
                        },
                        Inst::Ret { ty: VmType::Short, value: Some(Value::ssa("%p")) },
                    ],
                ),
            ],
        };
        let phi_info = crate::phi::analyze_phis(&func);
        let slots = slots(&[("%x", 0, VmType::Short), ("%p", 0, VmType::Short)]);
        let temps = compute_phi_temps(&func, &phi_info, &slots);
        assert_eq!(temps.total, 0);
        assert!(temps.by_type.is_empty());
    }

    #[test]
    fn no_phis_no_temps() {
        let func = Function {
            name: "f".into(),
            params: vec![],
            return_type: VmType::Void,
            blocks: vec![Block::new("entry", vec![Inst::Ret { ty: VmType::Void, value: None }])],
        };
        let phi_info = crate::phi::analyze_phis(&func);
        let slots = slots(&[]);
        let temps = compute_phi_temps(&func, &phi_info, &slots);
        assert_eq!(temps.total, 0);
        assert_eq!(temps.first_temp_slot, 0);
    }
}
