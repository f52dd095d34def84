//! Escape analysis: which values need a durable local slot.
//!
//! The operand stack does not persist across block boundaries, and phi
//! moves need stable reads of both ends. A value escapes when it is used
//! outside its defining block, used more than once, is a call result with
//! uses, or participates in a phi (result or source). Everything else folds
//! into its single consumer as a sub-expression.
//!
//! GEP results never escape: address expressions are always re-inlined at
//! their use site, and giving them slots would block liveness tracing
//! through to their actual operands.

use rustc_hash::{FxHashMap, FxHashSet};

use opal_ir::{BlockLabel, Function, Inst, ValueName};

use crate::phi::PhiInfo;

/// Result of escape analysis.
#[derive(Debug, Clone)]
pub struct EscapeInfo {
    /// Values needing local slots.
    pub escaping: FxHashSet<ValueName>,
    /// Total use count per value, for allocation heuristics.
    pub use_counts: FxHashMap<ValueName, u32>,
    /// Why each value escapes.
    pub reasons: FxHashMap<ValueName, String>,
}

impl EscapeInfo {
    pub fn needs_slot(&self, name: &ValueName) -> bool {
        self.escaping.contains(name)
    }
}

/// Determine which values of `func` need local slots.
pub fn analyze_escapes(func: &Function, phi_info: &PhiInfo) -> EscapeInfo {
    let mut escaping: FxHashSet<ValueName> = FxHashSet::default();
    let mut reasons: FxHashMap<ValueName, String> = FxHashMap::default();
    let mut use_counts: FxHashMap<ValueName, u32> = FxHashMap::default();

    let mut def_block: FxHashMap<&ValueName, &BlockLabel> = FxHashMap::default();
    let mut def_inst: FxHashMap<&ValueName, &Inst> = FxHashMap::default();
    let mut gep_names: FxHashSet<&ValueName> = FxHashSet::default();
    for block in &func.blocks {
        for inst in &block.instrs {
            if let Some(result) = inst.result() {
                def_block.insert(result, &block.label);
                def_inst.insert(result, inst);
                if matches!(inst, Inst::Gep { .. }) {
                    gep_names.insert(result);
                }
            }
        }
    }
    let entry_label = &func.entry_block().label;
    for param in &func.params {
        def_block.insert(&param.name, entry_label);
    }

    // Cross-block uses and use counts.
    for block in &func.blocks {
        for inst in &block.instrs {
            for operand in inst.operands() {
                let Some(name) = operand.as_ssa() else { continue };
                *use_counts.entry(name.clone()).or_insert(0) += 1;

                if let Some(&def) = def_block.get(name) {
                    if def != &block.label
                        && !escaping.contains(name)
                        && !gep_names.contains(name)
                    {
                        escaping.insert(name.clone());
                        reasons
                            .insert(name.clone(), format!("used in {}, defined in {def}", block.label));
                    }
                }
            }
        }
    }

    // Multi-use values escape: re-evaluating a folded tree at each use
    // site would duplicate any side effects inside it.
    for (name, &count) in &use_counts {
        if count > 1 && !escaping.contains(name) && !gep_names.contains(name) {
            escaping.insert(name.clone());
            reasons.insert(name.clone(), "multi-use".into());
        }
    }

    // Call results with uses escape: calls are emitted as roots for their
    // side effects, so a folded result would re-emit the call at its use.
    for (name, &count) in &use_counts {
        if count >= 1 && !escaping.contains(name) {
            if matches!(def_inst.get(name), Some(Inst::Call { .. })) {
                escaping.insert(name.clone());
                reasons.insert(name.clone(), "call result".into());
            }
        }
    }

    // Phi results and SSA phi sources escape. Cross-block detection catches
    // most sources, but a self-loop's source is defined and used in the
    // same block.
    for phi_name in phi_info.phi_names() {
        if !escaping.contains(phi_name) {
            escaping.insert(phi_name.clone());
            reasons.insert(phi_name.clone(), "phi result".into());
        }
        let Some(sources) = phi_info.sources(phi_name) else { continue };
        for source in sources {
            let Some(src_name) = source.value.as_ssa() else { continue };
            if !escaping.contains(src_name) && !gep_names.contains(src_name) {
                escaping.insert(src_name.clone());
                reasons.insert(src_name.clone(), format!("phi source for {phi_name}"));
            }
        }
    }

    EscapeInfo { escaping, use_counts, reasons }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phi::analyze_phis;
    use opal_ir::{BinaryOp, Block, Param, Value, VmType};

    fn add(result: &str, lhs: Value, rhs: Value) -> Inst {
        Inst::Binary {
            result: result.into(),
            op: BinaryOp::Add,
            ty: VmType::Short,
            lhs,
            rhs,
            range: None,
        }
    }

    #[test]
    fn single_use_same_block_does_not_escape() {
        let func = Function {
            name: "f".into(),
            params: vec![Param { name: "%x".into(), ty: VmType::Short }],
            return_type: VmType::Short,
            blocks: vec![Block::new(
                "entry",
                vec![
                    add("%y", Value::ssa("%x"), Value::const_short(1)),
                    Inst::Ret { ty: VmType::Short, value: Some(Value::ssa("%y")) },
                ],
            )],
        };
        let info = analyze_escapes(&func, &analyze_phis(&func));
        assert!(!info.needs_slot(&"%y".into()));
        assert!(!info.needs_slot(&"%x".into()));
    }

    #[test]
    fn multi_use_escapes() {
        let func = Function {
            name: "f".into(),
            params: vec![Param { name: "%x".into(), ty: VmType::Short }],
            return_type: VmType::Short,
            blocks: vec![Block::new(
                "entry",
                vec![
                    add("%y", Value::ssa("%x"), Value::const_short(1)),
                    add("%z", Value::ssa("%y"), Value::ssa("%y")),
                    Inst::Ret { ty: VmType::Short, value: Some(Value::ssa("%z")) },
                ],
            )],
        };
        let info = analyze_escapes(&func, &analyze_phis(&func));
        assert!(info.needs_slot(&"%y".into()));
        assert_eq!(info.reasons[&ValueName::from("%y")], "multi-use");
        assert_eq!(info.use_counts[&ValueName::from("%y")], 2);
    }

    #[test]
    fn cross_block_use_escapes() {
        let func = Function {
            name: "f".into(),
            params: vec![],
            return_type: VmType::Short,
            blocks: vec![
                Block::new(
                    "entry",
                    vec![
                        add("%y", Value::const_short(1), Value::const_short(2)),
                        Inst::Br { target: "exit".into() },
                    ],
                ),
                Block::new(
                    "exit",
                    vec![Inst::Ret { ty: VmType::Short, value: Some(Value::ssa("%y")) }],
                ),
            ],
        };
        let info = analyze_escapes(&func, &analyze_phis(&func));
        assert!(info.needs_slot(&"%y".into()));
    }

    #[test]
    fn used_call_result_escapes() {
        let func = Function {
            name: "f".into(),
            params: vec![],
            return_type: VmType::Short,
            blocks: vec![Block::new(
                "entry",
                vec![
                    Inst::Call {
                        result: Some("%r".into()),
                        ty: VmType::Short,
                        callee: "g".into(),
                        args: vec![],
                    },
                    Inst::Ret { ty: VmType::Short, value: Some(Value::ssa("%r")) },
                ],
            )],
        };
        let info = analyze_escapes(&func, &analyze_phis(&func));
        assert!(info.needs_slot(&"%r".into()));
        assert_eq!(info.reasons[&ValueName::from("%r")], "call result");
    }

    #[test]
    fn phi_result_and_sources_escape() {
        // 8.6 scenario: %y = add %x, 1; %z = phi [%x, entry], [%y, loop].
        let func = Function {
            name: "f".into(),
            params: vec![Param { name: "%x".into(), ty: VmType::Int }],
            return_type: VmType::Int,
            blocks: vec![
                Block::new("entry", vec![Inst::Br { target: "loop".into() }]),
                Block::new(
                    "loop",
                    vec![
                        Inst::Phi {
                            result: "%z".into(),
                            ty: VmType::Int,
                            sources: vec![
                                (Value::ssa("%x"), "entry".into()),
                                (Value::ssa("%y"), "loop".into()),
                            ],
                        },
                        Inst::Binary {
                            result: "%y".into(),
                            op: BinaryOp::Add,
                            ty: VmType::Int,
                            lhs: Value::ssa("%x"),
                            rhs: Value::const_int(1),
                            range: None,
                        },
                        Inst::Br { target: "loop".into() },
                    ],
                ),
            ],
        };
        let info = analyze_escapes(&func, &analyze_phis(&func));
        assert!(info.needs_slot(&"%x".into()));
        assert!(info.needs_slot(&"%y".into()));
        assert!(info.needs_slot(&"%z".into()));
    }
}
