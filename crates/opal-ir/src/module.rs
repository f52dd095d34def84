//! Blocks, functions, globals and the module container.
//!
//! IR objects are built once by the front end and treated as read-only by
//! every analysis. `Function::validate` re-checks the structural invariants
//! the analyses rely on (terminator placement, phi predecessor labels,
//! single definition per SSA name) so a front-end bug fails fast instead of
//! corrupting allocation.

use rustc_hash::{FxHashMap, FxHashSet};

use opal_common::{AnalysisError, Phase};

use crate::debug::DebugType;
use crate::instr::Inst;
use crate::types::{BlockLabel, ValueName, VmType};

/// Function parameter. Parameter slots are positional and immutable:
/// slot 0, then each previous slot plus the previous parameter's width.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: ValueName,
    pub ty: VmType,
}

/// A basic block: phis first, body, then exactly one terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub label: BlockLabel,
    pub instrs: Vec<Inst>,
}

impl Block {
    pub fn new(label: impl Into<String>, instrs: Vec<Inst>) -> Self {
        Self { label: BlockLabel::new(label), instrs }
    }

    /// The terminator (last instruction). Callers run after validation.
    pub fn terminator(&self) -> &Inst {
        self.instrs.last().expect("validated block has a terminator")
    }

    /// Leading phi instructions.
    pub fn phi_instrs(&self) -> impl Iterator<Item = &Inst> {
        self.instrs.iter().take_while(|i| i.is_phi())
    }

    /// Non-phi instructions including the terminator.
    pub fn body_instrs(&self) -> impl Iterator<Item = &Inst> {
        self.instrs.iter().skip_while(|i| i.is_phi())
    }

    pub fn successors(&self) -> Vec<&BlockLabel> {
        self.terminator().successor_labels()
    }
}

/// A function: ordered parameters, ordered blocks, entry block first.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: VmType,
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn block(&self, label: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.label.as_str() == label)
    }

    pub fn entry_block(&self) -> &Block {
        &self.blocks[0]
    }

    /// Fixed parameter slots: positional, widened by each parameter's type.
    pub fn param_slots(&self) -> FxHashMap<ValueName, u16> {
        let mut slots = FxHashMap::default();
        let mut next = 0u16;
        for param in &self.params {
            slots.insert(param.name.clone(), next);
            next += param.ty.slots();
        }
        slots
    }

    /// Total slots occupied by parameters.
    pub fn param_slot_count(&self) -> u16 {
        self.params.iter().map(|p| p.ty.slots()).sum()
    }

    /// Predecessor labels of each block.
    pub fn predecessors(&self) -> FxHashMap<&BlockLabel, Vec<&BlockLabel>> {
        let mut preds: FxHashMap<&BlockLabel, Vec<&BlockLabel>> =
            self.blocks.iter().map(|b| (&b.label, Vec::new())).collect();
        for block in &self.blocks {
            for succ in block.successors() {
                if let Some(entry) = preds.get_mut(succ) {
                    entry.push(&block.label);
                }
            }
        }
        preds
    }

    /// The instruction defining `name`, if any.
    pub fn def_of(&self, name: &ValueName) -> Option<&Inst> {
        self.blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .find(|i| i.result() == Some(name))
    }

    /// Re-check structural invariants: one terminator per block (last),
    /// phis lead their block, phi sources name genuine predecessors,
    /// every SSA name is defined exactly once, branch targets exist.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        let err = |msg: String| AnalysisError::new(Phase::IrValidation, &self.name, msg);

        if self.blocks.is_empty() {
            return Err(err("function has no blocks".into()));
        }

        // `Long` is a front-end marker only; width queries assume it is
        // gone, so it must die here rather than panic downstream.
        if self.return_type == VmType::Long {
            return Err(err("return type is 64-bit; the target has no long support".into()));
        }
        for param in &self.params {
            if param.ty == VmType::Long {
                return Err(err(format!(
                    "parameter {} is 64-bit; the target has no long support",
                    param.name
                )));
            }
        }
        for block in &self.blocks {
            for inst in &block.instrs {
                if inst.result_type() == Some(VmType::Long) {
                    return Err(err(format!(
                        "{inst} produces a 64-bit value; the target has no long support"
                    )));
                }
            }
        }

        let labels: FxHashSet<&str> = self.blocks.iter().map(|b| b.label.as_str()).collect();
        if labels.len() != self.blocks.len() {
            return Err(err("duplicate block label".into()));
        }

        for block in &self.blocks {
            match block.instrs.last() {
                Some(last) if last.is_terminator() => {}
                _ => return Err(err(format!("block {} has no terminator", block.label))),
            }
            for inst in &block.instrs[..block.instrs.len() - 1] {
                if inst.is_terminator() {
                    return Err(err(format!(
                        "block {} has a terminator before its end: {inst}",
                        block.label
                    )));
                }
            }
            let mut seen_non_phi = false;
            for inst in &block.instrs {
                if inst.is_phi() && seen_non_phi {
                    return Err(err(format!(
                        "block {}: phi after non-phi instruction",
                        block.label
                    )));
                }
                if !inst.is_phi() {
                    seen_non_phi = true;
                }
            }
            for succ in block.successors() {
                if !labels.contains(succ.as_str()) {
                    return Err(err(format!(
                        "block {} branches to unknown block {succ}",
                        block.label
                    )));
                }
            }
        }

        let preds = self.predecessors();
        for block in &self.blocks {
            let block_preds: FxHashSet<&str> = preds
                .get(&block.label)
                .map(|p| p.iter().map(|l| l.as_str()).collect())
                .unwrap_or_default();
            for inst in block.phi_instrs() {
                if let Inst::Phi { result, sources, .. } = inst {
                    for (_, label) in sources {
                        if !block_preds.contains(label.as_str()) {
                            return Err(err(format!(
                                "phi {result} in {} references {label} which is not a predecessor",
                                block.label
                            )));
                        }
                    }
                }
            }
        }

        let mut defined: FxHashSet<&ValueName> =
            self.params.iter().map(|p| &p.name).collect();
        for block in &self.blocks {
            for inst in &block.instrs {
                if let Some(result) = inst.result() {
                    if !defined.insert(result) {
                        return Err(err(format!("{result} is defined more than once")));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Global initializer.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalInit {
    /// All elements zero.
    Zero,
    /// Constant integer array with a declared element type.
    IntArray { values: Vec<i64>, elem: VmType },
    /// Constant byte string.
    ByteString(Vec<u8>),
    /// Constant array of structs, decomposed into per-field value columns.
    StructArray { field_types: Vec<VmType>, field_values: Vec<Vec<i64>>, count: u32 },
}

/// A module global: variable or constant with optional debug layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub is_constant: bool,
    pub initializer: Option<GlobalInit>,
    pub debug_type: Option<DebugType>,
}

/// A complete module: functions and globals in declaration order.
///
/// Declaration order matters — the call graph breaks topological ties by
/// it — so functions live in a `Vec` with a name index built alongside.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    func_index: FxHashMap<String, usize>,
    global_index: FxHashMap<String, usize>,
}

impl Module {
    pub fn new(name: impl Into<String>, functions: Vec<Function>, globals: Vec<Global>) -> Self {
        let func_index = functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        let global_index = globals
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.clone(), i))
            .collect();
        Self { name: name.into(), functions, globals, func_index, global_index }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.func_index.get(name).map(|&i| &self.functions[i])
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.global_index.get(name).map(|&i| &self.globals[i])
    }

    /// Validate every function's structural invariants, and that no
    /// global carries a 64-bit layout.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        for func in &self.functions {
            func.validate()?;
        }
        for global in &self.globals {
            let has_long = global
                .debug_type
                .as_ref()
                .is_some_and(DebugType::contains_long)
                || matches!(
                    global.initializer,
                    Some(GlobalInit::IntArray { elem: VmType::Long, .. })
                );
            if has_long {
                return Err(AnalysisError::new(
                    Phase::IrValidation,
                    &global.name,
                    "global is 64-bit; the target has no long support",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::BinaryOp;
    use crate::value::Value;

    fn ret_void() -> Inst {
        Inst::Ret { ty: VmType::Void, value: None }
    }

    fn short_param(name: &str) -> Param {
        Param { name: name.into(), ty: VmType::Short }
    }

    #[test]
    fn param_slots_are_positional_and_width_aware() {
        let func = Function {
            name: "f".into(),
            params: vec![
                short_param("%a"),
                Param { name: "%b".into(), ty: VmType::Int },
                short_param("%c"),
            ],
            return_type: VmType::Void,
            blocks: vec![Block::new("entry", vec![ret_void()])],
        };
        let slots = func.param_slots();
        assert_eq!(slots["%a"], 0);
        assert_eq!(slots["%b"], 1);
        assert_eq!(slots["%c"], 3);
        assert_eq!(func.param_slot_count(), 4);
    }

    #[test]
    fn validate_accepts_well_formed_function() {
        let func = Function {
            name: "f".into(),
            params: vec![short_param("%x")],
            return_type: VmType::Short,
            blocks: vec![
                Block::new(
                    "entry",
                    vec![
                        Inst::Binary {
                            result: "%y".into(),
                            op: BinaryOp::Add,
                            ty: VmType::Short,
                            lhs: Value::ssa("%x"),
                            rhs: Value::const_short(1),
                            range: None,
                        },
                        Inst::Br { target: "exit".into() },
                    ],
                ),
                Block::new(
                    "exit",
                    vec![Inst::Ret { ty: VmType::Short, value: Some(Value::ssa("%y")) }],
                ),
            ],
        };
        assert!(func.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_terminator() {
        let func = Function {
            name: "f".into(),
            params: vec![],
            return_type: VmType::Void,
            blocks: vec![Block::new(
                "entry",
                vec![Inst::Binary {
                    result: "%y".into(),
                    op: BinaryOp::Add,
                    ty: VmType::Short,
                    lhs: Value::const_short(1),
                    rhs: Value::const_short(2),
                    range: None,
                }],
            )],
        };
        let err = func.validate().unwrap_err();
        assert!(err.to_string().contains("no terminator"), "{err}");
    }

    #[test]
    fn validate_rejects_phi_from_non_predecessor() {
        let func = Function {
            name: "f".into(),
            params: vec![],
            return_type: VmType::Void,
            blocks: vec![
                Block::new("entry", vec![Inst::Br { target: "next".into() }]),
                Block::new(
                    "next",
                    vec![
                        Inst::Phi {
                            result: "%p".into(),
                            ty: VmType::Short,
                            sources: vec![(Value::const_short(0), "elsewhere".into())],
                        },
                        ret_void(),
                    ],
                ),
                Block::new("elsewhere", vec![ret_void()]),
            ],
        };
        let err = func.validate().unwrap_err();
        assert!(err.to_string().contains("not a predecessor"), "{err}");
    }

    #[test]
    fn validate_rejects_double_definition() {
        let def = Inst::Binary {
            result: "%y".into(),
            op: BinaryOp::Add,
            ty: VmType::Short,
            lhs: Value::const_short(1),
            rhs: Value::const_short(2),
            range: None,
        };
        let func = Function {
            name: "f".into(),
            params: vec![],
            return_type: VmType::Void,
            blocks: vec![Block::new("entry", vec![def.clone(), def, ret_void()])],
        };
        let err = func.validate().unwrap_err();
        assert!(err.to_string().contains("defined more than once"), "{err}");
    }

    #[test]
    fn validate_rejects_long_params_and_results() {
        let func = Function {
            name: "f".into(),
            params: vec![Param { name: "%l".into(), ty: VmType::Long }],
            return_type: VmType::Void,
            blocks: vec![Block::new("entry", vec![ret_void()])],
        };
        let err = func.validate().unwrap_err();
        assert!(err.to_string().contains("64-bit"), "{err}");

        let func = Function {
            name: "g".into(),
            params: vec![],
            return_type: VmType::Void,
            blocks: vec![Block::new(
                "entry",
                vec![
                    Inst::Binary {
                        result: "%w".into(),
                        op: BinaryOp::Add,
                        ty: VmType::Long,
                        lhs: Value::const_int(1),
                        rhs: Value::const_int(2),
                        range: None,
                    },
                    ret_void(),
                ],
            )],
        };
        let err = func.validate().unwrap_err();
        assert!(err.to_string().contains("64-bit"), "{err}");
    }

    #[test]
    fn validate_rejects_long_globals() {
        let module = Module::new(
            "demo",
            vec![],
            vec![Global {
                name: "wide".into(),
                is_constant: false,
                initializer: Some(GlobalInit::Zero),
                debug_type: Some(DebugType::array(DebugType::scalar(VmType::Long), 4)),
            }],
        );
        let err = module.validate().unwrap_err();
        assert!(err.to_string().contains("64-bit"), "{err}");
    }

    #[test]
    fn module_lookup_by_name() {
        let module = Module::new(
            "demo",
            vec![Function {
                name: "main".into(),
                params: vec![],
                return_type: VmType::Void,
                blocks: vec![Block::new("entry", vec![ret_void()])],
            }],
            vec![Global {
                name: "counter".into(),
                is_constant: false,
                initializer: Some(GlobalInit::Zero),
                debug_type: Some(DebugType::scalar(VmType::Short)),
            }],
        );
        assert!(module.function("main").is_some());
        assert!(module.function("missing").is_none());
        assert!(module.global("counter").is_some());
        assert!(module.validate().is_ok());
    }
}
