//! Interference graph construction via liveness analysis.
//!
//! Two escaping values interfere (cannot share a slot) when one is defined
//! while the other is live. Liveness is computed backward, block-level
//! first then per instruction. Phi operand uses are credited to the
//! predecessor block (where the move executes), and same-block phis always
//! interfere because they read with parallel semantics.
//!
//! Folded (non-escaping) operands are traced through transitively: when a
//! tree is inlined at its root, the escaping leaves of the tree are
//! effectively used at the root's emission point.

use rustc_hash::{FxHashMap, FxHashSet};

use opal_common::{AnalysisError, Phase};
use opal_ir::{BlockLabel, Function, Inst, ValueName, VmType};

use crate::escape::EscapeInfo;
use crate::narrowing::NarrowingInfo;

/// Graph where an edge means "cannot share a slot".
///
/// Edges are normalized with the lexicographically smaller name first.
#[derive(Debug, Clone)]
pub struct InterferenceGraph {
    pub nodes: FxHashSet<ValueName>,
    pub edges: FxHashSet<(ValueName, ValueName)>,
    /// Storage type (after narrowing) per node.
    pub node_types: FxHashMap<ValueName, VmType>,
}

impl InterferenceGraph {
    fn validate(&self, func_name: &str) -> Result<(), AnalysisError> {
        for (a, b) in &self.edges {
            if a == b {
                return Err(AnalysisError::new(
                    Phase::Interference,
                    func_name,
                    format!("self-interference edge on {a}"),
                ));
            }
            for end in [a, b] {
                if !self.nodes.contains(end) {
                    return Err(AnalysisError::new(
                        Phase::Interference,
                        func_name,
                        format!("edge endpoint {end} is not a node"),
                    ));
                }
            }
        }
        for node in &self.nodes {
            if !self.node_types.contains_key(node) {
                return Err(AnalysisError::new(
                    Phase::Interference,
                    func_name,
                    format!("node {node} has no storage type"),
                ));
            }
        }
        Ok(())
    }

    pub fn interferes(&self, a: &ValueName, b: &ValueName) -> bool {
        let key = if a < b { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };
        self.edges.contains(&key)
    }

    pub fn neighbors(&self, node: &ValueName) -> FxHashSet<&ValueName> {
        let mut result = FxHashSet::default();
        for (a, b) in &self.edges {
            if a == node {
                result.insert(b);
            } else if b == node {
                result.insert(a);
            }
        }
        result
    }

    pub fn degree(&self, node: &ValueName) -> usize {
        self.neighbors(node).len()
    }
}

/// Build the interference graph over escaping values of `func`.
pub fn build_interference_graph(
    func: &Function,
    escapes: &EscapeInfo,
    narrowing: &NarrowingInfo,
) -> Result<InterferenceGraph, AnalysisError> {
    let nodes = escapes.escaping.clone();
    if nodes.is_empty() {
        return Ok(InterferenceGraph {
            nodes,
            edges: FxHashSet::default(),
            node_types: FxHashMap::default(),
        });
    }

    let node_types = compute_node_types(func, &nodes, narrowing);
    let def_map = build_def_map(func);

    let mut raw_edges: FxHashSet<(ValueName, ValueName)> = FxHashSet::default();
    compute_interference_edges(func, &nodes, &def_map, &mut raw_edges);
    add_same_block_phi_interference(func, &nodes, &mut raw_edges);

    let mut edges: FxHashSet<(ValueName, ValueName)> = FxHashSet::default();
    for (a, b) in raw_edges {
        if a == b {
            continue;
        }
        if a < b {
            edges.insert((a, b));
        } else {
            edges.insert((b, a));
        }
    }

    let graph = InterferenceGraph { nodes, edges, node_types };
    graph.validate(&func.name)?;
    Ok(graph)
}

fn build_def_map(func: &Function) -> FxHashMap<&ValueName, &Inst> {
    let mut defs = FxHashMap::default();
    for block in &func.blocks {
        for inst in &block.instrs {
            if let Some(result) = inst.result() {
                defs.insert(result, inst);
            }
        }
    }
    defs
}

fn compute_node_types(
    func: &Function,
    nodes: &FxHashSet<ValueName>,
    narrowing: &NarrowingInfo,
) -> FxHashMap<ValueName, VmType> {
    let mut types = FxHashMap::default();
    for block in &func.blocks {
        for inst in &block.instrs {
            let Some(name) = inst.result() else { continue };
            if !nodes.contains(name) {
                continue;
            }
            if let Some(ty) = inst.result_type() {
                types.insert(name.clone(), narrowing.storage_type(name, ty));
            }
        }
    }
    for param in &func.params {
        if nodes.contains(&param.name) {
            types.insert(param.name.clone(), narrowing.storage_type(&param.name, param.ty));
        }
    }
    types
}

/// Escaping values used by `inst`, tracing through folded intermediates.
fn add_operand_uses(
    inst: &Inst,
    nodes: &FxHashSet<ValueName>,
    def_map: &FxHashMap<&ValueName, &Inst>,
    live: &mut FxHashSet<ValueName>,
) {
    for operand in inst.operands() {
        let Some(name) = operand.as_ssa() else { continue };
        if nodes.contains(name) {
            live.insert(name.clone());
        } else {
            collect_transitive_uses(name, nodes, def_map, live);
        }
    }
}

fn collect_transitive_uses(
    name: &ValueName,
    nodes: &FxHashSet<ValueName>,
    def_map: &FxHashMap<&ValueName, &Inst>,
    result: &mut FxHashSet<ValueName>,
) {
    let mut worklist = vec![name.clone()];
    let mut visited: FxHashSet<ValueName> = FxHashSet::default();
    while let Some(n) = worklist.pop() {
        if !visited.insert(n.clone()) {
            continue;
        }
        if nodes.contains(&n) {
            result.insert(n);
            continue;
        }
        if let Some(defn) = def_map.get(&n) {
            for op in defn.operands() {
                if let Some(op_name) = op.as_ssa() {
                    worklist.push(op_name.clone());
                }
            }
        }
    }
}

fn compute_interference_edges(
    func: &Function,
    nodes: &FxHashSet<ValueName>,
    def_map: &FxHashMap<&ValueName, &Inst>,
    edges: &mut FxHashSet<(ValueName, ValueName)>,
) {
    let live_out = compute_block_live_out(func, nodes, def_map);

    for block in &func.blocks {
        let mut live: FxHashSet<ValueName> = live_out[&block.label].clone();

        for inst in block.instrs.iter().rev() {
            let defined = inst.result().filter(|r| nodes.contains(*r));
            if let Some(defined) = defined {
                for live_val in &live {
                    if live_val != defined {
                        edges.insert((defined.clone(), live_val.clone()));
                    }
                }
                live.remove(defined);
            }
            // Phi operand uses belong to predecessors, handled in live-out.
            if !inst.is_phi() {
                add_operand_uses(inst, nodes, def_map, &mut live);
            }
        }
    }
}

/// Backward block-level liveness. `live_out[B]` includes the phi sources
/// that B's edges must provide to successor phis.
fn compute_block_live_out(
    func: &Function,
    nodes: &FxHashSet<ValueName>,
    def_map: &FxHashMap<&ValueName, &Inst>,
) -> FxHashMap<BlockLabel, FxHashSet<ValueName>> {
    let mut block_defs: FxHashMap<&BlockLabel, FxHashSet<ValueName>> = FxHashMap::default();
    let mut block_uses: FxHashMap<&BlockLabel, FxHashSet<ValueName>> = FxHashMap::default();

    for block in &func.blocks {
        let mut defs: FxHashSet<ValueName> = FxHashSet::default();
        let mut uses: FxHashSet<ValueName> = FxHashSet::default();

        for inst in &block.instrs {
            if inst.is_phi() {
                if let Some(result) = inst.result() {
                    if nodes.contains(result) {
                        defs.insert(result.clone());
                    }
                }
                continue;
            }

            let mut inst_uses: FxHashSet<ValueName> = FxHashSet::default();
            add_operand_uses(inst, nodes, def_map, &mut inst_uses);
            for name in inst_uses {
                if !defs.contains(&name) {
                    uses.insert(name);
                }
            }

            if let Some(result) = inst.result() {
                if nodes.contains(result) {
                    defs.insert(result.clone());
                }
            }
        }

        block_defs.insert(&block.label, defs);
        block_uses.insert(&block.label, uses);
    }

    // Phi sources are used at the end of the providing predecessor.
    let mut phi_uses_from_pred: FxHashMap<BlockLabel, FxHashSet<ValueName>> =
        FxHashMap::default();
    for block in &func.blocks {
        for inst in block.phi_instrs() {
            if let Inst::Phi { sources, .. } = inst {
                for (value, from_label) in sources {
                    let bucket = phi_uses_from_pred.entry(from_label.clone()).or_default();
                    if let Some(name) = value.as_ssa() {
                        if nodes.contains(name) {
                            bucket.insert(name.clone());
                        } else {
                            collect_transitive_uses(name, nodes, def_map, bucket);
                        }
                    }
                }
            }
        }
    }

    let mut live_in: FxHashMap<BlockLabel, FxHashSet<ValueName>> =
        func.blocks.iter().map(|b| (b.label.clone(), FxHashSet::default())).collect();
    let mut live_out: FxHashMap<BlockLabel, FxHashSet<ValueName>> = live_in.clone();

    let mut changed = true;
    while changed {
        changed = false;
        for block in &func.blocks {
            let mut new_out: FxHashSet<ValueName> = FxHashSet::default();
            for succ in block.successors() {
                if let Some(succ_in) = live_in.get(succ) {
                    new_out.extend(succ_in.iter().cloned());
                }
            }
            if let Some(phi_uses) = phi_uses_from_pred.get(&block.label) {
                new_out.extend(phi_uses.iter().cloned());
            }

            let mut new_in: FxHashSet<ValueName> = new_out
                .difference(&block_defs[&block.label])
                .cloned()
                .collect();
            new_in.extend(block_uses[&block.label].iter().cloned());

            if new_in != live_in[&block.label] || new_out != live_out[&block.label] {
                live_in.insert(block.label.clone(), new_in);
                live_out.insert(block.label.clone(), new_out);
                changed = true;
            }
        }
    }

    live_out
}

/// Same-block phis read their old values with parallel semantics, so they
/// are simultaneously live regardless of computed liveness.
fn add_same_block_phi_interference(
    func: &Function,
    nodes: &FxHashSet<ValueName>,
    edges: &mut FxHashSet<(ValueName, ValueName)>,
) {
    for block in &func.blocks {
        let phis: Vec<&ValueName> = block
            .phi_instrs()
            .filter_map(|i| i.result())
            .filter(|r| nodes.contains(*r))
            .collect();
        for (i, a) in phis.iter().enumerate() {
            for b in &phis[i + 1..] {
                edges.insert(((*a).clone(), (*b).clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::analyze_escapes;
    use crate::narrowing::{analyze_narrowing, ParamNarrowing};
    use crate::phi::analyze_phis;
    use opal_ir::{BinaryOp, Block, Param, Value};

    fn analyze(func: &Function) -> InterferenceGraph {
        let phi_info = analyze_phis(func);
        let escapes = analyze_escapes(func, &phi_info);
        let narrowing = analyze_narrowing(func, &ParamNarrowing::default()).unwrap();
        build_interference_graph(func, &escapes, &narrowing).unwrap()
    }

    #[test]
    fn simultaneously_live_values_interfere() {
        // %a and %b both live at the add that consumes them later.
        let func = Function {
            name: "f".into(),
            params: vec![],
            return_type: VmType::Short,
            blocks: vec![
                Block::new(
                    "entry",
                    vec![
                        Inst::Binary {
                            result: "%a".into(),
                            op: BinaryOp::Add,
                            ty: VmType::Short,
                            lhs: Value::const_short(1),
                            rhs: Value::const_short(2),
                            range: None,
                        },
                        Inst::Binary {
                            result: "%b".into(),
                            op: BinaryOp::Add,
                            ty: VmType::Short,
                            lhs: Value::const_short(3),
                            rhs: Value::const_short(4),
                            range: None,
                        },
                        Inst::Br { target: "exit".into() },
                    ],
                ),
                Block::new(
                    "exit",
                    vec![
                        Inst::Binary {
                            result: "%c".into(),
                            op: BinaryOp::Add,
                            ty: VmType::Short,
                            lhs: Value::ssa("%a"),
                            rhs: Value::ssa("%b"),
                            range: None,
                        },
                        Inst::Ret { ty: VmType::Short, value: Some(Value::ssa("%c")) },
                    ],
                ),
            ],
        };
        let graph = analyze(&func);
        assert!(graph.interferes(&"%a".into(), &"%b".into()));
        // %c is defined after both die; no interference with either.
        assert!(!graph.interferes(&"%a".into(), &"%c".into()));
    }

    #[test]
    fn disjoint_lifetimes_do_not_interfere() {
        let func = Function {
            name: "f".into(),
            params: vec![],
            return_type: VmType::Short,
            blocks: vec![
                Block::new(
                    "entry",
                    vec![
                        Inst::Binary {
                            result: "%a".into(),
                            op: BinaryOp::Add,
                            ty: VmType::Short,
                            lhs: Value::const_short(1),
                            rhs: Value::const_short(2),
                            range: None,
                        },
                        Inst::Br { target: "mid".into() },
                    ],
                ),
                Block::new(
                    "mid",
                    vec![
                        Inst::Binary {
                            result: "%b".into(),
                            op: BinaryOp::Add,
                            ty: VmType::Short,
                            lhs: Value::ssa("%a"),
                            rhs: Value::const_short(1),
                            range: None,
                        },
                        Inst::Br { target: "exit".into() },
                    ],
                ),
                Block::new(
                    "exit",
                    vec![Inst::Ret { ty: VmType::Short, value: Some(Value::ssa("%b")) }],
                ),
            ],
        };
        let graph = analyze(&func);
        // %a dies at %b's definition point.
        assert!(!graph.interferes(&"%a".into(), &"%b".into()));
    }

    #[test]
    fn same_block_phis_interfere() {
        let func = Function {
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
        };
        let graph = analyze(&func);
        assert!(graph.interferes(&"%p".into(), &"%q".into()));
    }

    #[test]
    fn folded_operands_extend_escaping_leaf_liveness() {
        // %sum is non-escaping (single same-block use) and folds into the
        // store root; its escaping operand %a must stay live up to the
        // root, across %b's definition in between.
        let func = Function {
            name: "f".into(),
            params: vec![Param { name: "%a".into(), ty: VmType::Short }],
            return_type: VmType::Void,
            blocks: vec![
                Block::new("entry", vec![Inst::Br { target: "body".into() }]),
                Block::new(
                    "body",
                    vec![
                        Inst::Binary {
                            result: "%sum".into(),
                            op: BinaryOp::Add,
                            ty: VmType::Short,
                            lhs: Value::ssa("%a"),
                            rhs: Value::const_short(2),
                            range: None,
                        },
                        Inst::Binary {
                            result: "%b".into(),
                            op: BinaryOp::Add,
                            ty: VmType::Short,
                            lhs: Value::const_short(3),
                            rhs: Value::const_short(4),
                            range: None,
                        },
                        Inst::Store {
                            ty: VmType::Short,
                            value: Value::ssa("%sum"),
                            addr: Value::GlobalRef("g".into()),
                        },
                        Inst::Store {
                            ty: VmType::Short,
                            value: Value::ssa("%b"),
                            addr: Value::GlobalRef("g".into()),
                        },
                        Inst::Store {
                            ty: VmType::Short,
                            value: Value::ssa("%b"),
                            addr: Value::GlobalRef("h".into()),
                        },
                        Inst::Ret { ty: VmType::Void, value: None },
                    ],
                ),
            ],
        };
        let graph = analyze(&func);
        // %a escapes cross-block, %b escapes multi-use; %sum folds away.
        assert!(!graph.nodes.contains(&ValueName::from("%sum")));
        // %a's liveness at %b's definition flows only through the folded
        // %sum into the first store.
        assert!(graph.interferes(&"%a".into(), &"%b".into()));
    }

    #[test]
    fn node_types_reflect_narrowing() {
        let func = Function {
            name: "f".into(),
            params: vec![Param { name: "%x".into(), ty: VmType::Int }],
            return_type: VmType::Int,
            blocks: vec![
                Block::new("entry", vec![Inst::Br { target: "exit".into() }]),
                Block::new(
                    "exit",
                    vec![Inst::Ret { ty: VmType::Int, value: Some(Value::ssa("%x")) }],
                ),
            ],
        };
        let graph = analyze(&func);
        // %x narrows (no wide sink), so its storage type is Short.
        assert_eq!(graph.node_types[&ValueName::from("%x")], VmType::Short);
    }
}
