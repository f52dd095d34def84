//! Worklist propagation over SSA def-use chains.
//!
//! Owned-state helpers shared by the set-based analyses: backward
//! propagation with barrier instructions (narrowing) and fixed-point
//! forward propagation through a filtered instruction set.

use rustc_hash::{FxHashMap, FxHashSet};

use opal_ir::{Function, Inst, ValueName};

/// Map from each SSA name to its defining instruction.
pub fn build_def_map(func: &Function) -> FxHashMap<&ValueName, &Inst> {
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

/// Backward propagation: a marked result marks its operands, unless the
/// defining instruction is a barrier. Only names in `candidates` are marked.
pub fn propagate_backward(
    seeds: &FxHashSet<ValueName>,
    candidates: &FxHashSet<ValueName>,
    def_map: &FxHashMap<&ValueName, &Inst>,
    is_barrier: impl Fn(&Inst) -> bool,
) -> FxHashSet<ValueName> {
    let mut marked: FxHashSet<ValueName> = seeds.clone();
    let mut worklist: Vec<ValueName> = seeds.iter().cloned().collect();

    while let Some(name) = worklist.pop() {
        let Some(defn) = def_map.get(&name) else { continue };
        if is_barrier(defn) {
            continue;
        }
        for operand in defn.operands() {
            if let Some(op_name) = operand.as_ssa() {
                if candidates.contains(op_name) && !marked.contains(op_name) {
                    marked.insert(op_name.clone());
                    worklist.push(op_name.clone());
                }
            }
        }
    }
    marked
}

/// Fixed-point forward propagation: a result becomes marked when any of its
/// operands is marked and `propagates_through` accepts the instruction.
pub fn propagate_forward(
    func: &Function,
    seeds: &FxHashSet<ValueName>,
    candidates: &FxHashSet<ValueName>,
    propagates_through: impl Fn(&Inst) -> bool,
) -> FxHashSet<ValueName> {
    let mut marked: FxHashSet<ValueName> = seeds.clone();
    let mut changed = true;

    while changed {
        changed = false;
        for block in &func.blocks {
            for inst in &block.instrs {
                let Some(result) = inst.result() else { continue };
                if !candidates.contains(result) || marked.contains(result) {
                    continue;
                }
                if !propagates_through(inst) {
                    continue;
                }
                let hit = inst
                    .operands()
                    .iter()
                    .filter_map(|v| v.as_ssa())
                    .any(|name| marked.contains(name));
                if hit {
                    marked.insert(result.clone());
                    changed = true;
                }
            }
        }
    }
    marked
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::{BinaryOp, Block, CastOp, Value, VmType};

    fn add(result: &str, lhs: Value, rhs: Value) -> Inst {
        Inst::Binary {
            result: result.into(),
            op: BinaryOp::Add,
            ty: VmType::Int,
            lhs,
            rhs,
            range: None,
        }
    }

    fn chain_func() -> Function {
        // %a = add %p, 1 ; %b = sext %a ; %c = add %b, %a ; ret %c
        Function {
            name: "f".into(),
            params: vec![opal_ir::Param { name: "%p".into(), ty: VmType::Int }],
            return_type: VmType::Int,
            blocks: vec![Block::new(
                "entry",
                vec![
                    add("%a", Value::ssa("%p"), Value::const_int(1)),
                    Inst::Cast {
                        result: "%b".into(),
                        op: CastOp::Sext,
                        from_ty: VmType::Short,
                        to_ty: VmType::Int,
                        value: Value::ssa("%a"),
                    },
                    add("%c", Value::ssa("%b"), Value::ssa("%a")),
                    Inst::Ret { ty: VmType::Int, value: Some(Value::ssa("%c")) },
                ],
            )],
        }
    }

    fn all_names() -> FxHashSet<ValueName> {
        ["%p", "%a", "%b", "%c"].iter().map(|&n| n.into()).collect()
    }

    #[test]
    fn backward_walks_operands() {
        let func = chain_func();
        let defs = build_def_map(&func);
        let seeds: FxHashSet<ValueName> = [ValueName::from("%c")].into_iter().collect();
        let marked = propagate_backward(&seeds, &all_names(), &defs, |_| false);
        // %c -> %b -> %a -> %p, and %c -> %a directly.
        assert!(marked.contains("%p"));
        assert_eq!(marked.len(), 4);
    }

    #[test]
    fn barriers_stop_backward_propagation() {
        let func = chain_func();
        let defs = build_def_map(&func);
        let seeds: FxHashSet<ValueName> = [ValueName::from("%b")].into_iter().collect();
        let marked = propagate_backward(&seeds, &all_names(), &defs, |inst| {
            matches!(inst, Inst::Cast { .. })
        });
        assert_eq!(marked.len(), 1);
        assert!(marked.contains("%b"));
    }

    #[test]
    fn forward_reaches_fixed_point() {
        let func = chain_func();
        let seeds: FxHashSet<ValueName> = [ValueName::from("%a")].into_iter().collect();
        let marked = propagate_forward(&func, &seeds, &all_names(), |_| true);
        assert!(marked.contains("%b"));
        assert!(marked.contains("%c"));
        assert!(!marked.contains("%p"));
    }
}
