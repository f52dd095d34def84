//! Narrowing analysis: which 32-bit values can live in 16-bit slots.
//!
//! The target VM's native width is the short; every value kept narrow saves
//! a slot and avoids wide arithmetic. Sink-based approach:
//!
//! 1. Collect all int-typed values as narrow candidates
//! 2. Seed the values a sink forces to stay wide (comparisons, right
//!    shifts, div/rem, address indices, wide memory traffic, large
//!    constants, non-narrowable call boundaries, `zext short -> int`,
//!    switch scrutinees)
//! 3. Propagate wideness backward through def-use chains; `zext`/`sext`
//!    are barriers because they already normalize width
//! 4. Enforce phi/binary/select width consistency to a fixed point
//! 5. Everything unmarked narrows
//!
//! Range metadata can prove a value fits a signed short, exempting it from
//! range-sensitive seeding.

use rustc_hash::{FxHashMap, FxHashSet};

use opal_common::{AnalysisError, Phase};
use opal_ir::{BinaryOp, CastOp, Function, Inst, Value, ValueName, ValueRange, VmType};

use crate::dataflow::{build_def_map, propagate_backward};

/// Which int parameters of each analyzed function came out narrow.
///
/// Filled in call-graph topological order so callers see their callees'
/// results and need not pessimistically widen arguments.
#[derive(Debug, Clone, Default)]
pub struct ParamNarrowing {
    by_func: FxHashMap<String, FxHashMap<usize, bool>>,
}

impl ParamNarrowing {
    pub fn record(&mut self, func: &Function, result: &NarrowingInfo) {
        let mut params = FxHashMap::default();
        for (idx, param) in func.params.iter().enumerate() {
            if param.ty == VmType::Int {
                params.insert(idx, result.is_narrowed(&param.name));
            }
        }
        self.by_func.insert(func.name.clone(), params);
    }

    /// Whether `callee`'s parameter at `index` is known narrowable.
    /// Unknown callees and indices default to `false` (conservative).
    pub fn param_narrowable(&self, callee: &str, index: usize) -> bool {
        self.by_func
            .get(callee)
            .and_then(|params| params.get(&index))
            .copied()
            .unwrap_or(false)
    }
}

/// Result of narrowing analysis for one function.
#[derive(Debug, Clone)]
pub struct NarrowingInfo {
    /// Values that must keep the wide 2-slot representation.
    pub wide: FxHashSet<ValueName>,
    /// Int-typed values safely representable as shorts.
    pub narrowed: FxHashSet<ValueName>,
    /// Why each wide value is wide.
    pub reasons: FxHashMap<ValueName, String>,
}

impl NarrowingInfo {
    fn new(
        func_name: &str,
        wide: FxHashSet<ValueName>,
        narrowed: FxHashSet<ValueName>,
        reasons: FxHashMap<ValueName, String>,
    ) -> Result<Self, AnalysisError> {
        let info = Self { wide, narrowed, reasons };
        info.validate(func_name)?;
        Ok(info)
    }

    fn validate(&self, func_name: &str) -> Result<(), AnalysisError> {
        if let Some(overlap) = self.wide.intersection(&self.narrowed).next() {
            return Err(AnalysisError::new(
                Phase::Narrowing,
                func_name,
                format!("value {overlap} is both narrow and wide"),
            ));
        }
        for name in &self.wide {
            if !self.reasons.contains_key(name) {
                return Err(AnalysisError::new(
                    Phase::Narrowing,
                    func_name,
                    format!("wide value {name} has no recorded reason"),
                ));
            }
        }
        Ok(())
    }

    pub fn is_narrowed(&self, name: &ValueName) -> bool {
        self.narrowed.contains(name)
    }

    /// Storage type after narrowing: declared `Int` becomes `Short` when
    /// the value narrowed; all other types pass through.
    pub fn storage_type(&self, name: &ValueName, declared: VmType) -> VmType {
        if declared == VmType::Int && self.narrowed.contains(name) {
            VmType::Short
        } else {
            declared
        }
    }
}

/// Analyze which int values of `func` can be narrowed to shorts.
pub fn analyze_narrowing(
    func: &Function,
    callee_params: &ParamNarrowing,
) -> Result<NarrowingInfo, AnalysisError> {
    let candidates = collect_int_values(func);
    let ranges = collect_ranges(func);
    let mut reasons: FxHashMap<ValueName, String> = FxHashMap::default();
    let seeds = identify_seeds(func, &candidates, callee_params, &ranges, &mut reasons);

    let def_map = build_def_map(func);
    let mut wide = propagate_backward(&seeds, &candidates, &def_map, is_width_barrier);
    for name in wide.difference(&seeds) {
        reasons.entry(name.clone()).or_insert_with(|| "propagated".into());
    }

    apply_consistency(func, &candidates, &def_map, &mut wide, &mut reasons);

    let narrowed: FxHashSet<ValueName> = candidates.difference(&wide).cloned().collect();
    NarrowingInfo::new(&func.name, wide, narrowed, reasons)
}

fn is_width_barrier(inst: &Inst) -> bool {
    matches!(inst, Inst::Cast { op: CastOp::Zext | CastOp::Sext, .. })
}

fn collect_int_values(func: &Function) -> FxHashSet<ValueName> {
    let mut ints: FxHashSet<ValueName> = func
        .params
        .iter()
        .filter(|p| p.ty == VmType::Int)
        .map(|p| p.name.clone())
        .collect();
    for block in &func.blocks {
        for inst in &block.instrs {
            if let (Some(result), Some(VmType::Int)) = (inst.result(), inst.result_type()) {
                ints.insert(result.clone());
            }
        }
    }
    ints
}

fn collect_ranges(func: &Function) -> FxHashMap<ValueName, ValueRange> {
    let mut ranges = FxHashMap::default();
    for block in &func.blocks {
        for inst in &block.instrs {
            if let Inst::Binary { result, range: Some(range), .. } = inst {
                ranges.insert(result.clone(), *range);
            }
        }
    }
    ranges
}

fn out_of_short_range(value: i64) -> bool {
    value < i16::MIN as i64 || value > i16::MAX as i64
}

fn identify_seeds(
    func: &Function,
    candidates: &FxHashSet<ValueName>,
    callee_params: &ParamNarrowing,
    ranges: &FxHashMap<ValueName, ValueRange>,
    reasons: &mut FxHashMap<ValueName, String>,
) -> FxHashSet<ValueName> {
    let mut seeds: FxHashSet<ValueName> = FxHashSet::default();
    let fits_short =
        |name: &ValueName| ranges.get(name).map(ValueRange::fits_short).unwrap_or(false);
    let mut seed = |seeds: &mut FxHashSet<ValueName>,
                    reasons: &mut FxHashMap<ValueName, String>,
                    name: &ValueName,
                    reason: String| {
        if seeds.insert(name.clone()) {
            reasons.insert(name.clone(), reason);
        }
    };

    for block in &func.blocks {
        for inst in &block.instrs {
            seed_large_constants(inst, candidates, &mut seeds, reasons);

            match inst {
                // The stored bit pattern is observed at full width.
                Inst::Store { ty: VmType::Int, value, .. } => {
                    if let Some(name) = value.as_ssa() {
                        if candidates.contains(name) {
                            seed(&mut seeds, reasons, name, "stored to int memory".into());
                        }
                    }
                }

                Inst::Call { result, ty, callee, args } => {
                    for (idx, arg) in args.iter().enumerate() {
                        if let Some(name) = arg.as_ssa() {
                            if candidates.contains(name)
                                && !callee_params.param_narrowable(callee, idx)
                            {
                                seed(
                                    &mut seeds,
                                    reasons,
                                    name,
                                    format!("argument to {callee}"),
                                );
                            }
                        }
                    }
                    // The callee's return range is unknown.
                    if let (Some(result), VmType::Int) = (result, ty) {
                        seed(&mut seeds, reasons, result, format!("return from {callee}"));
                    }
                }

                // A narrowed operand would wrap modulo 2^16 and change the
                // comparison outcome.
                Inst::ICmp { lhs, rhs, .. } => {
                    for operand in [lhs, rhs] {
                        if let Some(name) = operand.as_ssa() {
                            if candidates.contains(name) && !fits_short(name) {
                                seed(&mut seeds, reasons, name, "operand of icmp".into());
                            }
                        }
                    }
                }

                Inst::Binary { op, lhs, rhs, .. } => {
                    // Right shifts move high bits into observable positions:
                    // only the shifted value needs full width, the shift
                    // amount is taken modulo the bit width.
                    if matches!(op, BinaryOp::Lshr | BinaryOp::Ashr) {
                        if let Some(name) = lhs.as_ssa() {
                            if candidates.contains(name) && !fits_short(name) {
                                seed(
                                    &mut seeds,
                                    reasons,
                                    name,
                                    format!("operand of {}", op.name()),
                                );
                            }
                        }
                    }
                    // Quotient and remainder depend on full magnitudes.
                    if op.is_div_rem() {
                        for operand in [lhs, rhs] {
                            if let Some(name) = operand.as_ssa() {
                                if candidates.contains(name) && !fits_short(name) {
                                    seed(
                                        &mut seeds,
                                        reasons,
                                        name,
                                        format!("operand of {}", op.name()),
                                    );
                                }
                            }
                        }
                    }
                }

                // Address arithmetic observes the full index.
                Inst::Gep { indices, .. } => {
                    for idx in indices {
                        if let Some(name) = idx.as_ssa() {
                            if candidates.contains(name) && !fits_short(name) {
                                seed(&mut seeds, reasons, name, "address index".into());
                            }
                        }
                    }
                }

                // Wide memory can hold any 32-bit value.
                Inst::Load { result, ty: VmType::Int, .. } => {
                    if !fits_short(result) {
                        seed(&mut seeds, reasons, result, "load from int memory".into());
                    }
                }

                // zext short->int produces [0, 65535], which exceeds the
                // signed short range; narrowing would turn large values
                // negative. zext byte->int stays narrowable ([0, 255] fits).
                Inst::Cast { result, op: CastOp::Zext, from_ty: VmType::Short, .. } => {
                    if candidates.contains(result) {
                        seed(&mut seeds, reasons, result, "zext short to int".into());
                    }
                }

                // Dispatch observes the full scrutinee.
                Inst::Switch { value, .. } => {
                    if let Some(name) = value.as_ssa() {
                        if candidates.contains(name) {
                            seed(&mut seeds, reasons, name, "switch value".into());
                        }
                    }
                }

                _ => {}
            }
        }
    }

    seeds
}

/// Results mixed with constants outside the short range stay wide.
fn seed_large_constants(
    inst: &Inst,
    candidates: &FxHashSet<ValueName>,
    seeds: &mut FxHashSet<ValueName>,
    reasons: &mut FxHashMap<ValueName, String>,
) {
    let (result, const_operands): (&ValueName, Vec<&Value>) = match inst {
        Inst::Binary { result, lhs, rhs, .. } => (result, vec![lhs, rhs]),
        Inst::Phi { result, sources, .. } => (result, sources.iter().map(|(v, _)| v).collect()),
        Inst::Select { result, then_val, else_val, .. } => (result, vec![then_val, else_val]),
        _ => return,
    };
    if !candidates.contains(result) {
        return;
    }
    for operand in const_operands {
        if let Value::Const { value, .. } = operand {
            if out_of_short_range(*value) && seeds.insert(result.clone()) {
                reasons.insert(result.clone(), format!("large constant {value}"));
                return;
            }
        }
    }
}

/// Width consistency for phi/binary/select: result and int operands agree,
/// in both directions, re-propagating backward after each round.
fn apply_consistency(
    func: &Function,
    candidates: &FxHashSet<ValueName>,
    def_map: &FxHashMap<&ValueName, &Inst>,
    wide: &mut FxHashSet<ValueName>,
    reasons: &mut FxHashMap<ValueName, String>,
) {
    let mut changed = true;
    while changed {
        changed = false;

        for block in &func.blocks {
            for inst in &block.instrs {
                let (result, operands, what) = match inst {
                    Inst::Phi { result, sources, .. } => (
                        result,
                        sources.iter().filter_map(|(v, _)| v.as_ssa()).collect::<Vec<_>>(),
                        "phi",
                    ),
                    Inst::Binary { result, lhs, rhs, .. } => (
                        result,
                        [lhs, rhs].iter().filter_map(|v| v.as_ssa()).collect(),
                        "binary op",
                    ),
                    Inst::Select { result, then_val, else_val, .. } => (
                        result,
                        [then_val, else_val].iter().filter_map(|v| v.as_ssa()).collect(),
                        "select",
                    ),
                    _ => continue,
                };
                if !candidates.contains(result) {
                    continue;
                }
                let operands: Vec<&ValueName> =
                    operands.into_iter().filter(|n| candidates.contains(*n)).collect();

                if !wide.contains(result) && operands.iter().any(|n| wide.contains(*n)) {
                    wide.insert(result.clone());
                    reasons.insert(result.clone(), format!("{what} consistency (operand wide)"));
                    changed = true;
                }
                if wide.contains(result) {
                    for name in &operands {
                        if !wide.contains(*name) {
                            wide.insert((*name).clone());
                            reasons.insert(
                                (*name).clone(),
                                format!("{what} consistency (result wide)"),
                            );
                            changed = true;
                        }
                    }
                }
            }
        }

        if changed {
            let propagated = propagate_backward(wide, candidates, def_map, is_width_barrier);
            for name in propagated.difference(wide) {
                reasons.entry(name.clone()).or_insert_with(|| "propagated".into());
            }
            *wide = propagated;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::{Block, Param};

    fn int_param(name: &str) -> Param {
        Param { name: name.into(), ty: VmType::Int }
    }

    fn ret_int(name: &str) -> Inst {
        Inst::Ret { ty: VmType::Int, value: Some(Value::ssa(name)) }
    }

    fn one_block(name: &str, params: Vec<Param>, instrs: Vec<Inst>) -> Function {
        Function {
            name: name.into(),
            params,
            return_type: VmType::Int,
            blocks: vec![Block::new("entry", instrs)],
        }
    }

    fn add_int(result: &str, lhs: Value, rhs: Value) -> Inst {
        Inst::Binary {
            result: result.into(),
            op: BinaryOp::Add,
            ty: VmType::Int,
            lhs,
            rhs,
            range: None,
        }
    }

    #[test]
    fn plain_arithmetic_narrows() {
        let func = one_block(
            "f",
            vec![int_param("%x")],
            vec![add_int("%y", Value::ssa("%x"), Value::const_int(1)), ret_int("%y")],
        );
        let info = analyze_narrowing(&func, &ParamNarrowing::default()).unwrap();
        assert!(info.is_narrowed(&"%x".into()));
        assert!(info.is_narrowed(&"%y".into()));
        assert_eq!(info.storage_type(&"%y".into(), VmType::Int), VmType::Short);
    }

    #[test]
    fn icmp_operand_stays_wide_and_propagates() {
        let func = one_block(
            "f",
            vec![int_param("%x")],
            vec![
                add_int("%y", Value::ssa("%x"), Value::const_int(1)),
                Inst::ICmp {
                    result: "%c".into(),
                    pred: opal_ir::CmpPred::Eq,
                    ty: VmType::Int,
                    lhs: Value::ssa("%y"),
                    rhs: Value::const_int(0),
                },
                ret_int("%y"),
            ],
        );
        let info = analyze_narrowing(&func, &ParamNarrowing::default()).unwrap();
        assert!(info.wide.contains("%y"));
        // Backward propagation reaches the operand's operands.
        assert!(info.wide.contains("%x"));
        assert_eq!(info.reasons["%y"], "operand of icmp");
    }

    #[test]
    fn range_metadata_exempts_icmp_seed() {
        let func = one_block(
            "f",
            vec![int_param("%x")],
            vec![
                Inst::Binary {
                    result: "%y".into(),
                    op: BinaryOp::Add,
                    ty: VmType::Int,
                    lhs: Value::ssa("%x"),
                    rhs: Value::const_int(1),
                    range: Some(ValueRange::new(0, 100)),
                },
                Inst::ICmp {
                    result: "%c".into(),
                    pred: opal_ir::CmpPred::Slt,
                    ty: VmType::Int,
                    lhs: Value::ssa("%y"),
                    rhs: Value::const_int(50),
                },
                ret_int("%y"),
            ],
        );
        let info = analyze_narrowing(&func, &ParamNarrowing::default()).unwrap();
        assert!(info.is_narrowed(&"%y".into()));
    }

    #[test]
    fn large_constant_seeds_result() {
        let func = one_block(
            "f",
            vec![int_param("%x")],
            vec![add_int("%y", Value::ssa("%x"), Value::const_int(100_000)), ret_int("%y")],
        );
        let info = analyze_narrowing(&func, &ParamNarrowing::default()).unwrap();
        assert!(info.wide.contains("%y"));
        assert!(info.reasons["%y"].contains("large constant"));
        // Binary consistency drags the operand along.
        assert!(info.wide.contains("%x"));
    }

    #[test]
    fn sext_is_a_backward_barrier() {
        // %w = sext %n (short->int); %q = sdiv %w, %d. The sdiv seeds %w
        // wide, but the barrier keeps wideness from crossing into %n.
        let func = Function {
            name: "f".into(),
            params: vec![
                Param { name: "%n".into(), ty: VmType::Short },
                int_param("%d"),
            ],
            return_type: VmType::Int,
            blocks: vec![Block::new(
                "entry",
                vec![
                    Inst::Cast {
                        result: "%w".into(),
                        op: CastOp::Sext,
                        from_ty: VmType::Short,
                        to_ty: VmType::Int,
                        value: Value::ssa("%n"),
                    },
                    Inst::Binary {
                        result: "%q".into(),
                        op: BinaryOp::Sdiv,
                        ty: VmType::Int,
                        lhs: Value::ssa("%w"),
                        rhs: Value::ssa("%d"),
                        range: None,
                    },
                    ret_int("%q"),
                ],
            )],
        };
        let info = analyze_narrowing(&func, &ParamNarrowing::default()).unwrap();
        assert!(info.wide.contains("%w"));
        assert!(info.wide.contains("%d"));
        assert!(!info.wide.contains("%n"));
    }

    #[test]
    fn zext_from_short_stays_wide() {
        let func = Function {
            name: "f".into(),
            params: vec![Param { name: "%n".into(), ty: VmType::Short }],
            return_type: VmType::Int,
            blocks: vec![Block::new(
                "entry",
                vec![
                    Inst::Cast {
                        result: "%w".into(),
                        op: CastOp::Zext,
                        from_ty: VmType::Short,
                        to_ty: VmType::Int,
                        value: Value::ssa("%n"),
                    },
                    ret_int("%w"),
                ],
            )],
        };
        let info = analyze_narrowing(&func, &ParamNarrowing::default()).unwrap();
        assert!(info.wide.contains("%w"));
        assert_eq!(info.reasons["%w"], "zext short to int");
    }

    #[test]
    fn call_args_respect_callee_narrowability() {
        // Without callee info: conservative, argument is wide.
        let func = one_block(
            "f",
            vec![int_param("%x")],
            vec![
                Inst::Call {
                    result: None,
                    ty: VmType::Void,
                    callee: "g".into(),
                    args: vec![Value::ssa("%x")],
                },
                ret_int("%x"),
            ],
        );
        let info = analyze_narrowing(&func, &ParamNarrowing::default()).unwrap();
        assert!(info.wide.contains("%x"));

        // With a narrowable callee param: the argument narrows.
        let mut callee_params = ParamNarrowing::default();
        let g = one_block("g", vec![int_param("%p")], vec![ret_int("%p")]);
        let g_info = analyze_narrowing(&g, &ParamNarrowing::default()).unwrap();
        callee_params.record(&g, &g_info);
        assert!(callee_params.param_narrowable("g", 0));

        let info = analyze_narrowing(&func, &callee_params).unwrap();
        assert!(info.is_narrowed(&"%x".into()));
    }

    #[test]
    fn int_call_results_stay_wide() {
        let func = one_block(
            "f",
            vec![],
            vec![
                Inst::Call {
                    result: Some("%r".into()),
                    ty: VmType::Int,
                    callee: "g".into(),
                    args: vec![],
                },
                ret_int("%r"),
            ],
        );
        let info = analyze_narrowing(&func, &ParamNarrowing::default()).unwrap();
        assert!(info.wide.contains("%r"));
    }

    #[test]
    fn phi_consistency_is_bidirectional() {
        let func = Function {
            name: "f".into(),
            params: vec![int_param("%a"), int_param("%b")],
            return_type: VmType::Int,
            blocks: vec![
                Block::new(
                    "entry",
                    vec![Inst::CondBr {
                        cond: Value::ssa("%a"),
                        then_label: "left".into(),
                        else_label: "join".into(),
                    }],
                ),
                Block::new(
                    "left",
                    vec![
                        // Forces %w wide via int store.
                        Inst::Store {
                            ty: VmType::Int,
                            value: Value::ssa("%a"),
                            addr: Value::GlobalRef("g".into()),
                        },
                        Inst::Br { target: "join".into() },
                    ],
                ),
                Block::new(
                    "join",
                    vec![
                        Inst::Phi {
                            result: "%p".into(),
                            ty: VmType::Int,
                            sources: vec![
                                (Value::ssa("%a"), "left".into()),
                                (Value::ssa("%b"), "entry".into()),
                            ],
                        },
                        ret_int("%p"),
                    ],
                ),
            ],
        };
        let info = analyze_narrowing(&func, &ParamNarrowing::default()).unwrap();
        // %a is wide (stored to int memory); phi consistency widens %p,
        // then the reverse direction widens %b.
        assert!(info.wide.contains("%a"));
        assert!(info.wide.contains("%p"));
        assert!(info.wide.contains("%b"));
    }
}
