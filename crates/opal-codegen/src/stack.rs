//! Operand stack depth computation.
//!
//! A forward worklist walk over the finished instruction list. Every
//! instruction carries its pop/push counts, so depth is exact: execution
//! starts at depth 0, each branch propagates its post-pop depth to the
//! target, and joining paths must agree. A mismatch or an underflow is a
//! compiler bug and aborts.
//!
//! The returned `max_stack` is the observed maximum plus two slots of
//! headroom, matching the interpreter's frame reservation for its own
//! internal pushes.

use rustc_hash::FxHashMap;

use opal_common::{CodegenError, Phase};

use crate::ops::Insn;

const STACK_HEADROOM: u16 = 2;

pub fn compute_max_stack(func_name: &str, insns: &[Insn]) -> Result<u16, CodegenError> {
    let err = |message: String| CodegenError::new(Phase::Stack, func_name, message);

    let mut label_index: FxHashMap<&str, usize> = FxHashMap::default();
    for (i, insn) in insns.iter().enumerate() {
        if let Some(label) = insn.label_name() {
            label_index.insert(label.as_str(), i);
        }
    }

    let mut entry_depth: FxHashMap<usize, i64> = FxHashMap::default();
    let mut work: Vec<(usize, i64)> = vec![(0, 0)];
    let mut max_depth: i64 = 0;

    while let Some((start, start_depth)) = work.pop() {
        let mut i = start;
        let mut depth = start_depth;
        loop {
            if i >= insns.len() {
                break;
            }
            match entry_depth.get(&i) {
                Some(&known) if known == depth => break,
                Some(&known) => {
                    let at = insns[i]
                        .label_name()
                        .map(|l| l.as_str().to_string())
                        .unwrap_or_else(|| format!("instruction {i}"));
                    return Err(err(format!(
                        "stack depth mismatch at {at}: {known} vs {depth}"
                    )));
                }
                None => {
                    entry_depth.insert(i, depth);
                }
            }

            let insn = &insns[i];
            depth -= insn.pops as i64;
            if depth < 0 {
                return Err(err(format!("operand stack underflow at instruction {i} ({insn})")));
            }
            depth += insn.pushes as i64;
            max_depth = max_depth.max(depth);

            if insn.op.is_branch() || insn.op.is_switch() {
                for operand in &insn.operands {
                    if let crate::ops::Operand::Label(target) = operand {
                        let target_index = *label_index
                            .get(target.as_str())
                            .ok_or_else(|| err(format!("branch to unknown label {target}")))?;
                        work.push((target_index, depth));
                    }
                }
            }

            if insn.op.ends_flow() {
                break;
            }
            i += 1;
        }
    }

    Ok(max_depth as u16 + STACK_HEADROOM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use opal_ir::{CmpPred, VmType};

    #[test]
    fn straight_line_depth_is_exact() {
        // sload, sload, sadd peaks at 2.
        let insns = vec![
            ops::label("entry".into()),
            ops::sload(0),
            ops::sload(1),
            ops::binary_op_for_type(opal_ir::BinaryOp::Add, VmType::Short),
            ops::return_for_type(VmType::Short),
        ];
        assert_eq!(compute_max_stack("f", &insns).unwrap(), 2 + STACK_HEADROOM);
    }

    #[test]
    fn branches_propagate_their_post_pop_depth() {
        // Both arms push one short before the join; the peak is in the
        // int arithmetic on the fallthrough path.
        let insns = vec![
            ops::label("entry".into()),
            ops::sload(0),
            ops::branch_on_zero(CmpPred::Eq, "else".into()),
            ops::iload(2),
            ops::iload(4),
            ops::binary_op_for_type(opal_ir::BinaryOp::Add, VmType::Int),
            ops::i2s(),
            ops::goto("join".into()),
            ops::label("else".into()),
            ops::sconst(0),
            ops::goto("join".into()),
            ops::label("join".into()),
            ops::return_for_type(VmType::Short),
        ];
        assert_eq!(compute_max_stack("f", &insns).unwrap(), 4 + STACK_HEADROOM);
    }

    #[test]
    fn depth_mismatch_at_a_join_is_fatal() {
        // One path reaches the join with 1 on the stack, the other with 2.
        let insns = vec![
            ops::label("entry".into()),
            ops::sload(0),
            ops::branch_on_zero(CmpPred::Eq, "b".into()),
            ops::sconst(1),
            ops::goto("join".into()),
            ops::label("b".into()),
            ops::sconst(1),
            ops::sconst(2),
            ops::goto("join".into()),
            ops::label("join".into()),
            ops::return_for_type(VmType::Short),
        ];
        let res = compute_max_stack("f", &insns);
        assert!(res.unwrap_err().to_string().contains("stack depth mismatch at join"));
    }

    #[test]
    fn underflow_is_fatal() {
        let insns = vec![ops::label("entry".into()), ops::pop()];
        let res = compute_max_stack("f", &insns);
        assert!(res.unwrap_err().to_string().contains("underflow"));
    }

    #[test]
    fn switch_targets_start_after_the_popped_value() {
        let insns = vec![
            ops::label("entry".into()),
            ops::sload(0),
            ops::lookup_switch(false, "d".into(), vec![(1, "a".into()), (7, "d".into())]),
            ops::label("a".into()),
            ops::return_for_type(VmType::Void),
            ops::label("d".into()),
            ops::return_for_type(VmType::Void),
        ];
        assert_eq!(compute_max_stack("f", &insns).unwrap(), 1 + STACK_HEADROOM);
    }

    #[test]
    fn unknown_branch_target_is_fatal() {
        let insns = vec![ops::label("entry".into()), ops::goto("nowhere".into())];
        let res = compute_max_stack("f", &insns);
        assert!(res.unwrap_err().to_string().contains("unknown label"));
    }
}
