//! Peephole cleanup of emitted instruction lists.
//!
//! Passes run in a fixed order; no window ever crosses a label, so every
//! rewrite is valid regardless of control flow joining at that point:
//!
//! 1. load/const/add/store on one slot fuses to `sinc` / `iinc`
//! 2. adjacent inverse casts cancel, `s2i; i2b` shortens to `s2b`
//! 3. gotos to the next label drop
//! 4. branch threading: branches into a label that immediately jumps on
//!    retarget to the final destination
//! 5. gotos to the next label drop again (threading exposes more)
//! 6. identity parallel-move windows (loads then stores writing every
//!    value back where it came from) drop
//! 7. a materialized 0/1 immediately consumed by `ifeq`/`ifne` fuses
//!    back into the original comparison branch
//! 8. store-then-reload keeps the value on the stack with `dup`
//! 9. frequently pushed 32-bit constants and frequently read static
//!    array references cache in scratch slots filled once in a prologue
//!
//! Caching allocates slots above `first_free_local`; the count of slots
//! added comes back to the caller for `max_locals`.

use rustc_hash::FxHashMap;

use opal_ir::BlockLabel;

use crate::ops::{self, Insn, Opcode, Operand};

/// Number of uses at which constant and static-ref caching pays off.
const CACHE_THRESHOLD: usize = 3;

pub fn peephole(insns: Vec<Insn>, first_free_local: u16) -> (Vec<Insn>, u16) {
    let mut insns = insns;
    insns = fuse_increments(insns);
    insns = cancel_casts(insns);
    insns = drop_redundant_gotos(insns);
    insns = thread_branches(insns);
    insns = drop_redundant_gotos(insns);
    insns = drop_identity_moves(insns);
    insns = fuse_materialized_bools(insns);
    insns = dup_store_reloads(insns);

    let mut extra_locals = 0u16;
    insns = cache_wide_constants(insns, first_free_local, &mut extra_locals);
    insns = cache_static_refs(insns, first_free_local, &mut extra_locals);
    (insns, extra_locals)
}

fn is_barrier(insn: &Insn) -> bool {
    insn.op == Opcode::Label || insn.op.is_branch() || insn.op.is_switch()
}

/// `sload N; sconst K; sadd|ssub; sstore N` becomes `sinc N, ±K`.
fn fuse_increments(insns: Vec<Insn>) -> Vec<Insn> {
    let mut out: Vec<Insn> = Vec::with_capacity(insns.len());
    let mut i = 0;
    while i < insns.len() {
        if i + 3 < insns.len() && insns[i..i + 4].iter().all(|x| !is_barrier(x)) {
            let w = &insns[i..i + 4];
            let fused = match (w[0].sload_slot(), w[0].iload_slot()) {
                (Some(slot), _) => fuse_inc_window(w, slot, false),
                (_, Some(slot)) => fuse_inc_window(w, slot, true),
                _ => None,
            };
            if let Some(insn) = fused {
                out.push(insn);
                i += 4;
                continue;
            }
        }
        out.push(insns[i].clone());
        i += 1;
    }
    out
}

fn fuse_inc_window(w: &[Insn], slot: u16, wide: bool) -> Option<Insn> {
    let constant = if wide { w[1].iconst_value()? } else { w[1].sconst_value()? };
    let delta = match (wide, w[2].op) {
        (false, Opcode::Sadd) | (true, Opcode::Iadd) => constant,
        (false, Opcode::Ssub) | (true, Opcode::Isub) => -constant,
        _ => return None,
    };
    if !(-128..=127).contains(&delta) {
        return None;
    }
    let store = if wide { w[3].istore_slot()? } else { w[3].sstore_slot()? };
    if store != slot {
        return None;
    }
    Some(if wide { ops::iinc(slot, delta) } else { ops::sinc(slot, delta) })
}

/// `s2i; i2s` cancels; `s2i; i2b` is just `s2b`.
fn cancel_casts(insns: Vec<Insn>) -> Vec<Insn> {
    let mut out: Vec<Insn> = Vec::with_capacity(insns.len());
    for insn in insns {
        match (out.last().map(|i| i.op), insn.op) {
            (Some(Opcode::S2i), Opcode::I2s) => {
                out.pop();
            }
            (Some(Opcode::S2i), Opcode::I2b) => {
                out.pop();
                out.push(ops::s2b());
            }
            _ => out.push(insn),
        }
    }
    out
}

/// Drop a goto whose target is the very next label.
fn drop_redundant_gotos(insns: Vec<Insn>) -> Vec<Insn> {
    let mut out: Vec<Insn> = Vec::with_capacity(insns.len());
    for insn in insns {
        if insn.op == Opcode::Label {
            if let (Some(prev), Some(label)) = (out.last(), insn.label_name()) {
                if prev.op == Opcode::GotoW && prev.branch_target() == Some(label) {
                    out.pop();
                }
            }
        }
        out.push(insn);
    }
    out
}

/// Retarget branches through labels that immediately jump on.
fn thread_branches(insns: Vec<Insn>) -> Vec<Insn> {
    let mut forward: FxHashMap<BlockLabel, BlockLabel> = FxHashMap::default();
    for pair in insns.windows(2) {
        if pair[0].op == Opcode::Label && pair[1].op == Opcode::GotoW {
            if let (Some(label), Some(target)) = (pair[0].label_name(), pair[1].branch_target()) {
                if label != target {
                    forward.insert(label.clone(), target.clone());
                }
            }
        }
    }
    if forward.is_empty() {
        return insns;
    }

    let mut insns = insns;
    for insn in &mut insns {
        if insn.op == Opcode::Label {
            continue;
        }
        insn.for_each_label_mut(|label| {
            let mut seen = 0;
            while let Some(next) = forward.get(label) {
                *label = next.clone();
                seen += 1;
                // Goto loops would chase forever.
                if seen > forward.len() {
                    break;
                }
            }
        });
    }
    insns
}

/// Drop `sload a..sload k; sstore k..sstore a` identity windows.
fn drop_identity_moves(insns: Vec<Insn>) -> Vec<Insn> {
    let mut out: Vec<Insn> = Vec::with_capacity(insns.len());
    let mut i = 0;
    'outer: while i < insns.len() {
        // Longest window first: loads l1..lk then stores in reverse order
        // writing each value back to its own slot.
        let max_k = 4.min((insns.len() - i) / 2);
        for k in (2..=max_k).rev() {
            let window = &insns[i..i + 2 * k];
            if window.iter().any(is_barrier) {
                continue;
            }
            let loads: Vec<Option<u16>> = window[..k].iter().map(Insn::sload_slot).collect();
            let stores: Vec<Option<u16>> = window[k..].iter().map(Insn::sstore_slot).collect();
            let identity = loads.iter().all(Option::is_some)
                && stores.iter().all(Option::is_some)
                && loads
                    .iter()
                    .zip(stores.iter().rev())
                    .all(|(l, s)| l == s);
            if identity {
                i += 2 * k;
                continue 'outer;
            }
        }
        out.push(insns[i].clone());
        i += 1;
    }
    out
}

/// Collapse a materialized boolean consumed by a zero test.
///
/// The emitter's comparison-as-value shape is
/// `branch Lt; sconst_0; goto Le; Lt: sconst_1; Le:`; followed by
/// `ifne T` the whole thing is the original branch to `T`, and
/// followed by `ifeq T` it is the inverted branch.
fn fuse_materialized_bools(insns: Vec<Insn>) -> Vec<Insn> {
    let mut out: Vec<Insn> = Vec::with_capacity(insns.len());
    let mut i = 0;
    while i < insns.len() {
        if i + 6 < insns.len() {
            if let Some(fused) = match_bool_window(&insns[i..i + 7]) {
                out.push(fused);
                i += 7;
                continue;
            }
        }
        out.push(insns[i].clone());
        i += 1;
    }
    out
}

fn match_bool_window(w: &[Insn]) -> Option<Insn> {
    if !w[0].op.is_conditional_branch() {
        return None;
    }
    let true_label = w[0].branch_target()?;
    let end_label = w[2].branch_target()?;
    let shape = w[1].sconst_value() == Some(0)
        && w[2].op == Opcode::GotoW
        && w[3].op == Opcode::Label
        && w[3].label_name() == Some(true_label)
        && w[4].sconst_value() == Some(1)
        && w[5].op == Opcode::Label
        && w[5].label_name() == Some(end_label);
    if !shape {
        return None;
    }
    let consumer_target = w[6].branch_target()?.clone();
    let op = match w[6].op {
        Opcode::Ifne => w[0].op,
        Opcode::Ifeq => w[0].op.inverted()?,
        _ => return None,
    };
    let mut fused = w[0].clone();
    fused.op = op;
    fused.for_each_label_mut(|label| *label = consumer_target.clone());
    Some(fused)
}

/// `store N; load N` keeps the value on the stack instead.
fn dup_store_reloads(insns: Vec<Insn>) -> Vec<Insn> {
    let mut out: Vec<Insn> = Vec::with_capacity(insns.len());
    let mut i = 0;
    while i < insns.len() {
        if i + 1 < insns.len() {
            let (a, b) = (&insns[i], &insns[i + 1]);
            let narrow = a.sstore_slot().is_some() && a.sstore_slot() == b.sload_slot();
            let wide = a.istore_slot().is_some() && a.istore_slot() == b.iload_slot();
            let refs = a.astore_slot().is_some() && a.astore_slot() == b.aload_slot();
            if narrow || refs {
                out.push(ops::dup());
                out.push(a.clone());
                i += 2;
                continue;
            }
            if wide {
                out.push(ops::dup2());
                out.push(a.clone());
                i += 2;
                continue;
            }
        }
        out.push(insns[i].clone());
        i += 1;
    }
    out
}

/// Cache 32-bit constants pushed `CACHE_THRESHOLD`+ times in a scratch slot.
fn cache_wide_constants(
    insns: Vec<Insn>,
    first_free_local: u16,
    extra_locals: &mut u16,
) -> Vec<Insn> {
    let mut counts: FxHashMap<i64, usize> = FxHashMap::default();
    for insn in &insns {
        if insn.op == Opcode::Iipush {
            if let Some(value) = insn.iconst_value() {
                *counts.entry(value).or_default() += 1;
            }
        }
    }
    let mut cached: Vec<(i64, usize)> = counts
        .into_iter()
        .filter(|(_, count)| *count >= CACHE_THRESHOLD)
        .collect();
    if cached.is_empty() {
        return insns;
    }
    cached.sort_by_key(|(value, count)| (usize::MAX - count, *value));

    let mut slots: FxHashMap<i64, u16> = FxHashMap::default();
    let mut prologue = Vec::new();
    for (value, _) in &cached {
        let slot = first_free_local + *extra_locals;
        *extra_locals += 2;
        slots.insert(*value, slot);
        prologue.push(ops::iconst(*value));
        prologue.push(ops::istore(slot));
    }

    splice_prologue(insns, prologue, |insn| {
        if insn.op == Opcode::Iipush {
            if let Some(&slot) = insn.iconst_value().and_then(|v| slots.get(&v)) {
                return Some(ops::iload(slot));
            }
        }
        None
    })
}

/// Cache static array references read `CACHE_THRESHOLD`+ times.
fn cache_static_refs(
    insns: Vec<Insn>,
    first_free_local: u16,
    extra_locals: &mut u16,
) -> Vec<Insn> {
    let mut counts: FxHashMap<u16, usize> = FxHashMap::default();
    for insn in &insns {
        if insn.op == Opcode::GetstaticA {
            if let Some(cp) = insn.cp_index() {
                *counts.entry(cp).or_default() += 1;
            }
        }
    }
    let mut cached: Vec<(u16, usize)> = counts
        .into_iter()
        .filter(|(_, count)| *count >= CACHE_THRESHOLD)
        .collect();
    if cached.is_empty() {
        return insns;
    }
    cached.sort_by_key(|(cp, count)| (usize::MAX - count, *cp));

    let mut slots: FxHashMap<u16, u16> = FxHashMap::default();
    let mut prologue = Vec::new();
    for (cp, _) in &cached {
        let slot = first_free_local + *extra_locals;
        *extra_locals += 1;
        slots.insert(*cp, slot);
        prologue.push(ops::getstatic_a(*cp));
        prologue.push(ops::astore(slot));
    }

    splice_prologue(insns, prologue, |insn| {
        if insn.op == Opcode::GetstaticA {
            if let Some(&slot) = insn.cp_index().and_then(|cp| slots.get(&cp)) {
                return Some(ops::aload(slot));
            }
        }
        None
    })
}

/// Insert `prologue` after the entry label and rewrite matching insns.
fn splice_prologue(
    insns: Vec<Insn>,
    prologue: Vec<Insn>,
    mut rewrite: impl FnMut(&Insn) -> Option<Insn>,
) -> Vec<Insn> {
    let mut out = Vec::with_capacity(insns.len() + prologue.len());
    let mut prologue = Some(prologue);
    for insn in insns {
        let rewritten = rewrite(&insn);
        out.push(rewritten.unwrap_or(insn));
        if out.last().map(|i| i.op) == Some(Opcode::Label) {
            if let Some(p) = prologue.take() {
                out.extend(p);
            }
        }
    }
    if let Some(p) = prologue.take() {
        out.splice(0..0, p);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opcodes(insns: &[Insn]) -> Vec<Opcode> {
        insns.iter().map(|i| i.op).collect()
    }

    #[test]
    fn increment_fuses_to_sinc() {
        let insns = vec![ops::sload(4), ops::sconst(1), ops::binary_op_for_type(opal_ir::BinaryOp::Add, opal_ir::VmType::Short), ops::sstore(4)];
        let (out, extra) = peephole(insns, 8);
        assert_eq!(extra, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].op, Opcode::Sinc);
        assert_eq!(out[0].operands, vec![Operand::Slot(4), Operand::Imm(1)]);
    }

    #[test]
    fn subtraction_fuses_with_negated_delta() {
        let insns = vec![
            ops::sload(2),
            ops::sconst(3),
            ops::binary_op_for_type(opal_ir::BinaryOp::Sub, opal_ir::VmType::Short),
            ops::sstore(2),
        ];
        let (out, _) = peephole(insns, 8);
        assert_eq!(out[0].operands, vec![Operand::Slot(2), Operand::Imm(-3)]);
    }

    #[test]
    fn mismatched_slots_do_not_fuse() {
        let insns = vec![
            ops::sload(1),
            ops::sconst(1),
            ops::binary_op_for_type(opal_ir::BinaryOp::Add, opal_ir::VmType::Short),
            ops::sstore(2),
        ];
        let (out, _) = peephole(insns, 8);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn widen_then_narrow_cancels() {
        let insns = vec![ops::sload(0), ops::s2i(), ops::i2s(), ops::sstore(1)];
        let (out, _) = peephole(insns, 8);
        assert_eq!(opcodes(&out), vec![Opcode::Sload0, Opcode::Sstore1]);
    }

    #[test]
    fn widen_then_truncate_to_byte_shortens() {
        let insns = vec![ops::sload(0), ops::s2i(), ops::i2b(), ops::sstore(1)];
        let (out, _) = peephole(insns, 8);
        assert_eq!(opcodes(&out), vec![Opcode::Sload0, Opcode::S2b, Opcode::Sstore1]);
    }

    #[test]
    fn goto_to_next_label_drops() {
        let insns = vec![
            ops::goto("next".into()),
            ops::label("next".into()),
            ops::return_for_type(opal_ir::VmType::Void),
        ];
        let (out, _) = peephole(insns, 0);
        assert_eq!(opcodes(&out), vec![Opcode::Label, Opcode::Return]);
    }

    #[test]
    fn branches_thread_through_empty_blocks() {
        let insns = vec![
            ops::branch_on_zero(opal_ir::CmpPred::Eq, "hop".into()),
            ops::return_for_type(opal_ir::VmType::Void),
            ops::label("hop".into()),
            ops::goto("end".into()),
            ops::label("end".into()),
            ops::return_for_type(opal_ir::VmType::Void),
        ];
        let (out, _) = peephole(insns, 0);
        assert_eq!(out[0].branch_target().map(|l| l.as_str()), Some("end"));
    }

    #[test]
    fn identity_move_window_drops() {
        let insns = vec![ops::sload(1), ops::sload(2), ops::sstore(2), ops::sstore(1)];
        let (out, _) = peephole(insns, 8);
        assert!(out.is_empty());
    }

    #[test]
    fn real_swap_survives() {
        let insns = vec![ops::sload(1), ops::sload(2), ops::sstore(1), ops::sstore(2)];
        let (out, _) = peephole(insns, 8);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn materialized_bool_consumed_by_ifne_refuses() {
        let insns = vec![
            ops::branch_scmp(opal_ir::CmpPred::Slt, "t".into()),
            ops::sconst(0),
            ops::goto("e".into()),
            ops::label("t".into()),
            ops::sconst(1),
            ops::label("e".into()),
            ops::branch_on_zero(opal_ir::CmpPred::Ne, "loop".into()),
        ];
        let (out, _) = peephole(insns, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].op, Opcode::IfScmplt);
        assert_eq!(out[0].branch_target().map(|l| l.as_str()), Some("loop"));
    }

    #[test]
    fn materialized_bool_consumed_by_ifeq_inverts() {
        let insns = vec![
            ops::branch_scmp(opal_ir::CmpPred::Slt, "t".into()),
            ops::sconst(0),
            ops::goto("e".into()),
            ops::label("t".into()),
            ops::sconst(1),
            ops::label("e".into()),
            ops::branch_on_zero(opal_ir::CmpPred::Eq, "exit".into()),
        ];
        let (out, _) = peephole(insns, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].op, Opcode::IfScmpge);
    }

    #[test]
    fn store_then_reload_dups() {
        let insns = vec![ops::sconst(5), ops::sstore(3), ops::sload(3), ops::sstore(4)];
        let (out, _) = peephole(insns, 8);
        assert_eq!(
            opcodes(&out),
            vec![Opcode::Bspush, Opcode::Dup, Opcode::Sstore3, Opcode::Sstore]
        );
    }

    #[test]
    fn frequent_wide_constant_caches_in_a_slot() {
        let mut insns = vec![ops::label("entry".into())];
        for _ in 0..3 {
            insns.push(ops::iconst(100000));
            insns.push(ops::pop2());
        }
        insns.push(ops::return_for_type(opal_ir::VmType::Void));
        let (out, extra) = peephole(insns, 6);
        assert_eq!(extra, 2);
        // Prologue fills slot 6 once; each use reads it back.
        assert_eq!(out.iter().filter(|i| i.op == Opcode::Iipush).count(), 1);
        assert_eq!(out.iter().filter(|i| i.iload_slot() == Some(6)).count(), 3);
    }

    #[test]
    fn frequent_static_ref_caches_in_a_slot() {
        let mut insns = vec![ops::label("entry".into())];
        for _ in 0..3 {
            insns.push(ops::getstatic_a(2));
            insns.push(ops::pop());
        }
        insns.push(ops::return_for_type(opal_ir::VmType::Void));
        let (out, extra) = peephole(insns, 6);
        assert_eq!(extra, 1);
        assert_eq!(out.iter().filter(|i| i.op == Opcode::GetstaticA).count(), 1);
        assert_eq!(out.iter().filter(|i| i.aload_slot() == Some(6)).count(), 3);
    }

    #[test]
    fn windows_never_cross_labels() {
        let insns = vec![
            ops::sload(4),
            ops::label("mid".into()),
            ops::sconst(1),
            ops::binary_op_for_type(opal_ir::BinaryOp::Add, opal_ir::VmType::Short),
            ops::sstore(4),
        ];
        let (out, _) = peephole(insns, 8);
        assert!(out.iter().all(|i| i.op != Opcode::Sinc));
    }
}
