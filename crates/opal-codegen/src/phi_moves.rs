//! Phi elimination: per-edge parallel move scheduling.
//!
//! Phis have no runtime form; each control-flow edge instead performs a
//! parallel copy into the phi destination slots just before the jump.
//! The copies are semantically simultaneous, so scheduling must respect
//! slot dependences:
//!
//! - moves whose destination no other pending move still reads drain first
//! - what remains is one or more cycles; a two-slot swap of single-slot
//!   values uses the operand stack, longer cycles break through one
//!   scratch slot
//!
//! Scratch slots come from a per-edge `TempAllocator`; its high-water
//! mark feeds `max_locals`.

use opal_analysis::{FunctionLocals, PhiInfo};
use opal_common::{CodegenError, Phase};
use opal_ir::{Block, Function, Value, VmType};

use crate::ops::{load_for_type, store_for_type, Insn};

/// Source of one phi move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveSrc {
    Slot(u16),
    Const(i64),
}

/// One copy of the parallel assignment on an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhiMove {
    pub src: MoveSrc,
    pub dst: u16,
    pub ty: VmType,
}

impl PhiMove {
    /// Coalesced moves copy a slot onto itself and emit nothing.
    pub fn is_noop(&self) -> bool {
        self.src == MoveSrc::Slot(self.dst)
    }

    fn reads_slot(&self, slot: u16) -> bool {
        match self.src {
            MoveSrc::Slot(src) => {
                let width = self.ty.slots();
                (src..src + width).contains(&slot)
            }
            MoveSrc::Const(_) => false,
        }
    }
}

/// Scratch slot allocator for one edge.
///
/// Slots above the colored locals are handed out in order; `max_used`
/// across all edges extends the frame.
#[derive(Debug)]
pub struct TempAllocator {
    first_slot: u16,
    next: u16,
    high_water: u16,
}

impl TempAllocator {
    pub fn new(first_slot: u16) -> Self {
        Self { first_slot, next: first_slot, high_water: first_slot }
    }

    pub fn allocate(&mut self, slots: u16) -> u16 {
        let slot = self.next;
        self.next += slots;
        self.high_water = self.high_water.max(self.next);
        slot
    }

    /// Release this edge's temps; the next edge reuses the same slots.
    pub fn reset(&mut self) {
        self.next = self.first_slot;
    }

    /// Total scratch slots ever live at once.
    pub fn max_used(&self) -> u16 {
        self.high_water - self.first_slot
    }
}

/// Collect the parallel moves for the edge `pred -> succ`.
///
/// Phis without slots (dead) and coalesced self-moves are dropped. An
/// undef source materializes as zero so the destination slot is still
/// well defined.
pub fn build_phi_moves(
    func: &Function,
    pred: &Block,
    succ: &Block,
    phi_info: &PhiInfo,
    locals: &FunctionLocals,
) -> Result<Vec<PhiMove>, CodegenError> {
    let mut moves = Vec::new();
    for inst in succ.phi_instrs() {
        let result = match inst.result() {
            Some(r) => r,
            None => continue,
        };
        let dst = match locals.slot_of(result) {
            Some(slot) => slot,
            None => continue,
        };
        let ty = locals
            .register_type(result)
            .ok_or_else(|| err(func, format!("phi {result} has a slot but no register type")))?;

        let value = phi_info.source_for_block(&func.name, result, pred.label.as_str())?;
        let src = match value {
            Value::Const { value, .. } => MoveSrc::Const(*value),
            Value::Undef(_) => MoveSrc::Const(0),
            Value::Null => MoveSrc::Const(0),
            Value::SsaRef(name) => match locals.slot_of(name) {
                Some(slot) => MoveSrc::Slot(slot),
                None => {
                    return Err(err(
                        func,
                        format!("phi source {name} has no slot on edge {} -> {}",
                            pred.label, succ.label),
                    ))
                }
            },
            Value::GlobalRef(_) | Value::InlineGep(_) => {
                return Err(err(
                    func,
                    format!("phi {result} merges addresses; pointers cannot flow through phis"),
                ))
            }
        };

        let mv = PhiMove { src, dst, ty };
        if !mv.is_noop() {
            moves.push(mv);
        }
    }
    Ok(moves)
}

/// Order one edge's parallel moves into sequential instructions.
pub fn schedule_phi_moves(
    moves: &[PhiMove],
    temps: &mut TempAllocator,
) -> Result<Vec<Insn>, CodegenError> {
    let mut insns = Vec::new();
    let mut pending: Vec<PhiMove> = moves.to_vec();

    // Drain moves whose destination nothing else still reads. Constant
    // moves read no slot but their destination still counts: another
    // pending move may source from it, so the store has to wait.
    loop {
        let ready = pending.iter().position(|mv| {
            let width = mv.ty.slots();
            !pending.iter().any(|other| {
                other != mv && (mv.dst..mv.dst + width).any(|s| other.reads_slot(s))
            })
        });
        match ready {
            Some(i) => {
                let mv = pending.remove(i);
                match mv.src {
                    MoveSrc::Slot(src) => {
                        insns.push(load_for_type(mv.ty, src));
                        insns.push(store_for_type(mv.ty, mv.dst));
                    }
                    MoveSrc::Const(value) => {
                        insns.push(crate::ops::const_for_type(mv.ty, value));
                        insns.push(store_for_type(mv.ty, mv.dst));
                    }
                }
            }
            None => break,
        }
    }

    // What remains is pure cycles.
    while !pending.is_empty() {
        let cycle = extract_cycle(&mut pending);

        if cycle.len() == 2
            && cycle[0].ty.slots() == 1
            && cycle[1].ty.slots() == 1
            && cycle[0].ty == cycle[1].ty
        {
            // Swap through the operand stack.
            let (a, b) = (&cycle[0], &cycle[1]);
            if let (MoveSrc::Slot(sa), MoveSrc::Slot(sb)) = (a.src, b.src) {
                insns.push(load_for_type(a.ty, sa));
                insns.push(load_for_type(b.ty, sb));
                insns.push(store_for_type(b.ty, b.dst));
                insns.push(store_for_type(a.ty, a.dst));
            }
            continue;
        }

        // Break the cycle through a scratch slot: save the first source,
        // then perform the rest in chain order. Each later move writes the
        // slot the previous one already read, so no value is clobbered
        // early; the saved value lands last.
        let first = cycle[0];
        let first_src = match first.src {
            MoveSrc::Slot(slot) => slot,
            MoveSrc::Const(_) => {
                return Err(CodegenError::new(
                    Phase::Emit,
                    "",
                    "constant move survived into a cycle",
                ))
            }
        };
        let temp = temps.allocate(first.ty.slots());
        insns.push(load_for_type(first.ty, first_src));
        insns.push(store_for_type(first.ty, temp));
        for mv in cycle.iter().skip(1) {
            if let MoveSrc::Slot(src) = mv.src {
                insns.push(load_for_type(mv.ty, src));
                insns.push(store_for_type(mv.ty, mv.dst));
            }
        }
        insns.push(load_for_type(first.ty, temp));
        insns.push(store_for_type(first.ty, first.dst));
    }

    Ok(insns)
}

/// Remove one slot cycle from `pending`, ordered so each move's destination
/// is the previous move's source.
fn extract_cycle(pending: &mut Vec<PhiMove>) -> Vec<PhiMove> {
    let mut cycle = vec![pending.remove(0)];
    loop {
        let tail = cycle.last().cloned();
        let Some(tail) = tail else { break };
        let next = pending.iter().position(|mv| tail.reads_slot(mv.dst));
        match next {
            Some(i) => cycle.push(pending.remove(i)),
            None => break,
        }
    }
    cycle
}

fn err(func: &Function, message: impl Into<String>) -> CodegenError {
    CodegenError::new(Phase::Emit, &func.name, message)
}
