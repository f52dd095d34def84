//! Slot assignment via graph coloring.
//!
//! Values that never interfere share a slot. DSatur ordering: repeatedly
//! pick the uncolored node with the most distinct colors among colored
//! neighbors, breaking ties by degree then by name so runs are
//! deterministic. The VM allows up to 255 locals, so there are effectively
//! unlimited colors and no spilling; the goal is to minimize slot count.
//!
//! Phi coalescing is a preference, not a constraint: when coloring a phi
//! we try its already-colored sources' slots first, and when coloring a
//! phi source we try the phi's slot. A coalesced pair needs no move on
//! the edge.
//!
//! Parameters are pre-colored to their calling-convention slots and those
//! slots are reserved even when a parameter is dead, since the verifier
//! expects a parameter slot to keep its declared type.

use std::cmp::Reverse;

use rustc_hash::{FxHashMap, FxHashSet};

use opal_common::{AnalysisError, Limits, Phase};
use opal_ir::{ValueName, VmType};

use crate::interference::InterferenceGraph;
use crate::phi::PhiInfo;

/// Slot numbers chosen for every escaping value.
#[derive(Debug, Clone)]
pub struct SlotAssignments {
    pub assignments: FxHashMap<ValueName, u16>,
    /// Type stored in each occupied slot.
    pub slot_types: FxHashMap<u16, VmType>,
    /// Slot count before phi temps are appended.
    pub num_slots: u16,
}

impl SlotAssignments {
    fn validate(&self, func_name: &str) -> Result<(), AnalysisError> {
        for (name, &slot) in &self.assignments {
            if slot >= self.num_slots {
                return Err(AnalysisError::new(
                    Phase::Coloring,
                    func_name,
                    format!("{name} assigned slot {slot} beyond num_slots {}", self.num_slots),
                ));
            }
            if !self.slot_types.contains_key(&slot) {
                return Err(AnalysisError::new(
                    Phase::Coloring,
                    func_name,
                    format!("slot {slot} has no recorded type"),
                ));
            }
        }
        Ok(())
    }

    pub fn slot_of(&self, name: &ValueName) -> Option<u16> {
        self.assignments.get(name).copied()
    }
}

/// Color `graph`, pre-coloring parameters to their fixed slots.
pub fn color_graph(
    func_name: &str,
    graph: &InterferenceGraph,
    phi_info: &PhiInfo,
    param_slots: &FxHashMap<ValueName, u16>,
    param_types: &FxHashMap<ValueName, VmType>,
    limits: &Limits,
) -> Result<SlotAssignments, AnalysisError> {
    // Parameter slots stay reserved even with nothing to color, so temp
    // allocation cannot land on them.
    if graph.nodes.is_empty() {
        let mut num_slots = 0u16;
        for (name, &slot) in param_slots {
            let ty = param_types.get(name).copied().unwrap_or(VmType::Short);
            num_slots = num_slots.max(slot + ty.slots());
        }
        return Ok(SlotAssignments {
            assignments: FxHashMap::default(),
            slot_types: FxHashMap::default(),
            num_slots,
        });
    }

    let adjacency = build_adjacency(graph);
    let source_to_phis = build_source_to_phi_map(phi_info);

    let mut assignments: FxHashMap<ValueName, u16> = FxHashMap::default();
    let mut slot_types: FxHashMap<u16, VmType> = FxHashMap::default();

    for node in &graph.nodes {
        if let Some(&fixed) = param_slots.get(node) {
            assignments.insert(node.clone(), fixed);
            let ty = graph.node_types[node];
            for offset in 0..ty.slots() {
                slot_types.entry(fixed + offset).or_insert(ty);
            }
        }
    }

    let mut reserved: FxHashSet<u16> = FxHashSet::default();
    for (name, &slot) in param_slots {
        let ty = param_types
            .get(name)
            .or_else(|| graph.node_types.get(name))
            .copied()
            .unwrap_or(VmType::Ref);
        for offset in 0..ty.slots() {
            reserved.insert(slot + offset);
        }
    }

    let mut remaining: FxHashSet<ValueName> = graph
        .nodes
        .iter()
        .filter(|n| !assignments.contains_key(*n))
        .cloned()
        .collect();

    let mut saturation: FxHashMap<ValueName, FxHashSet<u16>> =
        remaining.iter().map(|n| (n.clone(), FxHashSet::default())).collect();
    for node in &remaining {
        for neighbor in &adjacency[node] {
            if let Some(&color) = assignments.get(neighbor) {
                saturation.get_mut(node).map(|s| s.insert(color));
            }
        }
    }

    while !remaining.is_empty() {
        // Highest saturation, then highest degree, then smallest name.
        let node = match remaining.iter().min_by_key(|n| {
            (Reverse(saturation[*n].len()), Reverse(adjacency[*n].len()), (*n).clone())
        }) {
            Some(n) => n.clone(),
            None => break,
        };
        remaining.remove(&node);

        let color = choose_color(
            &node,
            &adjacency,
            &assignments,
            phi_info,
            &source_to_phis,
            &graph.node_types,
            &reserved,
        );
        assignments.insert(node.clone(), color);

        let ty = graph.node_types[&node];
        for offset in 0..ty.slots() {
            slot_types.entry(color + offset).or_insert(ty);
        }

        for neighbor in &adjacency[&node] {
            if let Some(sat) = saturation.get_mut(neighbor) {
                sat.insert(color);
            }
        }
    }

    // num_slots covers the last slot of every multi-slot value and every
    // parameter, colored or not.
    let mut num_slots = 0u16;
    for (name, &base) in &assignments {
        num_slots = num_slots.max(base + graph.node_types[name].slots());
    }
    for (name, &slot) in param_slots {
        let ty = param_types.get(name).copied().unwrap_or(VmType::Short);
        num_slots = num_slots.max(slot + ty.slots());
    }

    if u32::from(num_slots) > u32::from(limits.max_locals_hard) {
        return Err(AnalysisError::new(
            Phase::Coloring,
            func_name,
            format!(
                "{num_slots} locals exceed the VM limit of {}",
                limits.max_locals_hard
            ),
        ));
    }

    let result = SlotAssignments { assignments, slot_types, num_slots };
    result.validate(func_name)?;
    Ok(result)
}

fn build_adjacency(graph: &InterferenceGraph) -> FxHashMap<ValueName, FxHashSet<ValueName>> {
    let mut adjacency: FxHashMap<ValueName, FxHashSet<ValueName>> =
        graph.nodes.iter().map(|n| (n.clone(), FxHashSet::default())).collect();
    for (a, b) in &graph.edges {
        adjacency.get_mut(a).map(|s| s.insert(b.clone()));
        adjacency.get_mut(b).map(|s| s.insert(a.clone()));
    }
    adjacency
}

fn build_source_to_phi_map(phi_info: &PhiInfo) -> FxHashMap<ValueName, Vec<ValueName>> {
    let mut result: FxHashMap<ValueName, Vec<ValueName>> = FxHashMap::default();
    for phi_name in phi_info.phi_names() {
        if let Some(sources) = phi_info.sources(phi_name) {
            for source in sources {
                if let Some(name) = source.value.as_ssa() {
                    result.entry(name.clone()).or_default().push(phi_name.clone());
                }
            }
        }
    }
    result
}

fn choose_color(
    node: &ValueName,
    adjacency: &FxHashMap<ValueName, FxHashSet<ValueName>>,
    assignments: &FxHashMap<ValueName, u16>,
    phi_info: &PhiInfo,
    source_to_phis: &FxHashMap<ValueName, Vec<ValueName>>,
    node_types: &FxHashMap<ValueName, VmType>,
    reserved: &FxHashSet<u16>,
) -> u16 {
    let node_type = node_types[node];
    let slots_needed = node_type.slots();

    let mut unavailable: FxHashSet<u16> = reserved.clone();
    for neighbor in &adjacency[node] {
        if let Some(&base) = assignments.get(neighbor) {
            for offset in 0..node_types[neighbor].slots() {
                unavailable.insert(base + offset);
            }
        }
    }

    let slot_available = |base: u16| -> bool {
        for offset in 0..slots_needed {
            if unavailable.contains(&(base + offset)) {
                return false;
            }
        }
        for offset in 0..slots_needed {
            if let Some((owner_base, owner_ty)) =
                slot_occupant(base + offset, assignments, node_types)
            {
                // A value may only reuse slots of same-based, compatible
                // occupants; straddling a neighbor's multi-slot value
                // would corrupt it.
                if owner_base != base || !types_can_share(node_type, owner_ty) {
                    return false;
                }
            }
        }
        true
    };

    // Phi nodes prefer an already-colored source's slot.
    if let Some(sources) = phi_info.sources(node) {
        for source in sources {
            let Some(src_name) = source.value.as_ssa() else { continue };
            let Some(&preferred) = assignments.get(src_name) else { continue };
            if let Some(&src_ty) = node_types.get(src_name) {
                if types_can_share(node_type, src_ty) && slot_available(preferred) {
                    return preferred;
                }
            }
        }
    }

    // Phi sources prefer their phi's slot.
    if let Some(phis) = source_to_phis.get(node) {
        for phi_name in phis {
            let Some(&preferred) = assignments.get(phi_name) else { continue };
            if let Some(&phi_ty) = node_types.get(phi_name) {
                if types_can_share(node_type, phi_ty) && slot_available(preferred) {
                    return preferred;
                }
            }
        }
    }

    let mut color = 0u16;
    loop {
        if slot_available(color) {
            return color;
        }
        color += 1;
    }
}

/// The verifier demands type consistency at merge points, which limits
/// sharing even between non-interfering values: refs only with refs, ints
/// only with ints (2 slots), byte and short freely.
fn types_can_share(t1: VmType, t2: VmType) -> bool {
    if t1 == VmType::Ref || t2 == VmType::Ref {
        return t1 == t2;
    }
    if t1 == VmType::Int || t2 == VmType::Int {
        return t1 == t2;
    }
    true
}

/// Base slot and type of the value occupying `slot`, if any.
fn slot_occupant(
    slot: u16,
    assignments: &FxHashMap<ValueName, u16>,
    node_types: &FxHashMap<ValueName, VmType>,
) -> Option<(u16, VmType)> {
    for (name, &base) in assignments {
        let ty = node_types[name];
        if base <= slot && slot < base + ty.slots() {
            return Some((base, ty));
        }
    }
    None
}
