//! Phi source extraction.
//!
//! Pairs each phi result with its ordered (value, predecessor) sources so
//! downstream phases can resolve "which value arrives along this edge" in
//! O(1) without re-walking the block.

use rustc_hash::FxHashMap;

use opal_common::{AnalysisError, Phase};
use opal_ir::{Function, Inst, Value, ValueName, VmType};

/// One incoming phi edge.
#[derive(Debug, Clone, PartialEq)]
pub struct PhiSource {
    pub value: Value,
    pub from_block: opal_ir::BlockLabel,
}

/// Phi sources for every phi in a function.
#[derive(Debug, Clone, Default)]
pub struct PhiInfo {
    sources: FxHashMap<ValueName, Vec<PhiSource>>,
    types: FxHashMap<ValueName, VmType>,
}

impl PhiInfo {
    pub fn is_phi(&self, name: &ValueName) -> bool {
        self.sources.contains_key(name)
    }

    pub fn sources(&self, name: &ValueName) -> Option<&[PhiSource]> {
        self.sources.get(name).map(Vec::as_slice)
    }

    pub fn phi_type(&self, name: &ValueName) -> Option<VmType> {
        self.types.get(name).copied()
    }

    pub fn phi_names(&self) -> impl Iterator<Item = &ValueName> {
        self.sources.keys()
    }

    /// The value arriving at phi `name` along the edge from `pred`.
    ///
    /// A missing pair is a front-end bug (a phi without an entry for one of
    /// its genuine predecessors); it surfaces here when phi-move computation
    /// asks, not during extraction.
    pub fn source_for_block(
        &self,
        func_name: &str,
        name: &ValueName,
        pred: &str,
    ) -> Result<&Value, AnalysisError> {
        self.sources
            .get(name)
            .and_then(|sources| {
                sources
                    .iter()
                    .find(|s| s.from_block.as_str() == pred)
                    .map(|s| &s.value)
            })
            .ok_or_else(|| {
                AnalysisError::new(
                    Phase::PhiAnalysis,
                    func_name,
                    format!("phi {name} has no incoming value from predecessor {pred}"),
                )
            })
    }
}

/// Extract phi sources for every phi in `func`, preserving source order.
pub fn analyze_phis(func: &Function) -> PhiInfo {
    let mut info = PhiInfo::default();
    for block in &func.blocks {
        for inst in block.phi_instrs() {
            if let Inst::Phi { result, ty, sources } = inst {
                let extracted = sources
                    .iter()
                    .map(|(value, label)| PhiSource {
                        value: value.clone(),
                        from_block: label.clone(),
                    })
                    .collect();
                info.sources.insert(result.clone(), extracted);
                info.types.insert(result.clone(), *ty);
            }
        }
    }
    info
}
