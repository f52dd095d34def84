//! The module compilation pipeline.
//!
//! Fixed phase order:
//!
//! 1. IR validation
//! 2. call graph and topological order (recursion is fatal)
//! 3. global allocation into the typed regions
//! 4. narrowing per function in callee-first order, so callers see
//!    which callee parameters accept narrow arguments
//! 5. per function: phi sources, escape analysis, interference,
//!    coloring, phi temp bounds, locals, tree building and emission
//! 6. worst-case frame depth over the call graph, using the real
//!    `max_locals`/`max_stack` of the finished code
//!
//! Any phase error aborts the whole compilation; there is no partial
//! output.

use rustc_hash::FxHashMap;
use serde::Serialize;

use opal_analysis::{
    allocate_globals, analyze_escapes, analyze_narrowing, analyze_phis, build_call_graph,
    build_function_locals, build_interference_graph, color_graph, compute_phi_temps,
    validate_frame_depth, AllocationResult, FrameSizes, MemRegion, ParamNarrowing,
};
use opal_common::{CodegenError, Limits, Phase};
use opal_ir::{Module, ValueName, VmType};

use crate::api::ApiRegistry;
use crate::build::{register_width, BuildContext};
use crate::emit::{compile_function, FunctionCode};

/// Finished bytecode and memory layout for a whole module.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledModule {
    pub name: String,
    pub functions: FxHashMap<String, FunctionCode>,
    pub allocation: AllocationResult,
}

pub fn compile_module(
    module: &Module,
    registry: &ApiRegistry,
    user_method_cp: &FxHashMap<String, u16>,
    region_cp: &FxHashMap<MemRegion, u16>,
    limits: &Limits,
) -> Result<CompiledModule, CodegenError> {
    module.validate()?;
    let call_graph = build_call_graph(module)?;
    let allocation = allocate_globals(module, limits)?;

    // Callee-first narrowing: a caller may pass narrow arguments exactly
    // where the callee's own analysis kept the parameter narrow.
    let mut param_narrowing = ParamNarrowing::default();
    let mut narrowings = FxHashMap::default();
    for name in &call_graph.topological_order {
        let func = module
            .function(name)
            .ok_or_else(|| CodegenError::new(Phase::CallGraph, name, "ordered function not in module"))?;
        let narrowing = analyze_narrowing(func, &param_narrowing)?;
        param_narrowing.record(func, &narrowing);
        narrowings.insert(name.clone(), narrowing);
    }

    let mut functions = FxHashMap::default();
    let mut frame_sizes: FrameSizes = FxHashMap::default();
    for func in &module.functions {
        let narrowing = &narrowings[&func.name];
        let phi_info = analyze_phis(func);
        let escapes = analyze_escapes(func, &phi_info);
        let graph = build_interference_graph(func, &escapes, narrowing)?;

        let param_slots = func.param_slots();
        let param_types: FxHashMap<ValueName, VmType> = func
            .params
            .iter()
            .map(|p| {
                (p.name.clone(), register_width(narrowing.storage_type(&p.name, p.ty)))
            })
            .collect();
        let slots = color_graph(&func.name, &graph, &phi_info, &param_slots, &param_types, limits)?;

        // Upper-bound the scratch slots phi cycles may claim before
        // spending any emission work on an oversized function.
        let temps = compute_phi_temps(func, &phi_info, &slots);
        if temps.first_temp_slot + temps.total > limits.max_locals_hard {
            return Err(CodegenError::new(
                Phase::PhiTemps,
                &func.name,
                format!(
                    "{} slots plus {} phi temps exceed the frame limit {}",
                    temps.first_temp_slot, temps.total, limits.max_locals_hard
                ),
            ));
        }

        let locals = build_function_locals(func, narrowing, &escapes, &slots)?;
        let build = BuildContext::new(func, &locals, &allocation, registry, region_cp, user_method_cp);
        let code = compile_function(&build, &phi_info, limits)?;

        frame_sizes.insert(func.name.clone(), (code.max_locals as u32, code.max_stack as u32));
        functions.insert(func.name.clone(), code);
    }

    // Entry points: functions nothing in the module calls.
    let called: rustc_hash::FxHashSet<&str> = call_graph
        .edges
        .values()
        .flatten()
        .map(String::as_str)
        .collect();
    let entry_points: Vec<String> = module
        .functions
        .iter()
        .map(|f| f.name.clone())
        .filter(|name| !called.contains(name.as_str()))
        .collect();
    validate_frame_depth(&call_graph, &frame_sizes, &entry_points, limits.max_call_depth as u32)?;

    Ok(CompiledModule { name: module.name.clone(), functions, allocation })
}
