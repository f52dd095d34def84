//! Call graph construction and ordering.
//!
//! Builds caller-to-callee edges over in-module direct calls, rejects
//! recursion (transient storage is hoisted to static globals, so a
//! function's activation must never nest with itself), and produces the
//! topological order the inter-procedural passes walk: callees before
//! callers, ties broken by declaration order for reproducibility.

use rustc_hash::{FxHashMap, FxHashSet};

use opal_common::{AnalysisError, Phase};
use opal_ir::{Inst, Module};

/// Call graph with a precomputed topological order.
#[derive(Debug, Clone)]
pub struct CallGraph {
    /// Callees of each function, in first-call-site order, deduplicated.
    pub edges: FxHashMap<String, Vec<String>>,
    /// Callees before callers.
    pub topological_order: Vec<String>,
}

/// Build the call graph and topological order for a module.
///
/// External calls (names not defined in the module) are excluded. Any
/// cycle, including a self-call, is a fatal error carrying the cycle path.
pub fn build_call_graph(module: &Module) -> Result<CallGraph, AnalysisError> {
    let edges = extract_call_edges(module);
    let order = topological_sort(module, &edges)?;
    Ok(CallGraph { edges, topological_order: order })
}

fn extract_call_edges(module: &Module) -> FxHashMap<String, Vec<String>> {
    let mut edges: FxHashMap<String, Vec<String>> = FxHashMap::default();
    for func in &module.functions {
        let callees = edges.entry(func.name.clone()).or_default();
        for block in &func.blocks {
            for inst in &block.instrs {
                if let Inst::Call { callee, .. } = inst {
                    if module.function(callee).is_some() && !callees.contains(callee) {
                        callees.push(callee.clone());
                    }
                }
            }
        }
    }
    edges
}

/// DFS postorder: callees pushed before their callers. Roots are visited
/// in declaration order, callees in call-site order, so the result is
/// deterministic for a given module.
fn topological_sort(
    module: &Module,
    edges: &FxHashMap<String, Vec<String>>,
) -> Result<Vec<String>, AnalysisError> {
    let mut visited: FxHashSet<String> = FxHashSet::default();
    let mut on_path: FxHashSet<String> = FxHashSet::default();
    let mut order: Vec<String> = Vec::with_capacity(module.functions.len());
    let mut path: Vec<String> = Vec::new();

    fn visit(
        node: &str,
        edges: &FxHashMap<String, Vec<String>>,
        visited: &mut FxHashSet<String>,
        on_path: &mut FxHashSet<String>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), AnalysisError> {
        if on_path.contains(node) {
            let start = path.iter().position(|n| n == node).unwrap_or(0);
            let mut cycle: Vec<&str> = path[start..].iter().map(String::as_str).collect();
            cycle.push(node);
            return Err(AnalysisError::module(
                Phase::CallGraph,
                format!(
                    "recursion detected: {} (recursion is not supported because \
                     transient storage is hoisted to static globals)",
                    cycle.join(" -> ")
                ),
            ));
        }
        if visited.contains(node) {
            return Ok(());
        }

        on_path.insert(node.to_string());
        path.push(node.to_string());
        if let Some(callees) = edges.get(node) {
            for callee in callees {
                visit(callee, edges, visited, on_path, path, order)?;
            }
        }
        path.pop();
        on_path.remove(node);
        visited.insert(node.to_string());
        order.push(node.to_string());
        Ok(())
    }

    for func in &module.functions {
        if !visited.contains(func.name.as_str()) {
            visit(&func.name, edges, &mut visited, &mut on_path, &mut path, &mut order)?;
        }
    }
    Ok(order)
}

/// Per-function frame cost: (local slots, operand stack slots).
pub type FrameSizes = FxHashMap<String, (u32, u32)>;

/// Worst-case cumulative frame cost from any entry point.
///
/// The target VM keeps every caller's locals live while only the leaf's
/// operand stack is active, so a chain `a -> b -> c` costs
/// `locals(a) + locals(b) + locals(c) + stack(c)`. Memoized DFS over the
/// (already acyclic) call graph.
pub fn max_frame_depth(
    graph: &CallGraph,
    frame_sizes: &FrameSizes,
    entry_points: &[String],
) -> (u32, Vec<String>) {
    let mut memo: FxHashMap<String, (u32, Vec<String>)> = FxHashMap::default();

    fn compute(
        func: &str,
        graph: &CallGraph,
        frame_sizes: &FrameSizes,
        memo: &mut FxHashMap<String, (u32, Vec<String>)>,
    ) -> (u32, Vec<String>) {
        if let Some(hit) = memo.get(func) {
            return hit.clone();
        }
        let Some(&(locals, stack)) = frame_sizes.get(func) else {
            return (0, Vec::new());
        };

        let callees: Vec<&String> = graph
            .edges
            .get(func)
            .map(|c| c.iter().filter(|c| frame_sizes.contains_key(c.as_str())).collect())
            .unwrap_or_default();

        let result = if callees.is_empty() {
            (locals + stack, vec![func.to_string()])
        } else {
            let mut deepest: (u32, Vec<String>) = (0, Vec::new());
            for callee in callees {
                let sub = compute(callee, graph, frame_sizes, memo);
                if sub.0 > deepest.0 {
                    deepest = sub;
                }
            }
            let mut chain = vec![func.to_string()];
            chain.extend(deepest.1);
            (locals + deepest.0, chain)
        };

        memo.insert(func.to_string(), result.clone());
        result
    }

    let mut max = (0, Vec::new());
    for entry in entry_points {
        if frame_sizes.contains_key(entry.as_str()) {
            let candidate = compute(entry, graph, frame_sizes, &mut memo);
            if candidate.0 > max.0 {
                max = candidate;
            }
        }
    }
    max
}

/// Enforce the cumulative frame budget, with a per-chain breakdown on
/// failure.
pub fn validate_frame_depth(
    graph: &CallGraph,
    frame_sizes: &FrameSizes,
    entry_points: &[String],
    budget: u32,
) -> Result<(), AnalysisError> {
    let (depth, chain) = max_frame_depth(graph, frame_sizes, entry_points);
    if depth <= budget {
        return Ok(());
    }

    let mut msg = format!("frame depth {depth} exceeds budget {budget}\n");
    msg.push_str(&format!("call chain: {}\n", chain.join(" -> ")));
    for (i, func) in chain.iter().enumerate() {
        let (locals, stack) = frame_sizes.get(func.as_str()).copied().unwrap_or((0, 0));
        if i == chain.len() - 1 {
            msg.push_str(&format!(
                "  {func}: {locals} locals + {stack} stack = {}\n",
                locals + stack
            ));
        } else {
            msg.push_str(&format!("  {func}: {locals} locals\n"));
        }
    }
    msg.push_str(&format!("total: {depth}"));
    Err(AnalysisError::module(Phase::CallGraph, msg))
}
