//! Analyses over the SSA IR, run per function ahead of code generation.
//!
//! - call graph: rejects recursion, orders functions bottom-up
//! - phi analysis: per-phi (value, predecessor) source pairs
//! - narrowing: which 32-bit values fit in 16-bit slots
//! - escape: which values outlive their expression tree and need slots
//! - interference + coloring: liveness-based slot assignment
//! - phi temps: scratch-slot budget for parallel phi moves
//! - locals: the unified per-function view codegen consumes
//! - globals: static memory region placement for the whole module
//!
//! Each phase produces a self-validating output; a failed invariant is a
//! fatal [`opal_common::AnalysisError`], never a silently wrong result.

pub mod callgraph;
pub mod color;
pub mod dataflow;
pub mod escape;
pub mod globals;
pub mod interference;
pub mod locals;
pub mod narrowing;
pub mod phi;
pub mod phi_temps;

pub use callgraph::{build_call_graph, max_frame_depth, validate_frame_depth, CallGraph, FrameSizes};
pub use color::{color_graph, SlotAssignments};
pub use escape::{analyze_escapes, EscapeInfo};
pub use globals::{
    allocate_globals, AllocatedStruct, AllocationResult, GlobalInfo, MemRegion, StructFieldAlloc,
    ALL_REGIONS,
};
pub use interference::{build_interference_graph, InterferenceGraph};
pub use locals::{build_function_locals, FunctionLocals};
pub use narrowing::{analyze_narrowing, NarrowingInfo, ParamNarrowing};
pub use phi::{analyze_phis, PhiInfo, PhiSource};
pub use phi_temps::{compute_phi_temps, TempSlots};
