//! Code generation: expression trees to target VM bytecode.
//!
//! - ops: the instruction layer, with compact encodings and stack effects
//! - api: the platform method registry calls classify against
//! - expr: the closed expression tree grammar between IR and bytecode
//! - build: per-block tree construction; all addressing and typing
//!   decisions happen here
//! - phi_moves: parallel move scheduling for phi elimination
//! - emit: tree walking, branch fusion, switch lowering, edge splitting
//! - peephole: fixed-order cleanup passes over the instruction list
//! - stack: exact operand stack depth by forward propagation
//! - pipeline: the module driver tying analyses and emission together
//!
//! Code generation never recovers: any unsupported shape is a fatal
//! [`opal_common::CodegenError`] naming the phase and function.

pub mod api;
pub mod build;
pub mod emit;
pub mod expr;
pub mod ops;
pub mod peephole;
pub mod phi_moves;
pub mod pipeline;
pub mod stack;

pub use api::{ApiRegistry, MethodInfo};
pub use build::BuildContext;
pub use emit::{compile_function, FunctionCode};
pub use expr::{ArrayRef, CastKind, Expr};
pub use ops::{Insn, Opcode, Operand};
pub use peephole::peephole;
pub use phi_moves::{build_phi_moves, schedule_phi_moves, MoveSrc, PhiMove, TempAllocator};
pub use pipeline::{compile_module, CompiledModule};
pub use stack::compute_max_stack;
