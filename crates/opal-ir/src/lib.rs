//! Typed SSA IR model for the Opal compiler.
//!
//! Pure data plus structural queries; all behavior lives in the analysis
//! and codegen crates. The front end constructs a [`module::Module`] once,
//! every downstream phase reads it immutably.
//!
//! ## Modules
//!
//! - [`types`]: VM value types, slot/byte widths, name newtypes
//! - [`value`]: operand values (SSA refs, constants, globals, GEPs)
//! - [`instr`]: the closed instruction enum
//! - [`module`]: blocks, functions, globals, module container
//! - [`debug`]: debug-type layout metadata for globals
//! - [`range`]: value-range metadata for narrowing

pub mod debug;
pub mod instr;
pub mod module;
pub mod range;
pub mod types;
pub mod value;

pub use debug::{DebugField, DebugType};
pub use instr::{BinaryOp, CastOp, CmpPred, Inst};
pub use module::{Block, Function, Global, GlobalInit, Module, Param};
pub use range::ValueRange;
pub use types::{BlockLabel, ValueName, VmType};
pub use value::{GepBase, GepSource, InlineGep, Value};
