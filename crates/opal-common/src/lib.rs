//! Shared types for the Opal compiler.
//!
//! This crate holds the pieces every other compiler crate needs:
//!
//! - [`error`]: the phase-scoped fatal error taxonomy
//! - [`limits`]: target VM resource limits
//!
//! Compilation is all-or-nothing: every phase either produces a validated
//! output or aborts with a phase-scoped error. Nothing in this crate (or in
//! the phases built on it) performs I/O or holds global state.

pub mod error;
pub mod limits;

pub use error::{AnalysisError, CodegenError, Phase};
pub use limits::Limits;
