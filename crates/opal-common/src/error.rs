use std::fmt;

use serde::Serialize;

/// The pipeline phase an error originated in.
///
/// Every fatal error carries its phase so a failure reads as
/// `[phase] in function: message` without the caller threading context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    IrValidation,
    CallGraph,
    PhiAnalysis,
    Narrowing,
    Escape,
    Interference,
    Coloring,
    PhiTemps,
    Locals,
    Globals,
    TreeBuild,
    Emit,
    Peephole,
    Stack,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IrValidation => "ir",
            Self::CallGraph => "callgraph",
            Self::PhiAnalysis => "phi",
            Self::Narrowing => "narrowing",
            Self::Escape => "escape",
            Self::Interference => "interference",
            Self::Coloring => "coloring",
            Self::PhiTemps => "phi-temps",
            Self::Locals => "locals",
            Self::Globals => "globals",
            Self::TreeBuild => "tree-build",
            Self::Emit => "emit",
            Self::Peephole => "peephole",
            Self::Stack => "stack",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fatal analysis error.
///
/// Analyses either fully succeed, producing a validated output, or abort
/// the whole compilation. There is no recovery and no partial output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisError {
    pub phase: Phase,
    /// Function the error occurred in; empty for module-level errors.
    pub function: String,
    pub message: String,
}

impl AnalysisError {
    pub fn new(phase: Phase, function: impl Into<String>, message: impl Into<String>) -> Self {
        Self { phase, function: function.into(), message: message.into() }
    }

    /// A module-level error with no single function in scope.
    pub fn module(phase: Phase, message: impl Into<String>) -> Self {
        Self { phase, function: String::new(), message: message.into() }
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.function.is_empty() {
            write!(f, "[{}] {}", self.phase, self.message)
        } else {
            write!(f, "[{}] in {}: {}", self.phase, self.function, self.message)
        }
    }
}

impl std::error::Error for AnalysisError {}

/// A fatal code generation error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodegenError {
    pub phase: Phase,
    pub function: String,
    pub message: String,
}

impl CodegenError {
    pub fn new(phase: Phase, function: impl Into<String>, message: impl Into<String>) -> Self {
        Self { phase, function: function.into(), message: message.into() }
    }
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] in {}: {}", self.phase, self.function, self.message)
    }
}

impl std::error::Error for CodegenError {}

impl From<AnalysisError> for CodegenError {
    fn from(err: AnalysisError) -> Self {
        Self { phase: err.phase, function: err.function, message: err.message }
    }
}
