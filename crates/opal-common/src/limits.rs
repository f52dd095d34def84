use serde::{Deserialize, Serialize};

/// Resource limits for the target VM.
///
/// Soft limits trigger diagnostics upstream; hard limits abort compilation.
/// The defaults match the reference interpreter's frame layout: at most 255
/// local slots and 255 operand-stack slots per frame, with a much smaller
/// comfortable working set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Locals count above which a function is considered oversized.
    pub max_locals_soft: u16,
    /// Absolute per-frame local slot limit.
    pub max_locals_hard: u16,
    /// Operand stack depth above which a function is considered oversized.
    pub max_stack_soft: u16,
    /// Absolute per-frame operand stack limit.
    pub max_stack_hard: u16,
    /// Budget for cumulative frame slots along any call chain.
    pub max_call_depth: u16,
    /// Case density at or above which a switch compiles to a table switch.
    pub switch_density_threshold: f64,
    /// Largest case-value range a table switch may span.
    pub switch_max_range: i64,
    /// Byte capacity of each typed static memory region.
    pub max_region_bytes: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_locals_soft: 64,
            max_locals_hard: 255,
            max_stack_soft: 16,
            max_stack_hard: 255,
            max_call_depth: 64,
            switch_density_threshold: 0.5,
            switch_max_range: 256,
            max_region_bytes: 32767,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fit_the_target_frame_model() {
        let limits = Limits::default();
        assert!(limits.max_locals_soft <= limits.max_locals_hard);
        assert!(limits.max_stack_soft <= limits.max_stack_hard);
        assert_eq!(limits.max_locals_hard, 255);
        assert_eq!(limits.max_region_bytes, 32767);
    }
}
