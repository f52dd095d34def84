//! Platform API registry.
//!
//! Maps intrinsic names the front end emits (e.g. `vm_util_array_fill`) to
//! the platform methods that implement them. The registry is plain data,
//! built by the embedder and passed by reference through the pipeline;
//! there is no global lookup table.

use rustc_hash::FxHashMap;
use serde::Serialize;

use opal_ir::VmType;

/// A callable platform method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodInfo {
    /// Intrinsic name used in IR `call` instructions.
    pub name: String,
    /// Owning class on the target.
    pub class: String,
    /// Virtual method token; ignored for static methods.
    pub token: u8,
    /// Target-format signature descriptor.
    pub descriptor: String,
    pub is_static: bool,
    pub param_types: Vec<VmType>,
    pub return_type: VmType,
    /// Constant pool index of the method reference.
    pub cp_index: u16,
}

impl MethodInfo {
    /// Operand slots consumed by a call, counting wide params twice.
    pub fn arg_slots(&self) -> u16 {
        self.param_types.iter().map(|t| t.slots()).sum()
    }

    pub fn ret_slots(&self) -> u16 {
        self.return_type.slots()
    }
}

/// Name-keyed method lookup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiRegistry {
    methods: FxHashMap<String, MethodInfo>,
}

impl ApiRegistry {
    pub fn new(methods: Vec<MethodInfo>) -> Self {
        let methods = methods.into_iter().map(|m| (m.name.clone(), m)).collect();
        Self { methods }
    }

    pub fn lookup(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }
}
