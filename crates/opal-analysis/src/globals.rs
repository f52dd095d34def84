//! Global allocation into type-sharded static memory regions.
//!
//! The target has no heap and no general object model; module globals are
//! flattened into six statically-sized arrays. Mutable data lives in the
//! zero-initialized data regions, immutable initialized data in the const
//! regions filled once at install time:
//!
//! - `ByteData` / `ShortData` / `IntData` — mutable, zeroed
//! - `ConstByte` / `ConstShort` / `ConstInt` — immutable, initialized
//!
//! Struct globals are flattened column-wise: each field (recursively, for
//! nested structs and array fields) claims a contiguous run in the region
//! matching its scalar type, sized by the instance count. Debug-type
//! metadata is the authoritative layout source; a mutable global without
//! it cannot be placed and aborts compilation.

use rustc_hash::FxHashMap;
use serde::Serialize;

use opal_common::{AnalysisError, Limits, Phase};
use opal_ir::{DebugField, DebugType, Global, GlobalInit, Module, VmType};

/// One of the six static memory regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MemRegion {
    ByteData,
    ShortData,
    IntData,
    ConstByte,
    ConstShort,
    ConstInt,
}

pub const ALL_REGIONS: [MemRegion; 6] = [
    MemRegion::ByteData,
    MemRegion::ShortData,
    MemRegion::IntData,
    MemRegion::ConstByte,
    MemRegion::ConstShort,
    MemRegion::ConstInt,
];

impl MemRegion {
    pub fn element_type(&self) -> VmType {
        match self {
            Self::ByteData | Self::ConstByte => VmType::Byte,
            Self::ShortData | Self::ConstShort => VmType::Short,
            Self::IntData | Self::ConstInt => VmType::Int,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Self::ConstByte | Self::ConstShort | Self::ConstInt)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ByteData => "byte-data",
            Self::ShortData => "short-data",
            Self::IntData => "int-data",
            Self::ConstByte => "const-byte",
            Self::ConstShort => "const-short",
            Self::ConstInt => "const-int",
        }
    }

    fn for_type(ty: VmType, constant: bool) -> Option<MemRegion> {
        Some(match (ty, constant) {
            (VmType::Byte, false) => Self::ByteData,
            (VmType::Short, false) => Self::ShortData,
            (VmType::Int, false) => Self::IntData,
            (VmType::Byte, true) => Self::ConstByte,
            (VmType::Short, true) => Self::ConstShort,
            (VmType::Int, true) => Self::ConstInt,
            _ => return None,
        })
    }
}

/// Placement of a scalar or scalar-array global.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalInfo {
    pub name: String,
    pub region: MemRegion,
    pub offset: u32,
    /// Element count; 1 for plain scalars.
    pub count: u32,
}

/// One flattened struct field's placement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructFieldAlloc {
    /// Byte offset within one struct instance.
    pub byte_offset: u32,
    pub ty: VmType,
    pub region: MemRegion,
    pub offset: u32,
    /// Elements per instance; >1 for array fields.
    pub elem_count: u32,
}

/// A struct global flattened column-wise across the regions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocatedStruct {
    pub name: String,
    /// Sorted by `byte_offset`.
    pub fields: Vec<StructFieldAlloc>,
    /// Instance size in bytes, tail padding included.
    pub stride: u32,
    pub count: u32,
}

impl AllocatedStruct {
    /// The field covering `offset` bytes into one instance, if any.
    pub fn field_at_byte_offset(&self, offset: u32) -> Option<&StructFieldAlloc> {
        self.fields.iter().find(|f| {
            let end = f.byte_offset + f.elem_count * f.ty.byte_size();
            f.byte_offset <= offset && offset < end
        })
    }

    /// Split a whole-global byte offset into (field, instance index).
    ///
    /// `total = index * stride + field_offset`; `None` when the offset
    /// lands in padding or outside any declared field.
    pub fn decompose_byte_offset(&self, total: u32) -> Option<(&StructFieldAlloc, u32)> {
        if self.stride == 0 {
            return None;
        }
        let index = total / self.stride;
        let field_offset = total % self.stride;
        if index >= self.count {
            return None;
        }
        self.field_at_byte_offset(field_offset).map(|f| (f, index))
    }
}

/// Complete memory placement for a module.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationResult {
    pub globals: FxHashMap<String, GlobalInfo>,
    pub structs: FxHashMap<String, AllocatedStruct>,
    /// Element count of each region.
    pub region_sizes: FxHashMap<MemRegion, u32>,
    /// Packed initial element values of each const region.
    pub const_values: FxHashMap<MemRegion, Vec<i64>>,
}

impl AllocationResult {
    fn validate(&self, limits: &Limits) -> Result<(), AnalysisError> {
        for (&region, &size) in &self.region_sizes {
            let capacity = limits.max_region_bytes / region.element_type().byte_size();
            if size > capacity {
                return Err(AnalysisError::module(
                    Phase::Globals,
                    format!(
                        "region {} needs {size} elements, capacity is {capacity}",
                        region.name()
                    ),
                ));
            }
        }

        for region in ALL_REGIONS {
            // (start, end, owner), end exclusive
            let mut spans: Vec<(u32, u32, &str)> = Vec::new();
            for info in self.globals.values() {
                if info.region == region {
                    spans.push((info.offset, info.offset + info.count, &info.name));
                }
            }
            for st in self.structs.values() {
                for field in &st.fields {
                    if field.region == region {
                        let elems = field.elem_count * st.count;
                        spans.push((field.offset, field.offset + elems, &st.name));
                    }
                }
            }
            spans.sort();
            for pair in spans.windows(2) {
                let (_, end_a, name_a) = pair[0];
                let (start_b, _, name_b) = pair[1];
                if end_a > start_b {
                    return Err(AnalysisError::module(
                        Phase::Globals,
                        format!(
                            "overlapping allocations in {}: {name_a} and {name_b}",
                            region.name()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn global(&self, name: &str) -> Option<&GlobalInfo> {
        self.globals.get(name)
    }

    pub fn struct_global(&self, name: &str) -> Option<&AllocatedStruct> {
        self.structs.get(name)
    }
}

/// Place every module global into its region.
pub fn allocate_globals(module: &Module, limits: &Limits) -> Result<AllocationResult, AnalysisError> {
    let mut alloc = Allocator::default();

    for glob in &module.globals {
        alloc.place(glob)?;
    }

    let result = AllocationResult {
        globals: alloc.globals,
        structs: alloc.structs,
        region_sizes: alloc.offsets,
        const_values: alloc.const_data,
    };
    result.validate(limits)?;
    Ok(result)
}

#[derive(Default)]
struct Allocator {
    offsets: FxHashMap<MemRegion, u32>,
    const_data: FxHashMap<MemRegion, Vec<i64>>,
    globals: FxHashMap<String, GlobalInfo>,
    structs: FxHashMap<String, AllocatedStruct>,
}

impl Allocator {
    fn place(&mut self, glob: &Global) -> Result<(), AnalysisError> {
        if glob.is_constant {
            match &glob.initializer {
                Some(GlobalInit::IntArray { values, elem }) => {
                    return self.place_const_array(&glob.name, values, *elem);
                }
                Some(GlobalInit::ByteString(data)) => {
                    let values: Vec<i64> = data.iter().map(|&b| i64::from(b as i8)).collect();
                    return self.place_const_array(&glob.name, &values, VmType::Byte);
                }
                Some(GlobalInit::StructArray { field_types, field_values, count }) => {
                    return self.place_const_struct_array(
                        &glob.name,
                        field_types,
                        field_values,
                        *count,
                    );
                }
                Some(GlobalInit::Zero) | None => {
                    // Zero-valued constants place like mutable data.
                }
            }
        }

        let Some(debug_type) = &glob.debug_type else {
            return Err(AnalysisError::module(
                Phase::Globals,
                format!("global {} has no debug layout metadata", glob.name),
            ));
        };

        match debug_type {
            DebugType::Scalar { ty } => {
                let region = self.region_for(&glob.name, *ty, false)?;
                let offset = self.claim(region, 1);
                self.globals.insert(
                    glob.name.clone(),
                    GlobalInfo { name: glob.name.clone(), region, offset, count: 1 },
                );
            }
            DebugType::Array { element, count } => match element.as_ref() {
                DebugType::Scalar { ty } => {
                    let region = self.region_for(&glob.name, *ty, false)?;
                    let offset = self.claim(region, *count);
                    self.globals.insert(
                        glob.name.clone(),
                        GlobalInfo { name: glob.name.clone(), region, offset, count: *count },
                    );
                }
                DebugType::Struct { byte_size, fields, .. } => {
                    let st = self.place_struct(&glob.name, fields, *byte_size, *count)?;
                    self.structs.insert(glob.name.clone(), st);
                }
                DebugType::Array { .. } => {
                    return Err(AnalysisError::module(
                        Phase::Globals,
                        format!("global {}: nested array layouts are not supported", glob.name),
                    ));
                }
            },
            DebugType::Struct { byte_size, fields, .. } => {
                let st = self.place_struct(&glob.name, fields, *byte_size, 1)?;
                self.structs.insert(glob.name.clone(), st);
            }
        }
        Ok(())
    }

    fn place_const_array(
        &mut self,
        name: &str,
        values: &[i64],
        elem: VmType,
    ) -> Result<(), AnalysisError> {
        let region = self.region_for(name, elem, true)?;
        let count = values.len() as u32;
        let offset = self.claim(region, count);
        self.const_data.entry(region).or_default().extend_from_slice(values);
        self.globals.insert(
            name.to_string(),
            GlobalInfo { name: name.to_string(), region, offset, count },
        );
        Ok(())
    }

    /// Constant struct arrays land column-wise: one contiguous const-region
    /// run per field, holding that field's value for every instance.
    fn place_const_struct_array(
        &mut self,
        name: &str,
        field_types: &[VmType],
        field_values: &[Vec<i64>],
        count: u32,
    ) -> Result<(), AnalysisError> {
        if field_types.len() != field_values.len() {
            return Err(AnalysisError::module(
                Phase::Globals,
                format!("constant struct {name}: field type/value column mismatch"),
            ));
        }
        let mut fields = Vec::new();
        let mut byte_offset = 0u32;
        for (ty, values) in field_types.iter().zip(field_values) {
            if values.len() as u32 != count {
                return Err(AnalysisError::module(
                    Phase::Globals,
                    format!(
                        "constant struct {name}: field column has {} values for {count} instances",
                        values.len()
                    ),
                ));
            }
            let region = self.region_for(name, *ty, true)?;
            let offset = self.claim(region, count);
            self.const_data.entry(region).or_default().extend_from_slice(values);
            fields.push(StructFieldAlloc {
                byte_offset,
                ty: *ty,
                region,
                offset,
                elem_count: 1,
            });
            byte_offset += ty.byte_size();
        }
        self.structs.insert(
            name.to_string(),
            AllocatedStruct { name: name.to_string(), fields, stride: byte_offset, count },
        );
        Ok(())
    }

    fn place_struct(
        &mut self,
        name: &str,
        fields: &[DebugField],
        stride: u32,
        count: u32,
    ) -> Result<AllocatedStruct, AnalysisError> {
        let mut out = Vec::new();
        self.collect_fields(name, fields, 0, count, &mut out)?;
        out.sort_by_key(|f| f.byte_offset);
        Ok(AllocatedStruct { name: name.to_string(), fields: out, stride, count })
    }

    /// Recursively flatten struct fields, nested structs included. Each
    /// scalar or scalar-array field claims `count` instances' worth of
    /// elements in its region.
    fn collect_fields(
        &mut self,
        name: &str,
        fields: &[DebugField],
        base_offset: u32,
        count: u32,
        out: &mut Vec<StructFieldAlloc>,
    ) -> Result<(), AnalysisError> {
        for field in fields {
            let byte_offset = base_offset + field.byte_offset;
            match &field.ty {
                DebugType::Scalar { ty } => {
                    let region = self.region_for(name, *ty, false)?;
                    let offset = self.claim(region, count);
                    out.push(StructFieldAlloc {
                        byte_offset,
                        ty: *ty,
                        region,
                        offset,
                        elem_count: 1,
                    });
                }
                DebugType::Array { element, count: arr_count } => match element.as_ref() {
                    DebugType::Scalar { ty } => {
                        let region = self.region_for(name, *ty, false)?;
                        let offset = self.claim(region, count * arr_count);
                        out.push(StructFieldAlloc {
                            byte_offset,
                            ty: *ty,
                            region,
                            offset,
                            elem_count: *arr_count,
                        });
                    }
                    DebugType::Struct { fields: inner, .. } => {
                        self.collect_fields(
                            name,
                            inner,
                            byte_offset,
                            count * arr_count,
                            out,
                        )?;
                    }
                    DebugType::Array { .. } => {
                        return Err(AnalysisError::module(
                            Phase::Globals,
                            format!("global {name}: nested array layouts are not supported"),
                        ));
                    }
                },
                DebugType::Struct { fields: inner, .. } => {
                    self.collect_fields(name, inner, byte_offset, count, out)?;
                }
            }
        }
        Ok(())
    }

    fn claim(&mut self, region: MemRegion, elems: u32) -> u32 {
        let offset = self.offsets.entry(region).or_insert(0);
        let start = *offset;
        *offset += elems;
        start
    }

    fn region_for(
        &self,
        name: &str,
        ty: VmType,
        constant: bool,
    ) -> Result<MemRegion, AnalysisError> {
        MemRegion::for_type(ty, constant).ok_or_else(|| {
            AnalysisError::module(
                Phase::Globals,
                format!("global {name}: no memory region holds {ty} values"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_with(globals: Vec<Global>) -> Module {
        Module::new("m", vec![], globals)
    }

    #[test]
    fn scalars_shard_by_type() {
        let module = module_with(vec![
            Global {
                name: "a".into(),
                is_constant: false,
                initializer: None,
                debug_type: Some(DebugType::scalar(VmType::Short)),
            },
            Global {
                name: "b".into(),
                is_constant: false,
                initializer: None,
                debug_type: Some(DebugType::scalar(VmType::Int)),
            },
            Global {
                name: "c".into(),
                is_constant: false,
                initializer: None,
                debug_type: Some(DebugType::scalar(VmType::Short)),
            },
        ]);
        let result = allocate_globals(&module, &Limits::default()).unwrap();
        assert_eq!(result.globals["a"].region, MemRegion::ShortData);
        assert_eq!(result.globals["a"].offset, 0);
        assert_eq!(result.globals["b"].region, MemRegion::IntData);
        assert_eq!(result.globals["b"].offset, 0);
        assert_eq!(result.globals["c"].offset, 1);
        assert_eq!(result.region_sizes[&MemRegion::ShortData], 2);
        assert_eq!(result.region_sizes[&MemRegion::IntData], 1);
    }

    #[test]
    fn mutable_global_without_layout_is_fatal() {
        let module = module_with(vec![Global {
            name: "g".into(),
            is_constant: false,
            initializer: None,
            debug_type: None,
        }]);
        let err = allocate_globals(&module, &Limits::default()).unwrap_err();
        assert!(err.to_string().contains("debug layout"));
    }

    #[test]
    fn const_array_fills_const_region() {
        let module = module_with(vec![Global {
            name: "table".into(),
            is_constant: true,
            initializer: Some(GlobalInit::IntArray {
                values: vec![10, 20, 30],
                elem: VmType::Short,
            }),
            debug_type: None,
        }]);
        let result = allocate_globals(&module, &Limits::default()).unwrap();
        let info = &result.globals["table"];
        assert_eq!(info.region, MemRegion::ConstShort);
        assert_eq!(info.count, 3);
        assert_eq!(result.const_values[&MemRegion::ConstShort], vec![10, 20, 30]);
    }

    #[test]
    fn tagged_value_struct_flattens_by_field_type() {
        // struct { byte tag; short value; } entries[8], padded to 4 bytes.
        let module = module_with(vec![Global {
            name: "entries".into(),
            is_constant: false,
            initializer: None,
            debug_type: Some(DebugType::array(
                DebugType::Struct {
                    name: "Entry".into(),
                    byte_size: 4,
                    fields: vec![
                        DebugField {
                            name: "tag".into(),
                            byte_offset: 0,
                            ty: DebugType::scalar(VmType::Byte),
                        },
                        DebugField {
                            name: "value".into(),
                            byte_offset: 2,
                            ty: DebugType::scalar(VmType::Short),
                        },
                    ],
                },
                8,
            )),
        }]);
        let result = allocate_globals(&module, &Limits::default()).unwrap();
        let st = &result.structs["entries"];
        assert_eq!(st.count, 8);
        assert_eq!(st.stride, 4);
        assert_eq!(st.fields.len(), 2);
        assert_eq!(st.fields[0].region, MemRegion::ByteData);
        assert_eq!(st.fields[1].region, MemRegion::ShortData);
        // 8 tags in the byte region, 8 values in the short region.
        assert_eq!(result.region_sizes[&MemRegion::ByteData], 8);
        assert_eq!(result.region_sizes[&MemRegion::ShortData], 8);

        // instance 3, field `value`: byte offset 3*4 + 2.
        let (field, index) = st.decompose_byte_offset(14).unwrap();
        assert_eq!(field.ty, VmType::Short);
        assert_eq!(index, 3);
        // Offset 1 lands in padding between tag and value.
        assert!(st.field_at_byte_offset(1).is_none());
    }

    #[test]
    fn nested_struct_fields_flatten_recursively() {
        // struct Outer { short a; struct { byte x; byte y; } inner; }
        let module = module_with(vec![Global {
            name: "o".into(),
            is_constant: false,
            initializer: None,
            debug_type: Some(DebugType::Struct {
                name: "Outer".into(),
                byte_size: 4,
                fields: vec![
                    DebugField {
                        name: "a".into(),
                        byte_offset: 0,
                        ty: DebugType::scalar(VmType::Short),
                    },
                    DebugField {
                        name: "inner".into(),
                        byte_offset: 2,
                        ty: DebugType::Struct {
                            name: "Inner".into(),
                            byte_size: 2,
                            fields: vec![
                                DebugField {
                                    name: "x".into(),
                                    byte_offset: 0,
                                    ty: DebugType::scalar(VmType::Byte),
                                },
                                DebugField {
                                    name: "y".into(),
                                    byte_offset: 1,
                                    ty: DebugType::scalar(VmType::Byte),
                                },
                            ],
                        },
                    },
                ],
            }),
        }]);
        let result = allocate_globals(&module, &Limits::default()).unwrap();
        let st = &result.structs["o"];
        assert_eq!(st.fields.len(), 3);
        assert_eq!(st.fields[1].byte_offset, 2);
        assert_eq!(st.fields[2].byte_offset, 3);
        assert_eq!(result.region_sizes[&MemRegion::ByteData], 2);
    }

    #[test]
    fn oversized_region_is_rejected() {
        let module = module_with(vec![Global {
            name: "big".into(),
            is_constant: false,
            initializer: None,
            debug_type: Some(DebugType::array(DebugType::scalar(VmType::Short), 20000)),
        }]);
        // 20000 shorts = 40000 bytes > 32767.
        let err = allocate_globals(&module, &Limits::default()).unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn const_struct_array_packs_columns() {
        let module = module_with(vec![Global {
            name: "pairs".into(),
            is_constant: true,
            initializer: Some(GlobalInit::StructArray {
                field_types: vec![VmType::Byte, VmType::Short],
                field_values: vec![vec![1, 2], vec![100, 200]],
                count: 2,
            }),
            debug_type: None,
        }]);
        let result = allocate_globals(&module, &Limits::default()).unwrap();
        let st = &result.structs["pairs"];
        assert_eq!(st.fields[0].region, MemRegion::ConstByte);
        assert_eq!(st.fields[1].region, MemRegion::ConstShort);
        assert_eq!(result.const_values[&MemRegion::ConstByte], vec![1, 2]);
        assert_eq!(result.const_values[&MemRegion::ConstShort], vec![100, 200]);
    }
}
