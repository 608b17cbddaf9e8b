//! Data type definitions

/// Element types a tensor handed to the all-to-all may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DType {
    UInt8 = 0,
    Int8 = 1,
    UInt16 = 2,
    Int16 = 3,
    UInt32 = 4,
    Int32 = 5,
    UInt64 = 6,
    Int64 = 7,
    Float16 = 8,
    BFloat16 = 9,
    Float32 = 10,
    Float64 = 11,
}

impl DType {
    /// Size in bytes
    pub const fn size(&self) -> usize {
        match self {
            DType::UInt8 | DType::Int8 => 1,
            DType::UInt16 | DType::Int16 | DType::Float16 | DType::BFloat16 => 2,
            DType::UInt32 | DType::Int32 | DType::Float32 => 4,
            DType::UInt64 | DType::Int64 | DType::Float64 => 8,
        }
    }

    /// Parse the short names used by torch / numpy (`"bf16"`, `"float16"`, ...)
    pub fn from_name(name: &str) -> Option<Self> {
        let dtype = match name {
            "uint8" | "u8" => DType::UInt8,
            "int8" | "i8" => DType::Int8,
            "uint16" | "u16" => DType::UInt16,
            "int16" | "i16" => DType::Int16,
            "uint32" | "u32" => DType::UInt32,
            "int32" | "i32" => DType::Int32,
            "uint64" | "u64" => DType::UInt64,
            "int64" | "i64" => DType::Int64,
            "float16" | "half" | "f16" => DType::Float16,
            "bfloat16" | "bf16" => DType::BFloat16,
            "float32" | "float" | "f32" => DType::Float32,
            "float64" | "double" | "f64" => DType::Float64,
            _ => return None,
        };
        Some(dtype)
    }
}
