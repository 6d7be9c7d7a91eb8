//! Element layout tags and scalar kernel arguments.

use core::fmt::Display;
use half::{bf16, f16};

/// Element layout of host buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DType {
    BF16,
    F16,
    F32,
    F64,
    U8,
    I8,
    I16,
    U32,
    I32,
    I64,
}

impl DType {
    /// Size of one element in bytes
    #[must_use]
    pub const fn byte_size(&self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::BF16 | DType::F16 | DType::I16 => 2,
            DType::F32 | DType::U32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            DType::BF16 => "BF16",
            DType::F16 => "F16",
            DType::F32 => "F32",
            DType::F64 => "F64",
            DType::U8 => "U8",
            DType::I8 => "I8",
            DType::I16 => "I16",
            DType::U32 => "U32",
            DType::I32 => "I32",
            DType::I64 => "I64",
        })
    }
}

/// Element types that can live in host buffers and be passed to kernels
pub trait Scalar: bytemuck::Pod + core::fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Layout tag of this type
    fn dtype() -> DType;
}

macro_rules! impl_scalar {
    ($($t:ty => $d:ident),* $(,)?) => {
        $(impl Scalar for $t {
            fn dtype() -> DType {
                DType::$d
            }
        })*
    };
}

impl_scalar!(
    bf16 => BF16,
    f16 => F16,
    f32 => F32,
    f64 => F64,
    u8 => U8,
    i8 => I8,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    i64 => I64,
);

/// Scalar kernel argument, stored as raw bits so that it is `Eq` and `Hash`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Constant {
    BF16(u16),
    F16(u16),
    F32(u32),
    F64(u64),
    U8(u8),
    I8(i8),
    I16(i16),
    U32(u32),
    I32(i32),
    I64(i64),
}

impl Constant {
    /// Stores scalar as constant
    #[must_use]
    pub fn new<T: Scalar>(x: T) -> Constant {
        let bytes = bytemuck::bytes_of(&x);
        match T::dtype() {
            DType::BF16 => Constant::BF16(u16::from_ne_bytes([bytes[0], bytes[1]])),
            DType::F16 => Constant::F16(u16::from_ne_bytes([bytes[0], bytes[1]])),
            DType::F32 => Constant::F32(bytemuck::pod_read_unaligned(bytes)),
            DType::F64 => Constant::F64(bytemuck::pod_read_unaligned(bytes)),
            DType::U8 => Constant::U8(bytes[0]),
            DType::I8 => Constant::I8(bytemuck::pod_read_unaligned(bytes)),
            DType::I16 => Constant::I16(bytemuck::pod_read_unaligned(bytes)),
            DType::U32 => Constant::U32(bytemuck::pod_read_unaligned(bytes)),
            DType::I32 => Constant::I32(bytemuck::pod_read_unaligned(bytes)),
            DType::I64 => Constant::I64(bytemuck::pod_read_unaligned(bytes)),
        }
    }

    #[must_use]
    pub const fn dtype(&self) -> DType {
        match self {
            Constant::BF16(_) => DType::BF16,
            Constant::F16(_) => DType::F16,
            Constant::F32(_) => DType::F32,
            Constant::F64(_) => DType::F64,
            Constant::U8(_) => DType::U8,
            Constant::I8(_) => DType::I8,
            Constant::I16(_) => DType::I16,
            Constant::U32(_) => DType::U32,
            Constant::I32(_) => DType::I32,
            Constant::I64(_) => DType::I64,
        }
    }

    /// Reads the constant back as `T`, returns None if dtypes differ
    #[must_use]
    pub fn get<T: Scalar>(&self) -> Option<T> {
        if T::dtype() != self.dtype() {
            return None;
        }
        let bytes: &[u8] = match self {
            Constant::BF16(x) | Constant::F16(x) => bytemuck::bytes_of(x),
            Constant::F32(x) | Constant::U32(x) => bytemuck::bytes_of(x),
            Constant::F64(x) => bytemuck::bytes_of(x),
            Constant::U8(x) => bytemuck::bytes_of(x),
            Constant::I8(x) => bytemuck::bytes_of(x),
            Constant::I16(x) => bytemuck::bytes_of(x),
            Constant::I32(x) => bytemuck::bytes_of(x),
            Constant::I64(x) => bytemuck::bytes_of(x),
        };
        Some(bytemuck::pod_read_unaligned(bytes))
    }
}

impl Display for Constant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Constant::BF16(x) => f.write_fmt(format_args!("{}", bf16::from_bits(*x))),
            Constant::F16(x) => f.write_fmt(format_args!("{}", f16::from_bits(*x))),
            Constant::F32(x) => f.write_fmt(format_args!("{}", f32::from_bits(*x))),
            Constant::F64(x) => f.write_fmt(format_args!("{}", f64::from_bits(*x))),
            Constant::U8(x) => f.write_fmt(format_args!("{x}")),
            Constant::I8(x) => f.write_fmt(format_args!("{x}")),
            Constant::I16(x) => f.write_fmt(format_args!("{x}")),
            Constant::U32(x) => f.write_fmt(format_args!("{x}")),
            Constant::I32(x) => f.write_fmt(format_args!("{x}")),
            Constant::I64(x) => f.write_fmt(format_args!("{x}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_keeps_bits() {
        let c = Constant::new(2.5f32);
        assert_eq!(c.dtype(), DType::F32);
        assert_eq!(c.get::<f32>(), Some(2.5));
        assert_eq!(c.get::<i32>(), None);
        let h = Constant::new(f16::from_f32(0.5));
        assert_eq!(h.get::<f16>(), Some(f16::from_f32(0.5)));
        assert_eq!(format!("{}", Constant::new(-3i64)), "-3");
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(DType::F16.byte_size(), 2);
        assert_eq!(DType::F64.byte_size(), 8);
        assert_eq!(<u8 as Scalar>::dtype().byte_size(), 1);
    }
}
