// src/tensor/mod.rs
// ============================================================================
// TENSOR - Buffer tipado little-endian (prestado del store o propio)
// ============================================================================
//
// Los bytes se guardan tal cual vienen del checkpoint (little-endian, el
// mismo orden que espera el consumidor del ZIP). Solo un downcast produce
// un tensor propio; todo lo demás se presta del mmap.
//
// ============================================================================

use std::borrow::Cow;
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use half::{bf16, f16};
use rayon::prelude::*;
use thiserror::Error;

/// Por debajo de este número de elementos no compensa repartir en rayon
const PAR_THRESHOLD: usize = 1 << 16;

/// Tipo de elemento (todos los dtypes de safetensors)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Bool,
    U8,
    I8,
    F8E5M2,
    F8E4M3,
    I16,
    U16,
    F16,
    BF16,
    I32,
    U32,
    F32,
    F64,
    I64,
    U64,
}

impl ElementType {
    /// Parsea el dtype del header safetensors ("F32", "BF16", ...)
    pub fn from_safetensors(s: &str) -> Option<Self> {
        match s {
            "BOOL" => Some(Self::Bool),
            "U8" => Some(Self::U8),
            "I8" => Some(Self::I8),
            "F8_E5M2" => Some(Self::F8E5M2),
            "F8_E4M3" => Some(Self::F8E4M3),
            "I16" => Some(Self::I16),
            "U16" => Some(Self::U16),
            "F16" => Some(Self::F16),
            "BF16" => Some(Self::BF16),
            "I32" => Some(Self::I32),
            "U32" => Some(Self::U32),
            "F32" => Some(Self::F32),
            "F64" => Some(Self::F64),
            "I64" => Some(Self::I64),
            "U64" => Some(Self::U64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::U8 => "U8",
            Self::I8 => "I8",
            Self::F8E5M2 => "F8_E5M2",
            Self::F8E4M3 => "F8_E4M3",
            Self::I16 => "I16",
            Self::U16 => "U16",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::I32 => "I32",
            Self::U32 => "U32",
            Self::F32 => "F32",
            Self::F64 => "F64",
            Self::I64 => "I64",
            Self::U64 => "U64",
        }
    }

    /// Bytes por elemento
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Bool | Self::U8 | Self::I8 | Self::F8E5M2 | Self::F8E4M3 => 1,
            Self::I16 | Self::U16 | Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 | Self::I64 | Self::U64 => 8,
        }
    }

    /// Bytes de un tensor con esta forma; None si el producto desborda usize
    pub fn bytes_for(&self, shape: &[usize]) -> Option<usize> {
        shape
            .iter()
            .try_fold(self.size_in_bytes(), |acc, &dim| acc.checked_mul(dim))
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor of {numel} x {dtype} needs {expected} bytes, got {actual}")]
    SizeMismatch {
        dtype: ElementType,
        numel: usize,
        expected: usize,
        actual: usize,
    },

    #[error("shape {shape:?} of {dtype} overflows the address space")]
    ShapeOverflow { dtype: ElementType, shape: Vec<usize> },
}

/// Tensor: dtype + shape + bytes contiguos little-endian
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<'a> {
    dtype: ElementType,
    shape: Vec<usize>,
    data: Cow<'a, [u8]>,
}

impl<'a> Tensor<'a> {
    /// Crea un tensor validando que el tamaño cuadra con shape y dtype
    pub fn new(
        dtype: ElementType,
        shape: Vec<usize>,
        data: impl Into<Cow<'a, [u8]>>,
    ) -> Result<Self, TensorError> {
        let data = data.into();
        let Some(expected) = dtype.bytes_for(&shape) else {
            return Err(TensorError::ShapeOverflow { dtype, shape });
        };

        if data.len() != expected {
            return Err(TensorError::SizeMismatch {
                dtype,
                numel: expected / dtype.size_in_bytes(),
                expected,
                actual: data.len(),
            });
        }

        Ok(Self { dtype, shape, data })
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Bytes raw (sin header, sin padding)
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// true si los bytes siguen prestados del store
    pub fn is_borrowed(&self) -> bool {
        matches!(self.data, Cow::Borrowed(_))
    }

    /// Vista prestada del mismo buffer (no copia bytes)
    pub fn view(&self) -> Tensor<'_> {
        Tensor {
            dtype: self.dtype,
            shape: self.shape.clone(),
            data: Cow::Borrowed(&self.data[..]),
        }
    }

    pub fn into_owned(self) -> Tensor<'static> {
        Tensor {
            dtype: self.dtype,
            shape: self.shape,
            data: Cow::Owned(self.data.into_owned()),
        }
    }

    /// Convierte los valores a FP16.
    ///
    /// Es una conversión de valores, no una reinterpretación: cambia el ancho
    /// en bytes y el dtype. Un tensor que ya es F16 se devuelve sin copiar.
    pub fn into_f16(self) -> Tensor<'a> {
        if self.dtype == ElementType::F16 {
            return self;
        }

        let dtype = self.dtype;
        let width = dtype.size_in_bytes();
        let src: &[u8] = &self.data;

        let data: Vec<u8> = if self.shape.iter().product::<usize>() >= PAR_THRESHOLD {
            src.par_chunks_exact(width)
                .flat_map_iter(|b| element_to_f16(dtype, b).to_le_bytes())
                .collect()
        } else {
            src.chunks_exact(width)
                .flat_map(|b| element_to_f16(dtype, b).to_le_bytes())
                .collect()
        };

        Tensor {
            dtype: ElementType::F16,
            shape: self.shape,
            data: Cow::Owned(data),
        }
    }
}

impl Tensor<'static> {
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, TensorError> {
        let mut data = vec![0u8; values.len() * 4];
        LittleEndian::write_f32_into(values, &mut data);
        Tensor::new(ElementType::F32, shape, data)
    }

    pub fn from_i32(shape: Vec<usize>, values: &[i32]) -> Result<Self, TensorError> {
        let mut data = vec![0u8; values.len() * 4];
        LittleEndian::write_i32_into(values, &mut data);
        Tensor::new(ElementType::I32, shape, data)
    }

    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self, TensorError> {
        let mut data = vec![0u8; values.len() * 8];
        LittleEndian::write_f64_into(values, &mut data);
        Tensor::new(ElementType::F64, shape, data)
    }
}

/// Un elemento (bytes LE) → f16
fn element_to_f16(dtype: ElementType, b: &[u8]) -> f16 {
    match dtype {
        ElementType::Bool => f16::from_f32(if b[0] != 0 { 1.0 } else { 0.0 }),
        ElementType::U8 => f16::from_f32(b[0] as f32),
        ElementType::I8 => f16::from_f32(b[0] as i8 as f32),
        ElementType::F8E5M2 => f16::from_bits((b[0] as u16) << 8),
        ElementType::F8E4M3 => f16::from_f32(f8_e4m3_to_f32(b[0])),
        ElementType::I16 => f16::from_f32(LittleEndian::read_i16(b) as f32),
        ElementType::U16 => f16::from_f32(LittleEndian::read_u16(b) as f32),
        ElementType::F16 => f16::from_bits(LittleEndian::read_u16(b)),
        ElementType::BF16 => f16::from_f32(bf16::from_bits(LittleEndian::read_u16(b)).to_f32()),
        ElementType::I32 => f16::from_f32(LittleEndian::read_i32(b) as f32),
        ElementType::U32 => f16::from_f32(LittleEndian::read_u32(b) as f32),
        ElementType::F32 => f16::from_f32(LittleEndian::read_f32(b)),
        ElementType::F64 => f16::from_f64(LittleEndian::read_f64(b)),
        ElementType::I64 => f16::from_f64(LittleEndian::read_i64(b) as f64),
        ElementType::U64 => f16::from_f64(LittleEndian::read_u64(b) as f64),
    }
}

/// FP8 E4M3 (fn variant: sin infinitos, S.1111.111 = NaN)
fn f8_e4m3_to_f32(v: u8) -> f32 {
    let sign = if v & 0x80 != 0 { -1.0 } else { 1.0 };
    let exp = ((v >> 3) & 0x0F) as i32;
    let mant = (v & 0x07) as f32;

    if exp == 0x0F && (v & 0x07) == 0x07 {
        return f32::NAN;
    }
    if exp == 0 {
        return sign * (mant / 8.0) * 2f32.powi(-6);
    }
    sign * (1.0 + mant / 8.0) * 2f32.powi(exp - 7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_parse() {
        assert_eq!(ElementType::from_safetensors("F32"), Some(ElementType::F32));
        assert_eq!(ElementType::from_safetensors("BF16"), Some(ElementType::BF16));
        assert_eq!(ElementType::from_safetensors("F8_E4M3"), Some(ElementType::F8E4M3));
        assert_eq!(ElementType::from_safetensors("float32"), None);
        assert_eq!(ElementType::I32.to_string(), "I32");
        assert_eq!(ElementType::F64.size_in_bytes(), 8);
    }

    #[test]
    fn test_size_mismatch() {
        let err = Tensor::new(ElementType::F32, vec![2, 3], vec![0u8; 20]).unwrap_err();
        match err {
            TensorError::SizeMismatch { expected, actual, .. } => {
                assert_eq!(expected, 24);
                assert_eq!(actual, 20);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_shape_overflow_is_an_error() {
        let shape = vec![usize::MAX / 2, 4];
        assert_eq!(ElementType::F32.bytes_for(&shape), None);
        assert_eq!(ElementType::U8.bytes_for(&[3, 0, 7]), Some(0));

        let err = Tensor::new(ElementType::F32, shape, Vec::new()).unwrap_err();
        assert!(matches!(err, TensorError::ShapeOverflow { dtype: ElementType::F32, .. }));
    }

    #[test]
    fn test_f32_to_f16_halves_bytes() {
        let values = [0.0f32, 1.0, -2.5, 65504.0];
        let t = Tensor::from_f32(vec![2, 2], &values).unwrap();
        let h = t.into_f16();

        assert_eq!(h.dtype(), ElementType::F16);
        assert_eq!(h.shape(), &[2, 2]);
        assert_eq!(h.byte_len(), 8);

        let back: Vec<f32> = h
            .as_bytes()
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect();
        assert_eq!(back, values);
    }

    #[test]
    fn test_f16_is_not_copied() {
        let bytes = [0x00u8, 0x3C, 0x00, 0xC0];
        let t = Tensor::new(ElementType::F16, vec![2], &bytes[..]).unwrap();
        let h = t.into_f16();
        assert!(h.is_borrowed());
        assert_eq!(h.as_bytes(), &bytes);
    }

    #[test]
    fn test_bf16_and_int_to_f16() {
        let one = bf16::from_f32(1.5).to_le_bytes();
        let t = Tensor::new(ElementType::BF16, vec![1], one.to_vec()).unwrap();
        assert_eq!(t.into_f16().as_bytes(), &f16::from_f32(1.5).to_le_bytes());

        let t = Tensor::from_i32(vec![2], &[-3, 7]).unwrap();
        let h = t.into_f16();
        assert_eq!(&h.as_bytes()[0..2], &f16::from_f32(-3.0).to_le_bytes());
        assert_eq!(&h.as_bytes()[2..4], &f16::from_f32(7.0).to_le_bytes());
    }

    #[test]
    fn test_large_tensor_parallel_path() {
        let n = PAR_THRESHOLD + 3;
        let values: Vec<f32> = (0..n).map(|i| (i % 100) as f32 * 0.5).collect();
        let h = Tensor::from_f32(vec![n], &values).unwrap().into_f16();

        assert_eq!(h.byte_len(), n * 2);
        let last = &h.as_bytes()[(n - 1) * 2..];
        assert_eq!(last, &f16::from_f32(values[n - 1]).to_le_bytes());
    }

    #[test]
    fn test_f8_e4m3() {
        assert_eq!(f8_e4m3_to_f32(0x38), 1.0);
        assert_eq!(f8_e4m3_to_f32(0xB8), -1.0);
        assert!(f8_e4m3_to_f32(0x7F).is_nan());
        assert_eq!(f8_e4m3_to_f32(0x00), 0.0);
    }
}
