use num_complex::Complex32;

use crate::bail;
use crate::dtype::DType;
use crate::error::{Error, Result};

// Values — dtype-tagged flat storage
//
// The engine moves tensor data around as a Values enum: one variant per
// dtype, each holding a flat row-major vector. Backends store buffers in
// this form and ops read/compute/write it. Bool is stored one byte per
// element (0 or 1); complex64 holds interleaved components as Complex32.

/// Flat tensor data, tagged with its dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<u8>),
    C64(Vec<Complex32>),
}

impl Values {
    /// The dtype of this storage.
    pub fn dtype(&self) -> DType {
        match self {
            Values::F32(_) => DType::F32,
            Values::I32(_) => DType::I32,
            Values::Bool(_) => DType::Bool,
            Values::C64(_) => DType::C64,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Values::F32(v) => v.len(),
            Values::I32(v) => v.len(),
            Values::Bool(v) => v.len(),
            Values::C64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero-filled storage of the given dtype and size.
    pub fn zeros(dtype: DType, size: usize) -> Values {
        match dtype {
            DType::F32 => Values::F32(vec![0.0; size]),
            DType::I32 => Values::I32(vec![0; size]),
            DType::Bool => Values::Bool(vec![0; size]),
            DType::C64 => Values::C64(vec![Complex32::new(0.0, 0.0); size]),
        }
    }

    /// One-filled storage of the given dtype and size.
    pub fn ones(dtype: DType, size: usize) -> Values {
        match dtype {
            DType::F32 => Values::F32(vec![1.0; size]),
            DType::I32 => Values::I32(vec![1; size]),
            DType::Bool => Values::Bool(vec![1; size]),
            DType::C64 => Values::C64(vec![Complex32::new(1.0, 0.0); size]),
        }
    }

    /// Build storage from a typed slice.
    pub fn from_slice<T: WithDType>(data: &[T]) -> Values {
        T::into_values(data.to_vec())
    }

    /// The elements widened to f64. Complex storage cannot be flattened
    /// this way and is an error.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        match self {
            Values::F32(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            Values::I32(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            Values::Bool(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            Values::C64(_) => bail!("complex64 values cannot be read as a flat f64 vector"),
        }
    }

    /// Build storage of `dtype` from f64 elements, narrowing as needed.
    pub fn from_f64_vec(dtype: DType, data: Vec<f64>) -> Result<Values> {
        match dtype {
            DType::F32 => Ok(Values::F32(data.into_iter().map(|x| x as f32).collect())),
            DType::I32 => Ok(Values::I32(data.into_iter().map(|x| x as i32).collect())),
            DType::Bool => Ok(Values::Bool(
                data.into_iter()
                    .map(|x| u8::from(x.round() != 0.0))
                    .collect(),
            )),
            DType::C64 => bail!("complex64 values cannot be built from a flat f64 vector"),
        }
    }

    /// Convert this storage to another dtype.
    ///
    /// In debug mode, conversions to int32 screen for NaN first: NaN is a
    /// legal float32 value but has no int32 encoding.
    pub fn convert(&self, dtype: DType, debug_mode: bool) -> Result<Values> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        if dtype == DType::C64 {
            let data = self.to_f64_vec()?;
            return Ok(Values::C64(
                data.into_iter()
                    .map(|x| Complex32::new(x as f32, 0.0))
                    .collect(),
            ));
        }
        let data = match self {
            // Casting complex drops the imaginary component.
            Values::C64(v) => v.iter().map(|c| c.re as f64).collect(),
            other => other.to_f64_vec()?,
        };
        if dtype == DType::I32 && debug_mode {
            check_conversion_for_nan(&data, dtype)?;
        }
        Values::from_f64_vec(dtype, data)
    }

    /// Scan float storage for NaN, failing with the operation's name.
    /// Non-float dtypes cannot produce NaN and always pass.
    pub fn check_for_nan(&self, op: &str) -> Result<()> {
        let has_nan = match self {
            Values::F32(v) => v.iter().any(|x| x.is_nan()),
            Values::C64(v) => v.iter().any(|c| c.re.is_nan() || c.im.is_nan()),
            _ => false,
        };
        if has_nan {
            return Err(Error::NanDetected { op: op.to_string() });
        }
        Ok(())
    }
}

fn check_conversion_for_nan(data: &[f64], dtype: DType) -> Result<()> {
    if data.iter().any(|x| x.is_nan()) {
        return Err(Error::NanConversion { dtype });
    }
    Ok(())
}

// WithDType — bridge between Rust element types and the DType enum
//
// Lets callers write `Values::from_slice(&[1.0f32, 2.0])` and generic
// constructors infer the runtime dtype from the element type.

/// Trait implemented by Rust types that can be stored in a tensor.
pub trait WithDType: Copy + Send + Sync + 'static {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Wrap a vector of this type into Values.
    fn into_values(data: Vec<Self>) -> Values;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn into_values(data: Vec<Self>) -> Values {
        Values::F32(data)
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;
    fn into_values(data: Vec<Self>) -> Values {
        Values::I32(data)
    }
}

impl WithDType for bool {
    const DTYPE: DType = DType::Bool;
    fn into_values(data: Vec<Self>) -> Values {
        Values::Bool(data.into_iter().map(u8::from).collect())
    }
}

impl WithDType for Complex32 {
    const DTYPE: DType = DType::C64;
    fn into_values(data: Vec<Self>) -> Values {
        Values::C64(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_and_ones() {
        assert_eq!(Values::zeros(DType::I32, 3), Values::I32(vec![0, 0, 0]));
        assert_eq!(Values::ones(DType::Bool, 2), Values::Bool(vec![1, 1]));
        assert_eq!(Values::ones(DType::F32, 1), Values::F32(vec![1.0]));
    }

    #[test]
    fn test_from_slice_infers_dtype() {
        assert_eq!(Values::from_slice(&[1.0f32]).dtype(), DType::F32);
        assert_eq!(Values::from_slice(&[1i32]).dtype(), DType::I32);
        assert_eq!(
            Values::from_slice(&[true, false]),
            Values::Bool(vec![1, 0])
        );
    }

    #[test]
    fn test_f64_round_trip() {
        let v = Values::from_slice(&[1i32, -2, 3]);
        let wide = v.to_f64_vec().unwrap();
        assert_eq!(wide, vec![1.0, -2.0, 3.0]);
        let back = Values::from_f64_vec(DType::I32, wide).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_convert_float_to_bool_rounds() {
        let v = Values::F32(vec![0.0, 0.4, 0.6, -1.0]);
        let b = v.convert(DType::Bool, false).unwrap();
        assert_eq!(b, Values::Bool(vec![0, 0, 1, 1]));
    }

    #[test]
    fn test_convert_nan_to_int_fails_in_debug() {
        let v = Values::F32(vec![f32::NAN]);
        assert!(v.convert(DType::I32, true).is_err());
        assert!(v.convert(DType::I32, false).is_ok());
    }

    #[test]
    fn test_convert_to_complex_and_back() {
        let v = Values::F32(vec![2.0, 3.0]);
        let c = v.convert(DType::C64, false).unwrap();
        assert_eq!(c.dtype(), DType::C64);
        let back = c.convert(DType::F32, false).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_nan_scan() {
        assert!(Values::F32(vec![1.0, f32::NAN]).check_for_nan("mul").is_err());
        assert!(Values::F32(vec![1.0]).check_for_nan("mul").is_ok());
        assert!(Values::I32(vec![1]).check_for_nan("cast").is_ok());
    }
}
