//! Utility functions and helpers
//!
//! Small tensor helpers shared by the losses and the debug driver.

/// Tensor utilities
pub mod tensor_utils {
    use candle_core::{DType, Result, Tensor};

    /// Raise every element to the power `e`
    ///
    /// Non-negative integral exponents use repeated multiplication so that
    /// negative bases stay finite; other exponents fall back to `powf`.
    pub fn pow_scalar(x: &Tensor, e: f64) -> Result<Tensor> {
        if e < 0.0 || e.fract() != 0.0 || e > 64.0 {
            return x.powf(e);
        }

        let mut n = e as u32;
        if n == 0 {
            return Tensor::ones_like(x);
        }

        // Exponentiation by squaring
        let mut base = x.clone();
        let mut acc: Option<Tensor> = None;
        while n > 0 {
            if n & 1 == 1 {
                acc = Some(match acc {
                    Some(a) => (a * &base)?,
                    None => base.clone(),
                });
            }
            n >>= 1;
            if n > 0 {
                base = base.sqr()?;
            }
        }
        match acc {
            Some(a) => Ok(a),
            None => Tensor::ones_like(x),
        }
    }

    /// `1 - x`
    pub fn one_minus(x: &Tensor) -> Result<Tensor> {
        x.affine(-1.0, 1.0)
    }

    /// Read a single-element tensor as f32 regardless of dtype
    pub fn scalar_f32(t: &Tensor) -> Result<f32> {
        if t.elem_count() != 1 {
            candle_core::bail!("expected a single-element tensor, got shape {:?}", t.dims());
        }
        t.to_dtype(DType::F32)?.flatten_all()?.squeeze(0)?.to_scalar::<f32>()
    }

    /// Number of elements of `t` equal to `value`
    pub fn count_equal(t: &Tensor, value: f64) -> Result<usize> {
        let n = t
            .eq(value)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        Ok(n.round() as usize)
    }
}
