use candle_core::{DType, Device, Result, Tensor, D};

/// Rotary position embedding over the first `dim` features of each head.
///
/// `interleaved = false` rotates the two halves of the rotary slice against each
/// other (ESM). `interleaved = true` rotates adjacent feature pairs (GPT-J,
/// ProGen2), leaving features past `dim` untouched.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    inv_freq: Tensor,
    dim: usize,
    interleaved: bool,
}

impl RotaryEmbedding {
    pub fn new(dim: usize, base: f64, interleaved: bool, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim / 2)
            .map(|i| 1.0 / base.powf(2.0 * i as f64 / dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, dim / 2), device)?;
        Ok(Self {
            inv_freq,
            dim,
            interleaved,
        })
    }

    /// `(cos, sin)`, each `[seq_len, dim / 2]`.
    fn tables(&self, seq_len: usize, dtype: DType) -> Result<(Tensor, Tensor)> {
        let t = Tensor::arange(0u32, seq_len as u32, self.inv_freq.device())?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;
        let freqs = t.matmul(&self.inv_freq)?;
        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }

    /// Rotate `xs` of shape `[batch, heads, seq, head_dim]`.
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, h, t, head_dim) = xs.dims4()?;
        let (cos, sin) = self.tables(t, xs.dtype())?;
        let half = self.dim / 2;
        let rot = xs.narrow(D::Minus1, 0, self.dim)?;

        let rotated = if self.interleaved {
            let pairs = rot.reshape((b, h, t, half, 2))?;
            let x1 = pairs.narrow(D::Minus1, 0, 1)?;
            let x2 = pairs.narrow(D::Minus1, 1, 1)?;
            let cos = cos.reshape((t, half, 1))?;
            let sin = sin.reshape((t, half, 1))?;
            let even = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
            let odd = (x2.broadcast_mul(&cos)? + x1.broadcast_mul(&sin)?)?;
            Tensor::cat(&[even, odd], D::Minus1)?.reshape((b, h, t, self.dim))?
        } else {
            let x1 = rot.narrow(D::Minus1, 0, half)?;
            let x2 = rot.narrow(D::Minus1, half, half)?;
            let first = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
            let second = (x2.broadcast_mul(&cos)? + x1.broadcast_mul(&sin)?)?;
            Tensor::cat(&[first, second], D::Minus1)?
        };

        if self.dim == head_dim {
            Ok(rotated)
        } else {
            let pass = xs.narrow(D::Minus1, self.dim, head_dim - self.dim)?;
            Tensor::cat(&[rotated, pass], D::Minus1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_zero_is_identity() -> Result<()> {
        let dev = Device::Cpu;
        let xs = Tensor::randn(0f32, 1f32, (1, 2, 1, 8), &dev)?;
        for interleaved in [false, true] {
            let rope = RotaryEmbedding::new(8, 10_000.0, interleaved, &dev)?;
            let ys = rope.apply(&xs)?;
            let diff = (ys - &xs)?.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert!(diff < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_rotation_preserves_norm() -> Result<()> {
        let dev = Device::Cpu;
        let xs = Tensor::randn(0f32, 1f32, (2, 2, 5, 8), &dev)?;
        for interleaved in [false, true] {
            let rope = RotaryEmbedding::new(8, 10_000.0, interleaved, &dev)?;
            let ys = rope.apply(&xs)?;
            let nx = xs.sqr()?.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
            let ny = ys.sqr()?.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
            for (a, b) in nx.iter().zip(ny) {
                assert!((a - b).abs() < 1e-4);
            }
        }
        Ok(())
    }

    #[test]
    fn test_partial_rotation_keeps_tail() -> Result<()> {
        let dev = Device::Cpu;
        let xs = Tensor::randn(0f32, 1f32, (1, 1, 4, 8), &dev)?;
        let rope = RotaryEmbedding::new(4, 10_000.0, true, &dev)?;
        let ys = rope.apply(&xs)?;
        let tail_x = xs.narrow(D::Minus1, 4, 4)?.flatten_all()?.to_vec1::<f32>()?;
        let tail_y = ys.narrow(D::Minus1, 4, 4)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(tail_x, tail_y);
        Ok(())
    }
}
