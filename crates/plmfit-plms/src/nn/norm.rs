use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    pub fn load(vb: VarBuilder, size: usize, eps: f64) -> Result<Self> {
        Self::load_with_weight_init(vb, size, eps, Init::Const(1.))
    }

    pub fn load_with_weight_init(vb: VarBuilder, size: usize, eps: f64, init: Init) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", init)?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.))?;
        Ok(Self::new(weight, bias, eps))
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Scale-only norm without mean subtraction, as used by T5 encoders.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn load(vb: VarBuilder, size: usize, eps: f64) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.))?;
        Ok(Self { weight, eps })
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = xs.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        normed.to_dtype(dtype)?.broadcast_mul(&self.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_layer_norm_zero_mean_unit_var() -> Result<()> {
        let dev = Device::Cpu;
        let ln = LayerNorm::new(Tensor::ones(4, DType::F32, &dev)?, Tensor::zeros(4, DType::F32, &dev)?, 1e-5);
        let xs = Tensor::new(&[[1f32, 2., 3., 4.], [10., 10., 10., 14.]], &dev)?;
        let ys = ln.forward(&xs)?;
        let mean = ys.mean(D::Minus1)?.to_vec1::<f32>()?;
        let var = ys.sqr()?.mean(D::Minus1)?.to_vec1::<f32>()?;
        assert!(mean.iter().all(|m| m.abs() < 1e-5));
        assert!(var.iter().all(|v| (v - 1.0).abs() < 1e-3));
        Ok(())
    }

    #[test]
    fn test_rms_norm() -> Result<()> {
        let dev = Device::Cpu;
        let norm = RmsNorm { weight: Tensor::ones(2, DType::F32, &dev)?, eps: 0.0 };
        let ys = norm.forward(&Tensor::new(&[[3f32, 4.]], &dev)?)?;
        let expected = [3.0 / 12.5f32.sqrt(), 4.0 / 12.5f32.sqrt()];
        for (y, e) in ys.flatten_all()?.to_vec1::<f32>()?.iter().zip(expected) {
            assert!((y - e).abs() < 1e-5);
        }
        Ok(())
    }
}
