//! Collapse the token axis of a `[batch, tokens, hidden]` layer into `[batch, hidden]`.
use crate::error::{PlmfitError, Result};
use candle_core::{Tensor, D};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reduction {
    Mean,
    Sum,
    /// Token 0.
    Bos,
    /// Token `T-1`.
    Eos,
    /// Token `k`.
    Position(usize),
    /// Mean over the mutated positions of each sequence.
    MutationMean,
}

impl FromStr for Reduction {
    type Err = PlmfitError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase();
        let reduction = match key.as_str() {
            "mean" => Reduction::Mean,
            "sum" => Reduction::Sum,
            "bos" | "first" => Reduction::Bos,
            "eos" | "last" => Reduction::Eos,
            "mut_mean" => Reduction::MutationMean,
            other => {
                let digits = other.strip_prefix("pos").unwrap_or(other);
                digits
                    .parse::<usize>()
                    .map(Reduction::Position)
                    .map_err(|_| PlmfitError::UnsupportedReduction(s.to_string()))?
            }
        };
        Ok(reduction)
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduction::Mean => write!(f, "mean"),
            Reduction::Sum => write!(f, "sum"),
            Reduction::Bos => write!(f, "bos"),
            Reduction::Eos => write!(f, "eos"),
            Reduction::Position(k) => write!(f, "pos{k}"),
            Reduction::MutationMean => write!(f, "mut_mean"),
        }
    }
}

/// Per-batch metadata some reductions depend on.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReductionContext<'a> {
    /// Token indices (special-token offset already applied), one list per row.
    pub mutation_positions: Option<&'a [Vec<usize>]>,
}

impl<'a> ReductionContext<'a> {
    pub fn with_mutations(positions: &'a [Vec<usize>]) -> Self {
        Self {
            mutation_positions: Some(positions),
        }
    }
}

pub fn reduce(layer: &Tensor, reduction: &Reduction, ctx: &ReductionContext) -> Result<Tensor> {
    let (batch, tokens, _hidden) = layer.dims3()?;
    if tokens == 0 {
        return Err(PlmfitError::UnsupportedReduction(format!(
            "{reduction} on a layer without tokens"
        )));
    }
    let pooled = match reduction {
        Reduction::Mean => layer.mean(1)?,
        Reduction::Sum => layer.sum(1)?,
        Reduction::Bos => layer.narrow(1, 0, 1)?.squeeze(1)?,
        Reduction::Eos => layer.narrow(1, tokens - 1, 1)?.squeeze(1)?,
        Reduction::Position(k) => {
            if *k >= tokens {
                return Err(PlmfitError::UnsupportedReduction(format!(
                    "pos{k} on a layer with {tokens} tokens"
                )));
            }
            layer.narrow(1, *k, 1)?.squeeze(1)?
        }
        Reduction::MutationMean => {
            let positions = ctx
                .mutation_positions
                .filter(|p| p.len() == batch)
                .ok_or_else(|| PlmfitError::MissingContext(reduction.to_string()))?;
            let rows = positions
                .iter()
                .enumerate()
                .map(|(b, pos)| mutation_mean(&layer.get(b)?, pos, tokens))
                .collect::<Result<Vec<_>>>()?;
            Tensor::stack(&rows, 0)?
        }
    };
    Ok(pooled)
}

// Rows without mutations (the wild type) fall back to the full-sequence mean.
fn mutation_mean(row: &Tensor, positions: &[usize], tokens: usize) -> Result<Tensor> {
    if positions.is_empty() {
        return Ok(row.mean(D::Minus2)?);
    }
    if let Some(p) = positions.iter().find(|&&p| p >= tokens) {
        return Err(PlmfitError::configuration(format!(
            "mutation position {p} lies outside {tokens} tokens"
        )));
    }
    let idx: Vec<u32> = positions.iter().map(|&p| p as u32).collect();
    let idx = Tensor::new(idx.as_slice(), row.device())?;
    Ok(row.index_select(&idx, 0)?.mean(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn test_mean_and_sum_of_constant_tokens() -> anyhow::Result<()> {
        let v = 2.5f32;
        let layer = Tensor::full(v, (2, 3, 4), &Device::Cpu)?;
        let ctx = ReductionContext::default();

        let mean = reduce(&layer, &Reduction::Mean, &ctx)?;
        assert_eq!(mean.dims(), &[2, 4]);
        assert!(mean.flatten_all()?.to_vec1::<f32>()?.iter().all(|x| *x == v));

        let sum = reduce(&layer, &Reduction::Sum, &ctx)?;
        assert!(sum.flatten_all()?.to_vec1::<f32>()?.iter().all(|x| *x == 3.0 * v));
        Ok(())
    }

    #[test]
    fn test_empty_token_axis_is_rejected() -> anyhow::Result<()> {
        let layer = Tensor::zeros((2, 0, 4), candle_core::DType::F32, &Device::Cpu)?;
        let ctx = ReductionContext::default();
        for reduction in [Reduction::Eos, Reduction::Bos, Reduction::Mean, Reduction::Position(0)] {
            let err = reduce(&layer, &reduction, &ctx);
            assert!(matches!(err, Err(PlmfitError::UnsupportedReduction(_))));
        }
        Ok(())
    }

    #[test]
    fn test_positional_reductions() -> anyhow::Result<()> {
        // token t of every row holds the value t
        let layer = Tensor::arange(0f32, 3., &Device::Cpu)?
            .reshape((1, 3, 1))?
            .broadcast_as((2, 3, 2))?
            .contiguous()?;
        let ctx = ReductionContext::default();
        let bos = reduce(&layer, &Reduction::Bos, &ctx)?.to_vec2::<f32>()?;
        let eos = reduce(&layer, &Reduction::Eos, &ctx)?.to_vec2::<f32>()?;
        let pos1 = reduce(&layer, &Reduction::Position(1), &ctx)?.to_vec2::<f32>()?;
        assert_eq!(bos, vec![vec![0., 0.]; 2]);
        assert_eq!(eos, vec![vec![2., 2.]; 2]);
        assert_eq!(pos1, vec![vec![1., 1.]; 2]);
        assert!(reduce(&layer, &Reduction::Position(3), &ctx).is_err());
        Ok(())
    }

    #[test]
    fn test_mutation_mean() -> anyhow::Result<()> {
        let layer = Tensor::arange(0f32, 4., &Device::Cpu)?
            .reshape((1, 4, 1))?
            .broadcast_as((2, 4, 1))?
            .contiguous()?;
        let positions = vec![vec![1, 3], vec![2]];
        let out = reduce(
            &layer,
            &Reduction::MutationMean,
            &ReductionContext::with_mutations(&positions),
        )?;
        assert_eq!(out.to_vec2::<f32>()?, vec![vec![2.0], vec![2.0]]);
        Ok(())
    }

    #[test]
    fn test_mutation_mean_without_context() -> anyhow::Result<()> {
        let layer = Tensor::zeros((2, 4, 1), candle_core::DType::F32, &Device::Cpu)?;
        let err = reduce(&layer, &Reduction::MutationMean, &ReductionContext::default());
        assert!(matches!(err, Err(PlmfitError::MissingContext(_))));
        Ok(())
    }

    #[test]
    fn test_parse_reductions() -> anyhow::Result<()> {
        assert_eq!("mean".parse::<Reduction>()?, Reduction::Mean);
        assert_eq!("first".parse::<Reduction>()?, Reduction::Bos);
        assert_eq!("last".parse::<Reduction>()?, Reduction::Eos);
        assert_eq!("pos7".parse::<Reduction>()?, Reduction::Position(7));
        assert_eq!("7".parse::<Reduction>()?, Reduction::Position(7));
        assert_eq!("mut_mean".parse::<Reduction>()?, Reduction::MutationMean);
        assert!(matches!(
            "median".parse::<Reduction>(),
            Err(PlmfitError::UnsupportedReduction(_))
        ));
        Ok(())
    }
}
