//! Layer selection over a hidden-state stack.
//!
//! A stack of length `L` holds the input embedding at index 0 followed by one
//! entry per transformer block. Symbolic requests resolve against `L`:
//!
//! | spec       | index               |
//! |------------|---------------------|
//! | `first`    | 1                   |
//! | `middle`   | `1 + (L-1)/2`       |
//! | `quarter1` | `1 + (L-1)/4`       |
//! | `quarter3` | `1 + 3(L-1)/4`      |
//! | `last`     | `L-1`               |
//! | `<n>`      | `n`                 |
use crate::error::{PlmfitError, Result};
use candle_core::Tensor;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerSpec {
    First,
    Middle,
    Last,
    /// Quarter depth, `1..=3`.
    Quarter(u8),
    Index(usize),
}

impl LayerSpec {
    /// Concrete hidden-state index for a stack of `len` entries.
    pub fn resolve(&self, len: usize) -> Result<usize> {
        let depth = len.saturating_sub(1);
        let index = match self {
            LayerSpec::First => 1,
            LayerSpec::Middle => 1 + depth / 2,
            LayerSpec::Last => depth,
            LayerSpec::Quarter(q) => 1 + depth * (*q as usize) / 4,
            LayerSpec::Index(i) => *i,
        };
        if len == 0 || index >= len {
            return Err(PlmfitError::LayerIndex { index, len });
        }
        Ok(index)
    }
}

impl FromStr for LayerSpec {
    type Err = PlmfitError;

    fn from_str(s: &str) -> Result<Self> {
        let spec = match s.trim().to_ascii_lowercase().as_str() {
            "first" => LayerSpec::First,
            "middle" | "quarter2" => LayerSpec::Middle,
            "last" => LayerSpec::Last,
            "quarter1" => LayerSpec::Quarter(1),
            "quarter3" => LayerSpec::Quarter(3),
            other => other.parse::<usize>().map(LayerSpec::Index).map_err(|_| {
                PlmfitError::configuration(format!("unrecognised layer spec `{s}`"))
            })?,
        };
        Ok(spec)
    }
}

impl fmt::Display for LayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerSpec::First => write!(f, "first"),
            LayerSpec::Middle => write!(f, "middle"),
            LayerSpec::Last => write!(f, "last"),
            LayerSpec::Quarter(q) => write!(f, "quarter{q}"),
            LayerSpec::Index(i) => write!(f, "{i}"),
        }
    }
}

/// Per-layer outputs of one forward pass, each `[batch, tokens, hidden]`.
#[derive(Debug, Clone)]
pub struct HiddenStates(Vec<Tensor>);

impl HiddenStates {
    pub fn new(states: Vec<Tensor>) -> Self {
        Self(states)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&Tensor> {
        self.0.get(index).ok_or(PlmfitError::LayerIndex {
            index,
            len: self.0.len(),
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tensor> {
        self.0.iter()
    }

    pub fn select(&self, spec: &LayerSpec) -> Result<&Tensor> {
        self.get(spec.resolve(self.len())?)
    }

    /// Resolve several specs at once; output order follows input order.
    pub fn select_many(&self, specs: &[LayerSpec]) -> Result<Vec<&Tensor>> {
        specs.iter().map(|spec| self.select(spec)).collect()
    }

    pub fn into_inner(self) -> Vec<Tensor> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn test_symbolic_layers_for_thirteen_states() -> anyhow::Result<()> {
        assert_eq!(LayerSpec::First.resolve(13)?, 1);
        assert_eq!(LayerSpec::Last.resolve(13)?, 12);
        assert_eq!(LayerSpec::Middle.resolve(13)?, 7);
        assert_eq!(LayerSpec::Quarter(1).resolve(13)?, 4);
        assert_eq!(LayerSpec::Quarter(3).resolve(13)?, 10);
        Ok(())
    }

    #[test]
    fn test_numeric_out_of_range() {
        let err = LayerSpec::Index(13).resolve(13).unwrap_err();
        assert!(matches!(err, PlmfitError::LayerIndex { index: 13, len: 13 }));
    }

    #[test]
    fn test_parse_round_trips_names() -> anyhow::Result<()> {
        for name in ["first", "middle", "last", "quarter1", "quarter3", "5"] {
            let spec: LayerSpec = name.parse()?;
            assert_eq!(spec.to_string(), name);
        }
        assert!("deepest".parse::<LayerSpec>().is_err());
        Ok(())
    }

    #[test]
    fn test_select_many_keeps_order() -> anyhow::Result<()> {
        let states: Vec<Tensor> = (0..5)
            .map(|i| Tensor::full(i as f32, (1, 2, 3), &Device::Cpu))
            .collect::<candle_core::Result<_>>()?;
        let stack = HiddenStates::new(states);
        let picked = stack.select_many(&[LayerSpec::Last, LayerSpec::First, LayerSpec::Last])?;
        let firsts: Vec<f32> = picked
            .iter()
            .map(|t| t.flatten_all()?.get(0)?.to_scalar::<f32>())
            .collect::<candle_core::Result<_>>()?;
        assert_eq!(firsts, vec![4.0, 1.0, 4.0]);
        Ok(())
    }
}
