//! Generic embedding extraction.
//!
//! One forward pass per batch feeds every requested `(layer, reduction)`
//! slot. Each slot owns a pre-sized row-major buffer; batch `k` writes rows
//! `[k * B, k * B + len)` exactly once, in order.
use crate::encoding::TokenMatrix;
use crate::models::ModelFamily;
use bon::Builder;
use candle_core::{DType, Device, Tensor};
use itertools::{iproduct, Itertools};
use plmfit_core::{
    reduce, HiddenStates, LayerSpec, PlmfitError, Reduction, ReductionContext, Result,
    SequenceDataset,
};
use plmfit_io::{EmbeddingKey, EmbeddingStore};
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Anything that can turn a token matrix into a hidden-state stack.
pub trait HiddenStateSource {
    fn family(&self) -> ModelFamily;
    /// Model identifier used in embedding store keys.
    fn model_name(&self) -> &str;
    fn embedding_dimension(&self) -> usize;
    fn device(&self) -> &Device;
    fn encode_dataset(&self, dataset: &SequenceDataset) -> Result<TokenMatrix>;
    fn forward_hidden_states(&self, tokens: &TokenMatrix) -> Result<HiddenStates>;
}

#[derive(Debug, Clone, Builder)]
pub struct ExtractionRequest {
    #[builder(default = 8)]
    pub batch_size: usize,
    pub layers: Vec<LayerSpec>,
    pub reductions: Vec<Reduction>,
    /// Recompute even when every key is already stored.
    #[builder(default)]
    pub overwrite: bool,
}

impl ExtractionRequest {
    /// Slots in layer-major order.
    pub fn slots(&self) -> Vec<(LayerSpec, Reduction)> {
        iproduct!(self.layers.iter().copied(), self.reductions.iter().copied()).collect()
    }
}

/// `(start, len)` pairs covering `[0, n)` with batches of `batch_size`.
pub fn batch_ranges(n: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = batch_size.max(1);
    (0..n)
        .step_by(batch_size)
        .map(|start| (start, batch_size.min(n - start)))
        .collect()
}

/// Pre-sized output buffer for one slot.
#[derive(Debug)]
pub struct EmbeddingAccumulator {
    rows: usize,
    dim: usize,
    data: Vec<f32>,
    cursor: usize,
}

impl EmbeddingAccumulator {
    pub fn new(rows: usize, dim: usize) -> Self {
        Self {
            rows,
            dim,
            data: vec![0f32; rows * dim],
            cursor: 0,
        }
    }

    /// Rows written so far.
    pub fn filled(&self) -> usize {
        self.cursor
    }

    /// Write a `[len, dim]` batch at row `start`, which must be the next unwritten row.
    pub fn commit(&mut self, start: usize, batch: &Tensor) -> Result<()> {
        let (len, dim) = batch.dims2()?;
        if start != self.cursor {
            return Err(PlmfitError::configuration(format!(
                "batch starting at row {start} does not follow row {}",
                self.cursor
            )));
        }
        if dim != self.dim || start + len > self.rows {
            return Err(PlmfitError::configuration(format!(
                "batch of shape [{len}, {dim}] does not fit rows {start}.. of a [{}, {}] buffer",
                self.rows, self.dim
            )));
        }
        let values = batch.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        self.data[start * dim..(start + len) * dim].copy_from_slice(&values);
        self.cursor += len;
        Ok(())
    }

    pub fn finish(self, device: &Device) -> Result<Tensor> {
        if self.cursor != self.rows {
            return Err(PlmfitError::configuration(format!(
                "only {} of {} rows were written",
                self.cursor, self.rows
            )));
        }
        Ok(Tensor::from_vec(self.data, (self.rows, self.dim), device)?)
    }
}

/// Extract, persist and return one embedding matrix per requested slot.
///
/// When `store` already holds every key (and `overwrite` is off) the source is
/// never run.
#[instrument(skip_all, fields(dataset = %dataset.name, model = source.model_name()))]
pub fn extract<S: HiddenStateSource + ?Sized>(
    source: &S,
    dataset: &SequenceDataset,
    request: &ExtractionRequest,
    store: Option<&EmbeddingStore>,
) -> Result<Vec<(EmbeddingKey, Tensor)>> {
    let slots = request.slots();
    let keys: Vec<EmbeddingKey> = slots
        .iter()
        .map(|(layer, reduction)| {
            EmbeddingKey::new(&dataset.name, source.model_name(), *layer, *reduction)
        })
        .collect();

    if let Some(store) = store {
        if !request.overwrite && keys.iter().all(|k| store.contains(k)) {
            info!("all {} embedding files present, skipping the backbone", keys.len());
            return keys
                .into_iter()
                .map(|k| {
                    let t = store.load(&k, source.device())?;
                    Ok((k, t))
                })
                .collect();
        }
    }

    let positions = if slots.iter().any(|(_, r)| *r == Reduction::MutationMean) {
        let offset = source.family().residue_offset();
        let positions = dataset
            .mutation_positions()
            .ok_or_else(|| PlmfitError::MissingContext(Reduction::MutationMean.to_string()))?;
        Some(
            positions
                .into_iter()
                .map(|row| row.into_iter().map(|p| p + offset).collect_vec())
                .collect_vec(),
        )
    } else {
        None
    };

    let tokens = source.encode_dataset(dataset)?;
    let n = tokens.rows();
    let dim = source.embedding_dimension();
    let mut buffers: Vec<EmbeddingAccumulator> = slots
        .iter()
        .map(|_| EmbeddingAccumulator::new(n, dim))
        .collect();

    let ranges = batch_ranges(n, request.batch_size);
    let started = Instant::now();
    for (i, &(start, len)) in ranges.iter().enumerate() {
        let batch = tokens.slice_rows(start, len);
        let states = source.forward_hidden_states(&batch)?;
        if i == 0 {
            for (idx, layer) in states.iter().enumerate() {
                debug!("hidden state {idx}: {:?}", layer.dims());
            }
        }
        let ctx = match &positions {
            Some(p) => ReductionContext::with_mutations(&p[start..start + len]),
            None => ReductionContext::default(),
        };
        for ((layer, reduction), buffer) in slots.iter().zip(buffers.iter_mut()) {
            let pooled = reduce(states.select(layer)?, reduction, &ctx)?;
            buffer.commit(start, &pooled)?;
        }
        info!(
            "{} / {} | {:.2}s",
            i + 1,
            ranges.len(),
            started.elapsed().as_secs_f32()
        );
    }

    keys.into_iter()
        .zip(buffers)
        .map(|(key, buffer)| {
            let embeddings = buffer.finish(source.device())?;
            if let Some(store) = store {
                let path = store.save(&key, &embeddings)?;
                info!(
                    "saved {} embeddings of dimension {} to {}",
                    n,
                    dim,
                    path.display()
                );
            }
            Ok((key, embeddings))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plmfit_core::ProteinSequence;
    use std::cell::Cell;

    /// Hidden state `l` of token `t` holds `l * 100 + t` in every feature.
    struct CountingSource {
        layers: usize,
        dim: usize,
        calls: Cell<usize>,
        device: Device,
    }

    impl HiddenStateSource for CountingSource {
        fn family(&self) -> ModelFamily {
            ModelFamily::Esm2
        }
        fn model_name(&self) -> &str {
            "counting"
        }
        fn embedding_dimension(&self) -> usize {
            self.dim
        }
        fn device(&self) -> &Device {
            &self.device
        }
        fn encode_dataset(&self, dataset: &SequenceDataset) -> Result<TokenMatrix> {
            let tok = ModelFamily::Esm2.tokenizer()?;
            crate::encoding::categorical_encode(&dataset.sequences(), &tok, 4, true, true)
        }
        fn forward_hidden_states(&self, tokens: &TokenMatrix) -> Result<HiddenStates> {
            self.calls.set(self.calls.get() + 1);
            let (rows, cols) = (tokens.rows(), tokens.cols());
            let states = (0..=self.layers)
                .map(|l| {
                    let values: Vec<f32> = (0..rows * cols * self.dim)
                        .map(|i| (l * 100 + (i / self.dim) % cols) as f32)
                        .collect();
                    Tensor::from_vec(values, (rows, cols, self.dim), &self.device)
                })
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(HiddenStates::new(states))
        }
    }

    fn source() -> CountingSource {
        CountingSource {
            layers: 4,
            dim: 3,
            calls: Cell::new(0),
            device: Device::Cpu,
        }
    }

    fn dataset(n: usize) -> SequenceDataset {
        let records = (0..n)
            .map(|i| ProteinSequence {
                mutation_positions: Some(vec![i % 4]),
                ..ProteinSequence::new("MKTA")
            })
            .collect();
        SequenceDataset::new("toy", records)
    }

    #[test]
    fn test_batch_ranges_cover_exactly_once() {
        for (n, b) in [(10, 3), (9, 3), (1, 8), (0, 4)] {
            let ranges = batch_ranges(n, b);
            let mut next = 0;
            for (start, len) in &ranges {
                assert_eq!(*start, next);
                assert!(*len >= 1 && *len <= b);
                next = start + len;
            }
            assert_eq!(next, n);
        }
    }

    #[test]
    fn test_accumulator_rejects_overlap() -> anyhow::Result<()> {
        let mut acc = EmbeddingAccumulator::new(4, 2);
        let batch = Tensor::ones((2, 2), DType::F32, &Device::Cpu)?;
        acc.commit(0, &batch)?;
        assert!(acc.commit(1, &batch).is_err());
        acc.commit(2, &batch)?;
        assert_eq!(acc.filled(), 4);
        assert!(acc.commit(4, &batch).is_err());
        Ok(())
    }

    #[test]
    fn test_one_forward_per_batch_across_slots() -> anyhow::Result<()> {
        let source = source();
        let request = ExtractionRequest::builder()
            .batch_size(3)
            .layers(vec![LayerSpec::First, LayerSpec::Last, LayerSpec::Index(1)])
            .reductions(vec![Reduction::Mean, Reduction::Bos, Reduction::MutationMean])
            .build();
        let out = extract(&source, &dataset(7), &request, None)?;
        // ceil(7 / 3) batches regardless of the nine slots
        assert_eq!(source.calls.get(), 3);
        assert_eq!(out.len(), 9);
        for (_, t) in &out {
            assert_eq!(t.dims(), &[7, 3]);
        }

        // layer 4 bos token: 400; layer 1 token 1 + (i % 4): 101 + i % 4
        let last_bos = out[4].1.to_vec2::<f32>()?;
        assert!(last_bos.iter().all(|r| r.iter().all(|v| *v == 400.0)));
        let mut_mean = out[2].1.to_vec2::<f32>()?;
        for (i, row) in mut_mean.iter().enumerate() {
            assert_eq!(row[0], 101.0 + (i % 4) as f32);
        }
        Ok(())
    }

    #[test]
    fn test_mut_mean_without_positions_fails_before_forward() {
        let source = source();
        let data = SequenceDataset::new("toy", vec![ProteinSequence::new("MK")]);
        let request = ExtractionRequest::builder()
            .layers(vec![LayerSpec::Last])
            .reductions(vec![Reduction::MutationMean])
            .build();
        let err = extract(&source, &data, &request, None);
        assert!(matches!(err, Err(PlmfitError::MissingContext(_))));
        assert_eq!(source.calls.get(), 0);
    }

    #[test]
    fn test_cached_keys_bypass_the_source() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = EmbeddingStore::new(dir.path());
        let request = ExtractionRequest::builder()
            .batch_size(4)
            .layers(vec![LayerSpec::Middle])
            .reductions(vec![Reduction::Sum])
            .build();

        let first = source();
        let a = extract(&first, &dataset(5), &request, Some(&store))?;
        assert_eq!(first.calls.get(), 2);

        let second = source();
        let b = extract(&second, &dataset(5), &request, Some(&store))?;
        assert_eq!(second.calls.get(), 0);
        assert_eq!(a[0].1.to_vec2::<f32>()?, b[0].1.to_vec2::<f32>()?);
        Ok(())
    }
}
