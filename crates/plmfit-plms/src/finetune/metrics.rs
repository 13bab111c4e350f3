//! Test-split metrics and the JSON evaluation report.
use plmfit_core::{Result, TaskKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    pub pearson: f64,
    pub spearman: f64,
    pub r2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub mcc: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Metrics {
    Regression(RegressionMetrics),
    Classification(ClassificationMetrics),
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metrics::Regression(m) => write!(
                f,
                "mse={:.4} rmse={:.4} mae={:.4} pearson={:.4} spearman={:.4} r2={:.4}",
                m.mse, m.rmse, m.mae, m.pearson, m.spearman, m.r2
            ),
            Metrics::Classification(m) => write!(
                f,
                "accuracy={:.4} precision={:.4} recall={:.4} f1={:.4} mcc={:.4}",
                m.accuracy, m.precision, m.recall, m.f1, m.mcc
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionData {
    pub preds: Vec<f32>,
    pub actual: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub task: TaskKind,
    #[serde(flatten)]
    pub metrics: Metrics,
    pub pred_data: PredictionData,
}

impl EvaluationReport {
    /// Classification predictions are probabilities, thresholded at 0.5.
    pub fn new(task: TaskKind, preds: Vec<f32>, actual: Vec<f32>) -> Self {
        let p: Vec<f64> = preds.iter().map(|&v| v as f64).collect();
        let a: Vec<f64> = actual.iter().map(|&v| v as f64).collect();
        let metrics = match task {
            TaskKind::Regression => Metrics::Regression(regression_metrics(&p, &a)),
            TaskKind::Classification => Metrics::Classification(classification_metrics(&p, &a)),
        };
        Self {
            task,
            metrics,
            pred_data: PredictionData { preds, actual },
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let (mx, my) = (mean(x), mean(y));
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    let denom = (sxx * syy).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        sxy / denom
    }
}

/// 1-based ranks; ties share their average rank.
fn ranks(xs: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..xs.len()).collect();
    order.sort_by(|&a, &b| xs[a].total_cmp(&xs[b]));
    let mut ranks = vec![0.0; xs.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && xs[order[j + 1]] == xs[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg;
        }
        i = j + 1;
    }
    ranks
}

pub fn spearman(x: &[f64], y: &[f64]) -> f64 {
    pearson(&ranks(x), &ranks(y))
}

pub fn regression_metrics(preds: &[f64], actual: &[f64]) -> RegressionMetrics {
    let n = preds.len().max(1) as f64;
    let mse = preds
        .iter()
        .zip(actual)
        .map(|(p, a)| (p - a).powi(2))
        .sum::<f64>()
        / n;
    let mae = preds.iter().zip(actual).map(|(p, a)| (p - a).abs()).sum::<f64>() / n;
    let ma = mean(actual);
    let ss_tot: f64 = actual.iter().map(|a| (a - ma).powi(2)).sum();
    let r2 = if ss_tot == 0.0 {
        0.0
    } else {
        1.0 - mse * n / ss_tot
    };
    RegressionMetrics {
        mse,
        rmse: mse.sqrt(),
        mae,
        pearson: pearson(preds, actual),
        spearman: spearman(preds, actual),
        r2,
    }
}

pub fn classification_metrics(probs: &[f64], actual: &[f64]) -> ClassificationMetrics {
    let (mut tp, mut tn, mut fp, mut fneg) = (0f64, 0f64, 0f64, 0f64);
    for (p, a) in probs.iter().zip(actual) {
        match (*p >= 0.5, *a >= 0.5) {
            (true, true) => tp += 1.0,
            (false, false) => tn += 1.0,
            (true, false) => fp += 1.0,
            (false, true) => fneg += 1.0,
        }
    }
    let ratio = |num: f64, den: f64| if den == 0.0 { 0.0 } else { num / den };
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fneg);
    let mcc_den = ((tp + fp) * (tp + fneg) * (tn + fp) * (tn + fneg)).sqrt();
    ClassificationMetrics {
        accuracy: ratio(tp + tn, tp + tn + fp + fneg),
        precision,
        recall,
        f1: ratio(2.0 * precision * recall, precision + recall),
        mcc: ratio(tp * tn - fp * fneg, mcc_den),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_regression() {
        let y = [1.0, 2.0, 3.0, 4.0];
        let m = regression_metrics(&y, &y);
        assert_eq!(m.mse, 0.0);
        assert!((m.pearson - 1.0).abs() < 1e-12);
        assert!((m.spearman - 1.0).abs() < 1e-12);
        assert!((m.r2 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_spearman_is_rank_based() {
        // monotone but non-linear
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [1.0, 8.0, 27.0, 64.0];
        assert!((spearman(&x, &y) - 1.0).abs() < 1e-12);
        assert!(pearson(&x, &y) < 1.0);
        assert_eq!(ranks(&[3.0, 1.0, 3.0]), vec![2.5, 1.0, 2.5]);
    }

    #[test]
    fn test_classification_counts() {
        let probs = [0.9, 0.2, 0.7, 0.4];
        let actual = [1.0, 0.0, 0.0, 1.0];
        let m = classification_metrics(&probs, &actual);
        assert_eq!(m.accuracy, 0.5);
        assert_eq!(m.precision, 0.5);
        assert_eq!(m.recall, 0.5);
        assert_eq!(m.mcc, 0.0);
    }

    #[test]
    fn test_report_json_layout() -> anyhow::Result<()> {
        let report = EvaluationReport::new(TaskKind::Regression, vec![1.0, 2.0], vec![1.0, 3.0]);
        let json: serde_json::Value = serde_json::to_value(&report)?;
        assert_eq!(json["task"], "regression");
        assert_eq!(json["mse"], 0.5);
        assert_eq!(json["pred_data"]["actual"][1], 3.0);

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("results").join("metrics.json");
        report.save(&path)?;
        let back: EvaluationReport = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(back.task, TaskKind::Regression);
        Ok(())
    }
}
