//! Multi-label evaluation metrics.
//!
//! This module provides:
//! - Rank-based AUC-ROC with tie handling
//! - F1 at a fixed decision threshold
//! - Precision/recall curve and F1-optimal threshold search
//! - Aggregation of per-class metrics over a full partition

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{DISEASES, NUM_DISEASES};

/// Fixed probability cutoff used for per-class and macro F1
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Added to the F1 denominator on the precision/recall curve
pub const F1_EPSILON: f64 = 1e-8;

/// Area under the ROC curve.
///
/// Tied scores contribute half a pair. Returns `None` when `labels` holds
/// only positives or only negatives. Non-finite scores are ranked by
/// `f64::total_cmp`; callers that need NaN to propagate check for them first.
pub fn roc_auc(scores: &[f64], labels: &[f64]) -> Option<f64> {
    let n = scores.len();
    if n == 0 || labels.len() != n {
        return None;
    }
    let mut items: Vec<(f64, bool)> = scores
        .iter()
        .zip(labels)
        .map(|(&s, &y)| (s, y >= 0.5))
        .collect();
    items.sort_by(|a, b| a.0.total_cmp(&b.0));

    let positives = items.iter().filter(|(_, y)| *y).count() as f64;
    let negatives = n as f64 - positives;
    if positives == 0.0 || negatives == 0.0 {
        return None;
    }

    let mut auc_num = 0.0f64;
    let mut neg_cum = 0.0f64;
    let mut i = 0;
    while i < n {
        let s = items[i].0;
        let mut j = i;
        let mut pos_sum = 0.0f64;
        let mut neg_sum = 0.0f64;
        while j < n && same_score(items[j].0, s) {
            if items[j].1 {
                pos_sum += 1.0;
            } else {
                neg_sum += 1.0;
            }
            j += 1;
        }
        auc_num += pos_sum * neg_cum + 0.5 * pos_sum * neg_sum;
        neg_cum += neg_sum;
        i = j;
    }
    Some(auc_num / (positives * negatives))
}

/// Tie test for sorted scores; unlike `==` it holds for NaN
fn same_score(a: f64, b: f64) -> bool {
    a.total_cmp(&b) == Ordering::Equal
}

/// Confusion counts for one class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryCounts {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl BinaryCounts {
    /// Count predictions `score > threshold` against labels
    pub fn at_threshold(scores: &[f64], labels: &[f64], threshold: f64) -> Self {
        let mut counts = Self::default();
        for (&s, &y) in scores.iter().zip(labels) {
            match (s > threshold, y >= 0.5) {
                (true, true) => counts.true_positives += 1,
                (true, false) => counts.false_positives += 1,
                (false, true) => counts.false_negatives += 1,
                (false, false) => {}
            }
        }
        counts
    }

    /// F1 score; 0 when there are no true positives
    pub fn f1(&self) -> f64 {
        let tp = self.true_positives as f64;
        let denom = 2.0 * tp + self.false_positives as f64 + self.false_negatives as f64;
        if self.true_positives == 0 || denom == 0.0 {
            0.0
        } else {
            2.0 * tp / denom
        }
    }
}

/// F1 for predictions `score > threshold`
pub fn f1_at_threshold(scores: &[f64], labels: &[f64], threshold: f64) -> f64 {
    BinaryCounts::at_threshold(scores, labels, threshold).f1()
}

/// One point of the precision/recall curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrPoint {
    /// Predictions with `score >= threshold` count as positive
    pub threshold: f64,
    pub precision: f64,
    pub recall: f64,
}

impl PrPoint {
    /// `2pr / (p + r + eps)`
    pub fn f1(&self) -> f64 {
        2.0 * self.precision * self.recall / (self.precision + self.recall + F1_EPSILON)
    }
}

/// Precision and recall at every distinct score, thresholds ascending.
///
/// Returns `None` when there are no positive labels.
pub fn precision_recall_curve(scores: &[f64], labels: &[f64]) -> Option<Vec<PrPoint>> {
    if scores.is_empty() || scores.len() != labels.len() {
        return None;
    }
    let mut items: Vec<(f64, bool)> = scores
        .iter()
        .zip(labels)
        .map(|(&s, &y)| (s, y >= 0.5))
        .collect();
    items.sort_by(|a, b| b.0.total_cmp(&a.0));

    let total_positives = items.iter().filter(|(_, y)| *y).count();
    if total_positives == 0 {
        return None;
    }

    // Sweep from the highest score down, emitting one point per distinct score.
    let mut points = Vec::new();
    let mut tp = 0usize;
    let mut predicted = 0usize;
    let mut i = 0;
    while i < items.len() {
        let threshold = items[i].0;
        while i < items.len() && same_score(items[i].0, threshold) {
            if items[i].1 {
                tp += 1;
            }
            predicted += 1;
            i += 1;
        }
        points.push(PrPoint {
            threshold,
            precision: tp as f64 / predicted as f64,
            recall: tp as f64 / total_positives as f64,
        });
    }
    points.reverse();
    Some(points)
}

/// Threshold maximizing F1 on the precision/recall curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdChoice {
    pub threshold: f64,
    pub f1: f64,
}

/// Search the precision/recall curve for the F1-maximizing threshold.
///
/// Ties resolve to the lowest threshold. Returns `None` when there are no
/// positive labels.
pub fn optimize_threshold(scores: &[f64], labels: &[f64]) -> Option<ThresholdChoice> {
    let curve = precision_recall_curve(scores, labels)?;
    let mut best: Option<ThresholdChoice> = None;
    for point in &curve {
        let f1 = point.f1();
        if best.map_or(true, |b| f1 > b.f1) {
            best = Some(ThresholdChoice {
                threshold: point.threshold,
                f1,
            });
        }
    }
    best
}

/// Probabilities and labels of a whole partition, row-major `[n, 14]`
#[derive(Debug, Clone, Default)]
pub struct MultiLabelScores {
    probabilities: Vec<f64>,
    labels: Vec<f64>,
}

impl MultiLabelScores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch of flattened `[batch, 14]` probabilities and labels
    pub fn extend(&mut self, probabilities: &[f32], labels: &[f32]) -> Result<()> {
        if probabilities.len() != labels.len() || probabilities.len() % NUM_DISEASES != 0 {
            return Err(Error::InvalidArgument(format!(
                "expected matching [batch, {NUM_DISEASES}] buffers, got {} probabilities and {} labels",
                probabilities.len(),
                labels.len()
            )));
        }
        self.probabilities
            .extend(probabilities.iter().map(|&p| p as f64));
        self.labels.extend(labels.iter().map(|&y| y as f64));
        Ok(())
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.labels.len() / NUM_DISEASES
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Probabilities and labels of one class
    pub fn column(&self, class: usize) -> (Vec<f64>, Vec<f64>) {
        let scores = self
            .probabilities
            .iter()
            .skip(class)
            .step_by(NUM_DISEASES)
            .copied()
            .collect();
        let labels = self
            .labels
            .iter()
            .skip(class)
            .step_by(NUM_DISEASES)
            .copied()
            .collect();
        (scores, labels)
    }
}

/// Tuned threshold and F1 for the finding of interest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMetrics {
    pub disease: String,
    /// F1-maximizing threshold on the precision/recall curve
    pub threshold: f64,
    /// F1 of predictions `score > threshold`
    pub f1: f64,
    /// Curve F1 at `threshold`, where `score >= threshold` counts as positive
    pub curve_f1: f64,
}

impl TargetMetrics {
    fn undefined(disease: &str) -> Self {
        Self {
            disease: disease.to_string(),
            threshold: f64::NAN,
            f1: f64::NAN,
            curve_f1: f64::NAN,
        }
    }
}

/// Per-class and aggregate metrics over a partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiLabelMetrics {
    /// Disease name to AUC-ROC
    pub per_class_auc: BTreeMap<String, f64>,
    /// Mean of per-class AUC-ROC
    pub mean_auc: f64,
    /// Disease name to F1 at [`DEFAULT_THRESHOLD`]
    pub per_class_f1: BTreeMap<String, f64>,
    /// Mean of per-class F1
    pub macro_f1: f64,
    /// Present when a target finding is configured
    pub target: Option<TargetMetrics>,
}

impl MultiLabelMetrics {
    /// Compute all metrics from collected scores.
    ///
    /// Fails with [`Error::MetricUndefined`] naming the class when a class has
    /// a single observed label value, or when the target class has no
    /// positives. A class with any non-finite probability gets NaN for every
    /// metric, so the aggregates are NaN too.
    pub fn compute(
        scores: &MultiLabelScores,
        target: Option<usize>,
        partition: &str,
    ) -> Result<Self> {
        if scores.is_empty() {
            return Err(Error::MetricUndefined(format!(
                "{partition} partition produced no predictions"
            )));
        }

        let mut per_class_auc = BTreeMap::new();
        let mut per_class_f1 = BTreeMap::new();
        let mut auc_sum = 0.0;
        let mut f1_sum = 0.0;
        let mut target_metrics = None;

        for (class, &disease) in DISEASES.iter().enumerate() {
            let (probs, labels) = scores.column(class);
            if probs.iter().any(|p| !p.is_finite()) {
                auc_sum += f64::NAN;
                f1_sum += f64::NAN;
                per_class_auc.insert(disease.to_string(), f64::NAN);
                per_class_f1.insert(disease.to_string(), f64::NAN);
                if target == Some(class) {
                    target_metrics = Some(TargetMetrics::undefined(disease));
                }
                continue;
            }

            let auc = roc_auc(&probs, &labels).ok_or_else(|| {
                Error::MetricUndefined(format!(
                    "AUC-ROC for {disease} on {partition}: only one label value among {} records",
                    labels.len()
                ))
            })?;
            let f1 = f1_at_threshold(&probs, &labels, DEFAULT_THRESHOLD);
            auc_sum += auc;
            f1_sum += f1;
            per_class_auc.insert(disease.to_string(), auc);
            per_class_f1.insert(disease.to_string(), f1);

            if target == Some(class) {
                let choice = optimize_threshold(&probs, &labels).ok_or_else(|| {
                    Error::MetricUndefined(format!(
                        "threshold search for {disease} on {partition}: no positive records"
                    ))
                })?;
                target_metrics = Some(TargetMetrics {
                    disease: disease.to_string(),
                    threshold: choice.threshold,
                    f1: f1_at_threshold(&probs, &labels, choice.threshold),
                    curve_f1: choice.f1,
                });
            }
        }

        Ok(Self {
            per_class_auc,
            mean_auc: auc_sum / NUM_DISEASES as f64,
            per_class_f1,
            macro_f1: f1_sum / NUM_DISEASES as f64,
            target: target_metrics,
        })
    }

    /// Target F1 at the tuned threshold, if a target finding is configured
    pub fn target_f1(&self) -> Option<f64> {
        self.target.as_ref().map(|t| t.f1)
    }

    /// Human-readable per-class table
    pub fn format_table(&self) -> String {
        let mut out = format!("{:<20} {:>8} {:>8}\n", "Finding", "AUC", "F1");
        for &disease in DISEASES.iter() {
            let auc = self.per_class_auc.get(disease).copied().unwrap_or(f64::NAN);
            let f1 = self.per_class_f1.get(disease).copied().unwrap_or(f64::NAN);
            out.push_str(&format!("{disease:<20} {auc:>8.4} {f1:>8.4}\n"));
        }
        out.push_str(&format!(
            "{:<20} {:>8.4} {:>8.4}",
            "mean", self.mean_auc, self.macro_f1
        ));
        if let Some(target) = &self.target {
            out.push_str(&format!(
                "\n{} optimal threshold {:.4}, F1 {:.4}",
                target.disease, target.threshold, target.f1
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_auc_perfect_and_inverted() {
        let labels = [0.0, 0.0, 1.0, 1.0];
        assert!(approx(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels).unwrap(), 1.0));
        assert!(approx(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels).unwrap(), 0.0));
    }

    #[test]
    fn test_auc_with_ties() {
        // One tied pair out of four counts as half.
        let scores = [0.3, 0.5, 0.5, 0.9];
        let labels = [0.0, 0.0, 1.0, 1.0];
        assert!(approx(roc_auc(&scores, &labels).unwrap(), 0.875));
    }

    #[test]
    fn test_auc_single_label_value_undefined() {
        assert!(roc_auc(&[0.1, 0.9], &[1.0, 1.0]).is_none());
        assert!(roc_auc(&[0.1, 0.9], &[0.0, 0.0]).is_none());
        assert!(roc_auc(&[], &[]).is_none());
    }

    #[test]
    fn test_f1_at_threshold() {
        let scores = [0.9, 0.6, 0.4, 0.2];
        let labels = [1.0, 0.0, 1.0, 0.0];
        // tp=1 fp=1 fn=1
        assert!(approx(f1_at_threshold(&scores, &labels, 0.5), 0.5));
        // strict comparison: 0.5 is not above 0.5
        assert!(approx(f1_at_threshold(&[0.5], &[1.0], 0.5), 0.0));
        assert!(approx(f1_at_threshold(&[0.1, 0.2], &[0.0, 0.0], 0.5), 0.0));
    }

    #[test]
    fn test_precision_recall_curve() {
        let scores = [0.1, 0.4, 0.35, 0.8];
        let labels = [0.0, 0.0, 1.0, 1.0];
        let curve = precision_recall_curve(&scores, &labels).unwrap();
        let thresholds: Vec<f64> = curve.iter().map(|p| p.threshold).collect();
        assert_eq!(thresholds, vec![0.1, 0.35, 0.4, 0.8]);
        assert!(approx(curve[0].precision, 0.5));
        assert!(approx(curve[0].recall, 1.0));
        assert!(approx(curve[1].precision, 2.0 / 3.0));
        assert!(approx(curve[3].precision, 1.0));
        assert!(approx(curve[3].recall, 0.5));
        assert!(precision_recall_curve(&[0.2], &[0.0]).is_none());
    }

    #[test]
    fn test_optimize_threshold_beats_default() {
        // Positives sit between 0.2 and 0.45; a 0.5 cutoff misses them all.
        let scores = [0.05, 0.1, 0.15, 0.2, 0.3, 0.4, 0.45, 0.6];
        let labels = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        let choice = optimize_threshold(&scores, &labels).unwrap();
        assert!(approx(choice.threshold, 0.2));
        assert!(choice.f1 >= f1_at_threshold(&scores, &labels, 0.5));
        assert!(choice.f1 > 0.85);
    }

    #[test]
    fn test_optimize_threshold_tie_prefers_lowest() {
        // (p=1, r=0.5) at 0.9 and (p=0.5, r=1) at 0.3 give the same F1.
        let scores = [0.9, 0.5, 0.4, 0.3];
        let labels = [1.0, 0.0, 0.0, 1.0];
        let choice = optimize_threshold(&scores, &labels).unwrap();
        assert!(approx(choice.threshold, 0.3));
    }

    fn synthetic_scores(rows: usize) -> MultiLabelScores {
        let mut scores = MultiLabelScores::new();
        for i in 0..rows {
            let labels: Vec<f32> = (0..NUM_DISEASES)
                .map(|d| if (i + d) % 2 == 0 { 1.0 } else { 0.0 })
                .collect();
            let probs: Vec<f32> = labels.iter().map(|&y| 0.25 + 0.5 * y).collect();
            scores.extend(&probs, &labels).unwrap();
        }
        scores
    }

    #[test]
    fn test_multilabel_metrics_perfect() -> Result<()> {
        let scores = synthetic_scores(6);
        assert_eq!(scores.len(), 6);
        let metrics = MultiLabelMetrics::compute(&scores, Some(12), "validation")?;
        assert_eq!(metrics.per_class_auc.len(), NUM_DISEASES);
        assert!(approx(metrics.mean_auc, 1.0));
        assert!(approx(metrics.macro_f1, 1.0));
        let target = metrics.target.as_ref().unwrap();
        assert_eq!(target.disease, "Pneumonia");
        assert!(approx(target.threshold, 0.75));
        assert!(metrics.format_table().contains("Pneumonia"));
        Ok(())
    }

    #[test]
    fn test_multilabel_metrics_degenerate_class() {
        let mut scores = MultiLabelScores::new();
        let probs = vec![0.5f32; NUM_DISEASES];
        scores.extend(&probs, &vec![0.0; NUM_DISEASES]).unwrap();
        scores.extend(&probs, &vec![0.0; NUM_DISEASES]).unwrap();
        let err = MultiLabelMetrics::compute(&scores, None, "test").unwrap_err();
        assert!(matches!(err, Error::MetricUndefined(ref msg) if msg.contains("Atelectasis")));
    }

    #[test]
    fn test_nan_scores_terminate() {
        let auc = roc_auc(&[f64::NAN, 0.2, 0.7], &[1.0, 0.0, 1.0]);
        assert!(auc.is_some());
        let curve = precision_recall_curve(&[f64::NAN, f64::NAN], &[1.0, 0.0]).unwrap();
        assert_eq!(curve.len(), 1);
        assert!(optimize_threshold(&[f64::NAN, f64::NAN], &[1.0, 0.0]).is_some());
    }

    #[test]
    fn test_non_finite_probabilities_give_nan_metrics() -> Result<()> {
        let mut scores = synthetic_scores(6);
        let mut probs = vec![0.5f32; NUM_DISEASES];
        probs[3] = f32::NAN;
        let labels: Vec<f32> = (0..NUM_DISEASES).map(|d| (d % 2) as f32).collect();
        scores.extend(&probs, &labels)?;

        let metrics = MultiLabelMetrics::compute(&scores, Some(3), "validation")?;
        assert!(metrics.per_class_auc["Edema"].is_nan());
        assert!(metrics.per_class_f1["Edema"].is_nan());
        assert!(metrics.mean_auc.is_nan());
        assert!(metrics.macro_f1.is_nan());
        assert!(metrics.target_f1().is_some_and(f64::is_nan));
        assert!(metrics.per_class_auc["Atelectasis"].is_finite());
        Ok(())
    }

    #[test]
    fn test_target_f1_rescored_above_threshold() -> Result<()> {
        let scores = [0.9, 0.8, 0.3, 0.2];
        let labels = [1.0, 1.0, 0.0, 1.0];
        let choice = optimize_threshold(&scores, &labels).unwrap();
        assert!(approx(choice.threshold, 0.2));
        assert!((choice.f1 - 6.0 / 7.0).abs() < 1e-6);

        // Same column placed in the Pneumonia slot; other classes alternate.
        let mut rows = MultiLabelScores::new();
        for (i, (&p, &y)) in scores.iter().zip(&labels).enumerate() {
            let mut probs: Vec<f32> = (0..NUM_DISEASES).map(|d| ((i + d) % 2) as f32).collect();
            let mut truth = probs.clone();
            probs[12] = p as f32;
            truth[12] = y as f32;
            rows.extend(&probs, &truth)?;
        }
        let metrics = MultiLabelMetrics::compute(&rows, Some(12), "validation")?;
        let target = metrics.target.as_ref().unwrap();
        assert!((target.threshold - 0.2).abs() < 1e-6);
        // tp=2 fp=1 fn=1 once 0.2 itself no longer counts as positive
        assert!((target.f1 - 2.0 / 3.0).abs() < 1e-6);
        assert!((target.curve_f1 - 6.0 / 7.0).abs() < 1e-6);
        assert_eq!(metrics.target_f1(), Some(target.f1));
        Ok(())
    }

    #[test]
    fn test_extend_rejects_mismatched_buffers() {
        let mut scores = MultiLabelScores::new();
        assert!(scores.extend(&[0.1; 3], &[0.0; 3]).is_err());
        assert!(scores.is_empty());
    }
}
