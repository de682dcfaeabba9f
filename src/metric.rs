use ndarray::{ArrayView1, ArrayView2, Axis};

/// Average precision of one class.
///
/// Only examples with a nonzero weight take part. Examples are ranked by
/// descending score and the threshold is swept over every distinct score:
/// tied examples are admitted together, so the result does not depend on
/// how ties are ordered. Returns `None` when no weighted positive exists,
/// since recall is undefined then.
pub fn average_precision(
    scores: ArrayView1<f32>,
    labels: ArrayView1<f32>,
    weights: ArrayView1<f32>,
) -> Option<f64> {
    let mut ranked: Vec<(f32, bool)> = scores
        .iter()
        .zip(labels.iter())
        .zip(weights.iter())
        .filter(|(_, weight)| **weight != 0.0)
        .map(|((score, label), _)| (*score, *label > 0.5))
        .collect();

    let positives = ranked.iter().filter(|(_, positive)| *positive).count();
    if positives == 0 {
        return None;
    }

    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut true_positives = 0usize;
    let mut seen = 0usize;
    let mut last_recall = 0.0;
    let mut ap = 0.0;

    for group in ranked.chunk_by(|a, b| a.0 == b.0) {
        seen += group.len();
        true_positives += group.iter().filter(|(_, positive)| *positive).count();

        let recall = true_positives as f64 / positives as f64;
        let precision = true_positives as f64 / seen as f64;
        ap += (recall - last_recall) * precision;
        last_recall = recall;
    }

    Some(ap)
}

/// Per-class average precision over `[N, C]` matrices.
pub fn compute_ap(
    labels: ArrayView2<f32>,
    scores: ArrayView2<f32>,
    weights: ArrayView2<f32>,
) -> Vec<Option<f64>> {
    assert_eq!(labels.dim(), scores.dim(), "labels and scores differ in shape");
    assert_eq!(labels.dim(), weights.dim(), "labels and weights differ in shape");

    scores
        .axis_iter(Axis(1))
        .zip(labels.axis_iter(Axis(1)))
        .zip(weights.axis_iter(Axis(1)))
        .map(|((scores, labels), weights)| average_precision(scores, labels, weights))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeanAveragePrecision {
    /// `None` marks a class without positives.
    pub per_class: Vec<Option<f64>>,
    /// Mean over the classes whose AP is defined; 0 if there are none.
    pub mean: f64,
}

impl MeanAveragePrecision {
    pub fn new(per_class: Vec<Option<f64>>) -> Self {
        let defined: Vec<f64> = per_class.iter().flatten().copied().collect();
        let mean = if defined.is_empty() {
            0.0
        } else {
            defined.iter().sum::<f64>() / defined.len() as f64
        };

        Self { per_class, mean }
    }

    pub fn from_matrices(
        labels: ArrayView2<f32>,
        scores: ArrayView2<f32>,
        weights: ArrayView2<f32>,
    ) -> Self {
        Self::new(compute_ap(labels, scores, weights))
    }

    pub fn undefined_classes(&self) -> usize {
        self.per_class.iter().filter(|ap| ap.is_none()).count()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Fraction of label entries where the thresholded prediction matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    pub fn update(&mut self, scores: &[f32], labels: &[f32]) {
        self.correct += scores
            .iter()
            .zip(labels)
            .filter(|(score, label)| binarize(**score) == **label)
            .count();
        self.total += scores.len().min(labels.len());
    }

    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

/// Rounds a probability to 0 or 1; exactly 0.5 rounds down.
pub fn binarize(probability: f32) -> f32 {
    if probability > 0.5 {
        1.0
    } else {
        0.0
    }
}
