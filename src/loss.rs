use burn::prelude::*;

/// Sigmoid cross-entropy over every label entry, weighted by a mask and
/// averaged over the entries with nonzero weight. Targets may be soft.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedSigmoidCrossEntropy;

impl WeightedSigmoidCrossEntropy {
    pub fn new() -> Self {
        Self
    }

    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 2>,
        weights: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        // max(x, 0) - x * z + log(1 + exp(-|x|))
        let per_entry = logits.clone().clamp_min(0.0) - logits.clone() * targets
            + logits.abs().neg().exp().log1p();

        let weighted_count = weights.clone().greater_elem(0.0).float().sum().clamp_min(1.0);

        (per_entry * weights).sum() / weighted_count
    }
}
