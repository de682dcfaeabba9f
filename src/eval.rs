use anyhow::{anyhow, Result};
use burn::{prelude::*, tensor::activation::sigmoid};
use ndarray::Array2;

use crate::{
    data::VocBatch,
    loss::WeightedSigmoidCrossEntropy,
    metric::{Accuracy, MeanAveragePrecision, RunningMean},
    model::ImageClassifier,
};

#[derive(Debug, Clone)]
pub struct EvalReport {
    /// Mean of the per-batch losses.
    pub loss: f64,
    pub accuracy: f64,
    pub ap: MeanAveragePrecision,
}

/// Scores every batch with `model` and computes loss, accuracy and
/// per-class AP over the whole stream.
pub fn evaluate<B, M, I>(model: &M, batches: I, classes: usize) -> Result<EvalReport>
where
    B: Backend,
    M: ImageClassifier<B>,
    I: IntoIterator<Item = VocBatch<B>>,
{
    let criterion = WeightedSigmoidCrossEntropy::new();
    let mut loss = RunningMean::default();
    let mut accuracy = Accuracy::default();

    let mut scores = Vec::new();
    let mut labels = Vec::new();
    let mut weights = Vec::new();

    for batch in batches {
        let logits = model.logits(batch.images);
        let batch_loss = criterion.forward(
            logits.clone(),
            batch.labels.clone(),
            batch.weights.clone(),
        );
        loss.update(batch_loss.into_scalar().elem::<f64>());

        let batch_scores = to_vec(sigmoid(logits))?;
        let batch_labels = to_vec(batch.labels)?;
        accuracy.update(&batch_scores, &batch_labels);

        scores.extend(batch_scores);
        labels.extend(batch_labels);
        weights.extend(to_vec(batch.weights)?);
    }

    let rows = if classes == 0 { 0 } else { scores.len() / classes };
    let scores = Array2::from_shape_vec((rows, classes), scores)?;
    let labels = Array2::from_shape_vec((rows, classes), labels)?;
    let weights = Array2::from_shape_vec((rows, classes), weights)?;

    Ok(EvalReport {
        loss: loss.value(),
        accuracy: accuracy.value(),
        ap: MeanAveragePrecision::from_matrices(labels.view(), scores.view(), weights.view()),
    })
}

fn to_vec<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow!("failed to read tensor data: {err:?}"))
}
