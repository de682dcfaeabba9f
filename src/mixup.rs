use anyhow::{anyhow, ensure, Result};
use burn::prelude::*;
use rand::{seq::SliceRandom, Rng};
use rand_distr::{Beta, Distribution};

use crate::data::VocBatch;

/// Draws mixup plans: per-example `λ ~ Beta(alpha, alpha)` and a random
/// pairing permutation.
#[derive(Debug, Clone)]
pub struct MixupSampler {
    beta: Beta<f32>,
}

impl MixupSampler {
    pub fn new(alpha: f32) -> Result<Self> {
        ensure!(
            alpha.is_finite() && alpha > 0.0,
            "mixup alpha must be positive and finite, got {alpha}"
        );
        let beta = Beta::new(alpha, alpha)
            .map_err(|err| anyhow!("invalid mixup alpha {alpha}: {err}"))?;

        Ok(Self { beta })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, batch_size: usize) -> MixupPlan {
        let lambdas = (0..batch_size).map(|_| self.beta.sample(rng)).collect();

        let mut permutation: Vec<usize> = (0..batch_size).collect();
        permutation.shuffle(rng);

        MixupPlan {
            lambdas,
            permutation,
        }
    }
}

/// A concrete mixing of one batch: example `i` becomes
/// `λ_i · x_i + (1 − λ_i) · x_π(i)` for images and labels. Weights are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct MixupPlan {
    lambdas: Vec<f32>,
    permutation: Vec<usize>,
}

impl MixupPlan {
    pub fn new(lambdas: Vec<f32>, permutation: Vec<usize>) -> Result<Self> {
        ensure!(
            lambdas.len() == permutation.len(),
            "{} mixing coefficients for a permutation of {} examples",
            lambdas.len(),
            permutation.len()
        );

        let mut seen = vec![false; permutation.len()];
        for &index in &permutation {
            ensure!(
                index < seen.len() && !seen[index],
                "{permutation:?} is not a permutation"
            );
            seen[index] = true;
        }

        Ok(Self {
            lambdas,
            permutation,
        })
    }

    pub fn len(&self) -> usize {
        self.lambdas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lambdas.is_empty()
    }

    #[cfg(test)]
    pub fn lambdas(&self) -> &[f32] {
        &self.lambdas
    }

    #[cfg(test)]
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    /// Panics if the batch size differs from the plan size.
    pub fn apply<B: Backend>(&self, batch: VocBatch<B>) -> VocBatch<B> {
        let VocBatch {
            images,
            labels,
            weights,
        } = batch;
        let batch_size = images.dims()[0];
        assert_eq!(
            batch_size,
            self.len(),
            "mixup plan for {} examples applied to a batch of {batch_size}",
            self.len()
        );

        if self.is_empty() {
            return VocBatch {
                images,
                labels,
                weights,
            };
        }

        let device = images.device();
        let lambdas = Tensor::<B, 1>::from_data(
            TensorData::new(self.lambdas.clone(), [batch_size]).convert::<B::FloatElem>(),
            &device,
        );
        let order = Tensor::<B, 1, Int>::from_data(
            TensorData::new(
                self.permutation.iter().map(|&i| i as i64).collect(),
                [batch_size],
            )
            .convert::<B::IntElem>(),
            &device,
        );

        VocBatch {
            images: mix(images, lambdas.clone().reshape([batch_size, 1, 1, 1]), order.clone()),
            labels: mix(labels, lambdas.reshape([batch_size, 1]), order),
            weights,
        }
    }
}

fn mix<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    lambda: Tensor<B, D>,
    order: Tensor<B, 1, Int>,
) -> Tensor<B, D> {
    let partner = x.clone().select(0, order);
    x * lambda.clone() + partner * lambda.neg().add_scalar(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use rand::{rngs::StdRng, SeedableRng};

    type TestBackend = NdArray<f32>;

    fn batch(labels: [[f32; 2]; 4]) -> VocBatch<TestBackend> {
        let device = Default::default();
        let images = Tensor::<TestBackend, 1>::from_floats(
            (0..4 * 3 * 2 * 2).map(|v| v as f32).collect::<Vec<_>>().as_slice(),
            &device,
        )
        .reshape([4, 3, 2, 2]);

        VocBatch {
            images,
            labels: Tensor::from_floats(labels, &device),
            weights: Tensor::from_floats([[1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [1.0, 1.0]], &device),
        }
    }

    fn values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    fn assert_all_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-4);
        }
    }

    #[test]
    fn mixes_labels_with_fixed_plan() {
        let plan = MixupPlan::new(vec![0.9, 0.1, 0.5, 0.7], vec![2, 0, 3, 1]).unwrap();
        let mixed = plan.apply(batch([[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]]));

        assert_all_close(
            &values(mixed.labels),
            &[1.0, 0.1, 0.9, 0.1, 0.5, 0.5, 0.0, 0.3],
        );
    }

    #[test]
    fn mixes_images_per_example() {
        let source = batch([[0.0; 2]; 4]);
        let original = values(source.images.clone());
        let plan = MixupPlan::new(vec![0.25, 1.0, 0.0, 0.5], vec![1, 0, 3, 2]).unwrap();

        let mixed = values(plan.apply(source).images);

        let stride = 3 * 2 * 2;
        for (i, (&lambda, &partner)) in plan.lambdas().iter().zip(plan.permutation()).enumerate() {
            for k in 0..stride {
                let own = original[i * stride + k];
                let other = original[partner * stride + k];
                let expected = lambda * own + (1.0 - lambda) * other;
                assert_abs_diff_eq!(mixed[i * stride + k], expected, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn keeps_shapes_and_weights() {
        let source = batch([[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]]);
        let weights = values(source.weights.clone());
        let sampler = MixupSampler::new(0.2).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        let mixed = sampler.sample(&mut rng, 4).apply(source);

        assert_eq!(mixed.images.dims(), [4, 3, 2, 2]);
        assert_eq!(mixed.labels.dims(), [4, 2]);
        assert_eq!(values(mixed.weights), weights);
    }

    #[test]
    fn identity_permutation_is_a_no_op() {
        let source = batch([[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]]);
        let images = values(source.images.clone());
        let labels = values(source.labels.clone());
        let plan = MixupPlan::new(vec![0.3, 0.05, 0.99, 0.6], vec![0, 1, 2, 3]).unwrap();

        let mixed = plan.apply(source);

        assert_all_close(&values(mixed.images), &images);
        assert_all_close(&values(mixed.labels), &labels);
    }

    #[test]
    fn half_lambda_averages_with_partner() {
        let labels = [[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]];
        let plan = MixupPlan::new(vec![0.5; 4], vec![3, 2, 1, 0]).unwrap();

        let mixed = plan.apply(batch(labels));

        assert_all_close(
            &values(mixed.labels),
            &[0.5, 0.0, 0.5, 1.0, 0.5, 1.0, 0.5, 0.0],
        );
    }

    #[test]
    fn large_alpha_concentrates_lambda_at_half() {
        let sampler = MixupSampler::new(5000.0).unwrap();
        let mut rng = StdRng::seed_from_u64(5);

        let plan = sampler.sample(&mut rng, 64);
        assert!(plan.lambdas().iter().all(|&l| (l - 0.5).abs() < 0.05));
    }

    #[test]
    fn small_alpha_pushes_lambda_to_the_ends() {
        let sampler = MixupSampler::new(0.05).unwrap();
        let mut rng = StdRng::seed_from_u64(9);

        let plan = sampler.sample(&mut rng, 200);
        let extreme = plan
            .lambdas()
            .iter()
            .filter(|&&l| !(0.1..=0.9).contains(&l))
            .count();
        assert!(extreme > 150, "only {extreme} of 200 near 0 or 1");
    }

    #[test]
    fn sampled_plan_is_a_permutation() {
        let sampler = MixupSampler::new(0.2).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let plan = sampler.sample(&mut rng, 16);

        let mut order = plan.permutation().to_vec();
        order.sort_unstable();
        assert_eq!(order, (0..16).collect::<Vec<_>>());
        assert!(plan.lambdas().iter().all(|l| (0.0..=1.0).contains(l)));
    }

    #[test]
    fn single_example_is_unchanged() {
        let sampler = MixupSampler::new(0.2).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let device = Default::default();
        let source = VocBatch::<TestBackend> {
            images: Tensor::from_floats([[[[0.2, 0.4]]]], &device),
            labels: Tensor::from_floats([[1.0, 0.0]], &device),
            weights: Tensor::from_floats([[1.0, 1.0]], &device),
        };

        let mixed = sampler.sample(&mut rng, 1).apply(source);

        assert_all_close(&values(mixed.images), &[0.2, 0.4]);
        assert_all_close(&values(mixed.labels), &[1.0, 0.0]);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(MixupSampler::new(0.0).is_err());
        assert!(MixupSampler::new(-1.0).is_err());
        assert!(MixupSampler::new(f32::NAN).is_err());
        assert!(MixupPlan::new(vec![0.5, 0.5], vec![0, 0]).is_err());
        assert!(MixupPlan::new(vec![0.5], vec![0, 1]).is_err());
    }
}
