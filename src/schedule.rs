use burn::{config::Config, LearningRate};

/// Staircase exponential decay: the rate is multiplied by `decay_rate` once
/// every `decay_steps` steps.
#[derive(Config, Debug)]
pub struct StepDecayConfig {
    pub initial: LearningRate,

    #[config(default = 5000)]
    pub decay_steps: usize,

    #[config(default = 0.5)]
    pub decay_rate: f64,
}

impl StepDecayConfig {
    pub fn init(&self) -> StepDecay {
        StepDecay {
            initial: self.initial,
            decay_steps: self.decay_steps.max(1),
            decay_rate: self.decay_rate,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StepDecay {
    initial: LearningRate,
    decay_steps: usize,
    decay_rate: f64,
}

impl StepDecay {
    pub fn learning_rate(&self, step: usize) -> LearningRate {
        let stage = (step / self.decay_steps) as i32;
        self.initial * self.decay_rate.powi(stage)
    }
}
