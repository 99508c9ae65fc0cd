//! Epoch-level learning-rate schedules.
//!
//! A schedule only produces a multiplier; each parameter group's base rate
//! is scaled by it, so groups keep their relative rates as the phase decays.

use crate::config::SchedulerConfig;

#[derive(Debug, Clone)]
pub enum LrSchedule {
    Constant,
    Step {
        step_size: usize,
        gamma: f64,
        epochs: usize,
    },
    /// Decays when the monitored value (validation loss) stops improving.
    Plateau {
        factor: f64,
        patience: usize,
        threshold: f64,
        best: f64,
        bad_epochs: usize,
        scale: f64,
    },
}

impl LrSchedule {
    pub fn new(config: &SchedulerConfig) -> Self {
        match *config {
            SchedulerConfig::Constant => LrSchedule::Constant,
            SchedulerConfig::Step { step_size, gamma } => LrSchedule::Step {
                step_size,
                gamma,
                epochs: 0,
            },
            SchedulerConfig::Plateau {
                factor,
                patience,
                threshold,
            } => LrSchedule::Plateau {
                factor,
                patience,
                threshold,
                best: f64::INFINITY,
                bad_epochs: 0,
                scale: 1.0,
            },
        }
    }

    /// Current multiplier on the base learning rates.
    pub fn scale(&self) -> f64 {
        match self {
            LrSchedule::Constant => 1.0,
            LrSchedule::Step {
                step_size,
                gamma,
                epochs,
            } => gamma.powi((epochs / step_size) as i32),
            LrSchedule::Plateau { scale, .. } => *scale,
        }
    }

    /// Advance by one finished epoch. Returns true if the rate was reduced.
    pub fn step_epoch(&mut self, val_loss: f64) -> bool {
        let before = self.scale();
        match self {
            LrSchedule::Constant => {}
            LrSchedule::Step { epochs, .. } => *epochs += 1,
            LrSchedule::Plateau {
                factor,
                patience,
                threshold,
                best,
                bad_epochs,
                scale,
            } => {
                if val_loss < *best * (1.0 - *threshold) {
                    *best = val_loss;
                    *bad_epochs = 0;
                } else {
                    *bad_epochs += 1;
                }
                if *bad_epochs > *patience {
                    *scale *= *factor;
                    *bad_epochs = 0;
                }
            }
        }
        self.scale() < before
    }
}
