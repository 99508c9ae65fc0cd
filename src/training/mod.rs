mod metrics;
mod schedule;
mod staged;
mod trainer;

pub use metrics::{ClassTally, EpochMetrics, EpochRecord, MetricAccumulator, TrainingHistory};
pub use schedule::LrSchedule;
pub use staged::{StagedFineTuner, StagedOutcome};
pub use trainer::{count_correct, evaluate, PhaseOptimizer, TrainOutput, Trainer};
