mod record;

pub use record::{
    list_checkpoints, load_checkpoint, read_meta, CheckpointMeta, CheckpointStore, TrainingPoint,
};
