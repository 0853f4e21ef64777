pub mod args;
pub mod dataset;
pub mod loader;
pub mod optimizer;
pub mod report;
pub mod trainer;
pub mod transform;

pub use args::{run_train, DatasetKind, DatasetSource, ModelKind, TrainArgs, TrainCollaborators, VOC_BBOX_LABEL_NAMES};
pub use dataset::{ConcatenatedDataset, DetectionDataset, Example, InMemoryDataset, TrainExample};
pub use loader::{LoaderConfig, MultiWorkerLoader};
pub use optimizer::{Gradients, MomentumSgd};
pub use report::{LogRecord, LogReport, LossTerms};
pub use trainer::{Evaluation, Evaluator, LossPlotter, TrainChain, TrainSummary, Trainer, TrainerConfig};
pub use transform::Transform;
