use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use crate::common::{BackboneRegistry, InferenceDevice, PretrainedRegistry, PretrainedSource};
use crate::data::{DetectorConfig, FsAccess, Preset, RoiPooling, TrainingSchedule};
use crate::detection_runners::{AnchorProposer, DetectorModel, NdArrayBackend};
use crate::training::dataset::{ConcatenatedDataset, DetectionDataset};
use crate::training::loader::{LoaderConfig, MultiWorkerLoader};
use crate::training::trainer::{Evaluator, LossPlotter, TrainChain, TrainSummary, Trainer, TrainerConfig};
use crate::training::transform::Transform;

pub const VOC_BBOX_LABEL_NAMES: [&str; 20] = [
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Resnet50,
    Resnet101,
    /// ResNet-101 with RoI alignment instead of RoI pooling.
    Resnet101Align,
}

impl ModelKind {
    pub fn backbone(&self) -> &'static str {
        match self {
            ModelKind::Resnet50 => "resnet50",
            ModelKind::Resnet101 | ModelKind::Resnet101Align => "resnet101",
        }
    }

    pub fn roi_pooling(&self) -> RoiPooling {
        match self {
            ModelKind::Resnet101Align => RoiPooling::Align,
            _ => RoiPooling::Pool,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    /// VOC2007 trainval.
    Voc07,
    /// VOC2007 and VOC2012 trainval.
    Voc0712,
}

impl DatasetKind {
    pub fn years(&self) -> &'static [&'static str] {
        match self {
            DatasetKind::Voc07 => &["2007"],
            DatasetKind::Voc0712 => &["2007", "2012"],
        }
    }
}

/// Train a two-stage ResNet detector on PASCAL VOC.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct TrainArgs {
    #[arg(long, value_enum, default_value_t = ModelKind::Resnet50)]
    pub model: ModelKind,
    #[arg(long, value_enum, default_value_t = DatasetKind::Voc07)]
    pub dataset: DatasetKind,
    /// Device id; negative runs on the host.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub gpu: i64,
    #[arg(long, default_value_t = 1e-3)]
    pub lr: f32,
    /// Output directory for the log, plots and the snapshot.
    #[arg(long, default_value = "result")]
    pub out: PathBuf,
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Iterations between learning-rate shifts.
    #[arg(long, alias = "step_size", default_value_t = 50000)]
    pub step_size: u64,
    #[arg(long, default_value_t = 70000)]
    pub iteration: u64,
    #[arg(long, alias = "weight_decay", default_value_t = 0.0005)]
    pub weight_decay: f32,
}

/// Reads annotated images for a VOC-style split and year.
pub trait DatasetSource {
    fn load(&self, split: &str, year: &str) -> anyhow::Result<Arc<dyn DetectionDataset>>;
}

/// Everything `run_train` needs from outside the crate: data, the loss
/// computation and the optional evaluation and plotting steps.
pub struct TrainCollaborators {
    pub datasets: Box<dyn DatasetSource>,
    pub chain: Box<dyn TrainChain>,
    pub evaluator: Option<Box<dyn Evaluator>>,
    pub plotter: Option<Box<dyn LossPlotter>>,
    pub backbones: BackboneRegistry,
    pub pretrained: PretrainedRegistry,
    pub source: PretrainedSource,
    pub loader: LoaderConfig,
}

impl TrainCollaborators {
    pub fn new(datasets: Box<dyn DatasetSource>, chain: Box<dyn TrainChain>) -> Self {
        Self {
            datasets,
            chain,
            evaluator: None,
            plotter: None,
            backbones: BackboneRegistry::default(),
            pretrained: PretrainedRegistry::default(),
            source: PretrainedSource::Named("imagenet".to_string()),
            loader: LoaderConfig::default(),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Box<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_plotter(mut self, plotter: Box<dyn LossPlotter>) -> Self {
        self.plotter = Some(plotter);
        self
    }

    pub fn with_backbones(mut self, backbones: BackboneRegistry) -> Self {
        self.backbones = backbones;
        self
    }

    pub fn with_pretrained(mut self, pretrained: PretrainedRegistry, source: PretrainedSource) -> Self {
        self.pretrained = pretrained;
        self.source = source;
        self
    }

    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }
}

/// Detector configuration implied by the command line.
pub fn detector_config(args: &TrainArgs) -> DetectorConfig {
    DetectorConfig::new()
        .with_backbone(args.model.backbone())
        .with_roi_pooling(args.model.roi_pooling())
        .with_n_fg_class(VOC_BBOX_LABEL_NAMES.len())
        .with_names(&VOC_BBOX_LABEL_NAMES)
        .with_preset(Preset::Evaluate)
        .with_device(InferenceDevice::from_gpu_id(args.gpu))
        .with_seed(args.seed)
}

pub fn run_train(args: &TrainArgs, collaborators: TrainCollaborators) -> anyhow::Result<TrainSummary> {
    let schedule = TrainingSchedule::new(args.iteration, args.step_size).context("Invalid training schedule")?;
    let config = detector_config(args);
    log::info!("Training with {}", config.to_string());

    let backend = Arc::new(NdArrayBackend::new(config.device));
    let transform = Transform::new(&config);
    let model = DetectorModel::build(
        config,
        collaborators.source.clone(),
        &collaborators.backbones,
        &collaborators.pretrained,
        backend,
        Box::new(AnchorProposer),
    )
    .with_context(|| format!("Failed to build the {:?} detector", args.model))?;

    let parts = args
        .dataset
        .years()
        .iter()
        .map(|year| {
            collaborators
                .datasets
                .load("trainval", year)
                .with_context(|| format!("Failed to load VOC{year} trainval"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let dataset: Arc<dyn DetectionDataset> = if parts.len() == 1 {
        parts[0].clone()
    } else {
        Arc::new(ConcatenatedDataset::new(parts))
    };
    let epoch_len = dataset.len();

    let loader = MultiWorkerLoader::new(dataset, transform, collaborators.loader.clone().with_seed(args.seed))
        .context("Failed to start the data loader")?;
    let out = FsAccess::save_out(&args.out).context("Failed to create the output directory")?;
    let trainer_config = TrainerConfig::default()
        .with_out(&out)
        .with_lr(args.lr)
        .with_weight_decay(args.weight_decay);

    let mut trainer = Trainer::new(model, collaborators.chain, loader, epoch_len, schedule, trainer_config);
    if let Some(evaluator) = collaborators.evaluator {
        trainer = trainer.with_evaluator(evaluator);
    }
    if let Some(plotter) = collaborators.plotter {
        trainer = trainer.with_plotter(plotter);
    }
    let summary = trainer.run().context("Training failed")?;
    log::info!(
        "Finished {} iterations, snapshot at {}",
        summary.iterations,
        summary.snapshot.display()
    );
    Ok(summary)
}
