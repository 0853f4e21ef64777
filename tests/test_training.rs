use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::Parser;
use ndarray::{Array3, ArrayD, IxDyn};

use rcnn_detect::common::{BBox, BackboneRegistry, PretrainedRegistry, PretrainedSource};
use rcnn_detect::data::{DetectorConfig, TrainingSchedule};
use rcnn_detect::detection_runners::DetectorModel;
use rcnn_detect::training::{
    run_train, ConcatenatedDataset, DatasetSource, DetectionDataset, Evaluation, Evaluator, Example, Gradients,
    InMemoryDataset, LoaderConfig, LogRecord, LossPlotter, LossTerms, MultiWorkerLoader, TrainArgs, TrainChain,
    TrainCollaborators, TrainExample, Trainer, TrainerConfig, Transform,
};
use rcnn_detect::{DetectorError, DetectorResult};

mod common;

fn example(label: i32) -> Example {
    Example {
        image: Array3::from_elem((3, 8, 8), 50.),
        bboxes: vec![BBox::new(1., 1., 6., 6.)],
        labels: vec![label],
    }
}

fn dataset(n: usize) -> Arc<dyn DetectionDataset> {
    Arc::new(InMemoryDataset::new((0..n as i32).map(example).collect()))
}

/// Fixed losses and a unit gradient for the score bias.
struct ConstantChain;

impl TrainChain for ConstantChain {
    fn step(&mut self, model: &mut DetectorModel, example: &TrainExample) -> DetectorResult<(LossTerms, Gradients)> {
        assert!(example.scale > 0.);
        let grads = [("head/score/b".to_string(), ArrayD::ones(IxDyn(&[model.n_class()])))].into();
        let terms = LossTerms {
            loss: 4.,
            roi_loc_loss: 1.,
            roi_cls_loss: 1.,
            rpn_loc_loss: 1.,
            rpn_cls_loss: 1.,
        };
        Ok((terms, grads))
    }
}

struct CountingEvaluator(Arc<Mutex<usize>>);

impl Evaluator for CountingEvaluator {
    fn evaluate(&mut self, _model: &mut DetectorModel) -> DetectorResult<Evaluation> {
        let mut calls = self.0.lock().unwrap();
        *calls += 1;
        Ok(Evaluation {
            map: *calls as f64,
            ap: vec![*calls as f64; 3],
        })
    }
}

struct RecordingPlotter(Arc<Mutex<Vec<(usize, PathBuf)>>>);

impl LossPlotter for RecordingPlotter {
    fn plot(&mut self, records: &[LogRecord], path: &Path) -> DetectorResult<()> {
        self.0.lock().unwrap().push((records.len(), path.to_path_buf()));
        Ok(())
    }
}

fn read_log(out: &Path) -> Vec<LogRecord> {
    serde_json::from_str(&std::fs::read_to_string(out.join("log")).unwrap()).unwrap()
}

#[test]
fn schedule_points_for_the_reference_run() {
    let schedule = TrainingSchedule::new(70000, 50000).unwrap();
    assert_eq!(
        schedule.evaluation_points,
        vec![0, 7000, 14000, 21000, 28000, 35000, 42000, 49000, 50000, 56000, 63000, 70000]
    );
    for total in [1, 7, 10, 99, 1234] {
        let points = TrainingSchedule::new(total, 3).unwrap().evaluation_points;
        assert!(points.windows(2).all(|w| w[0] < w[1]), "{points:?}");
        assert_eq!(points.first(), Some(&0));
        assert_eq!(points.last(), Some(&total));
    }
}

#[test]
fn concatenated_indices_span_both_parts() {
    let data = ConcatenatedDataset::new(vec![dataset(2), dataset(3)]);
    assert_eq!(data.len(), 5);
    assert_eq!(data.get(1).unwrap().labels, vec![1]);
    assert_eq!(data.get(2).unwrap().labels, vec![0]);
    assert_eq!(data.get(4).unwrap().labels, vec![2]);
    assert!(matches!(data.get(5), Err(DetectorError::IndexOutOfRange { index: 5, len: 5 })));
    assert!(matches!(data.get(-1), Err(DetectorError::IndexOutOfRange { index: -1, .. })));
}

struct FlakyDataset;

impl DetectionDataset for FlakyDataset {
    fn len(&self) -> usize {
        4
    }

    fn get_example(&self, index: usize) -> DetectorResult<Example> {
        match index {
            2 => Err(DetectorError::configuration("corrupt annotation")),
            3 => panic!("decoder crashed"),
            i => Ok(example(i as i32)),
        }
    }
}

#[test]
fn worker_failures_surface_in_order() {
    common::init_logger();
    let config = LoaderConfig::default().with_workers(2).with_shuffle(false);
    let transform = Transform::new(&DetectorConfig::new().with_size_bounds(8, 8));
    let mut loader = MultiWorkerLoader::new(Arc::new(FlakyDataset), transform, config).unwrap();
    assert_eq!(loader.next_example().unwrap().labels, vec![0]);
    assert_eq!(loader.next_example().unwrap().labels, vec![1]);
    assert!(matches!(loader.next_example(), Err(DetectorError::Worker(m)) if m.contains("corrupt annotation")));
    assert!(matches!(loader.next_example(), Err(DetectorError::Worker(_))));
    assert_eq!(loader.next_example().unwrap().labels, vec![0]);
}

#[test]
fn trainer_runs_periodic_actions_on_schedule() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let model = common::build_tiny(common::tiny_config(), PretrainedSource::None, &PretrainedRegistry::empty()).unwrap();
    let schedule = TrainingSchedule::new(40, 15).unwrap();
    let expected_points = schedule.evaluation_points.clone();
    let calls = Arc::new(Mutex::new(0));
    let plots = Arc::new(Mutex::new(Vec::new()));

    let examples = std::iter::repeat_with(|| {
        Ok(TrainExample {
            image: Array3::zeros((3, 32, 32)),
            bboxes: vec![],
            labels: vec![],
            scale: 1.,
        })
    });
    let config = TrainerConfig::default()
        .with_out(dir.path())
        .with_log_interval(5)
        .with_plot_interval(10);
    let mut trainer = Trainer::new(model, Box::new(ConstantChain), examples, 8, schedule, config)
        .with_evaluator(Box::new(CountingEvaluator(calls.clone())))
        .with_plotter(Box::new(RecordingPlotter(plots.clone())));
    let summary = trainer.run().unwrap();

    let fired: Vec<u64> = summary.evaluations.iter().map(|(i, _)| *i).collect();
    assert_eq!(fired, expected_points);
    assert_eq!(*calls.lock().unwrap(), expected_points.len());
    assert!((summary.final_lr - 1e-5).abs() < 1e-10);
    assert!(summary.snapshot.exists());

    let log = read_log(dir.path());
    assert_eq!(log.len(), 8);
    let at = |it: u64| log.iter().find(|r| r.iteration == it).unwrap();
    assert!((at(15).lr - 1e-3).abs() < 1e-9);
    assert!((at(20).lr - 1e-4).abs() < 1e-10);
    assert!((at(35).lr - 1e-5).abs() < 1e-11);
    assert_eq!(at(10).epoch, 1);
    assert_eq!(at(10).loss, 4.);
    // evaluations at 0, 4 and 8 happened before the record at 10
    assert_eq!(at(10).map, Some(3.));

    let plots = plots.lock().unwrap();
    assert_eq!(plots.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![2, 4, 6, 8]);
    assert!(plots.iter().all(|(_, p)| p.ends_with("loss.png")));

    let bias = trainer.model().params().at("head/score/b").unwrap();
    let rcnn_detect::common::Node::Array(leaf) = bias else {
        panic!("score bias is not an array");
    };
    assert!(leaf.data.iter().all(|&v| v < 0.));
}

#[test]
fn exhausted_data_stream_is_a_worker_error() {
    let dir = tempfile::tempdir().unwrap();
    let model = common::build_tiny(common::tiny_config(), PretrainedSource::None, &PretrainedRegistry::empty()).unwrap();
    let examples = std::iter::empty();
    let mut trainer = Trainer::new(
        model,
        Box::new(ConstantChain),
        examples,
        1,
        TrainingSchedule::new(3, 2).unwrap(),
        TrainerConfig::default().with_out(dir.path()),
    );
    assert!(matches!(trainer.run(), Err(DetectorError::Worker(_))));
}

#[test]
fn zero_log_or_plot_interval_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    for config in [
        TrainerConfig::default().with_out(dir.path()).with_log_interval(0),
        TrainerConfig::default().with_out(dir.path()).with_plot_interval(0),
    ] {
        let model =
            common::build_tiny(common::tiny_config(), PretrainedSource::None, &PretrainedRegistry::empty()).unwrap();
        let mut trainer = Trainer::new(
            model,
            Box::new(ConstantChain),
            std::iter::empty(),
            1,
            TrainingSchedule::new(3, 2).unwrap(),
            config,
        );
        assert!(matches!(trainer.run(), Err(DetectorError::Configuration(_))));
    }
}

struct VocStub(Arc<Mutex<Vec<(String, String)>>>);

impl DatasetSource for VocStub {
    fn load(&self, split: &str, year: &str) -> anyhow::Result<Arc<dyn DetectionDataset>> {
        self.0.lock().unwrap().push((split.to_string(), year.to_string()));
        Ok(dataset(2))
    }
}

#[test]
fn run_train_wires_the_whole_loop() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("result");
    let args = TrainArgs::try_parse_from([
        "train",
        "--dataset",
        "voc0712",
        "--iteration",
        "4",
        "--step-size",
        "2",
        "--out",
        out.to_str().unwrap(),
    ])
    .unwrap();

    let loads = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(Mutex::new(0));
    let collaborators = TrainCollaborators::new(Box::new(VocStub(loads.clone())), Box::new(ConstantChain))
        .with_evaluator(Box::new(CountingEvaluator(calls.clone())))
        .with_backbones(BackboneRegistry::empty().with_backbone(common::tiny_spec("resnet50")))
        .with_pretrained(PretrainedRegistry::empty(), PretrainedSource::None)
        .with_loader(LoaderConfig::default().with_workers(2).with_prefetch(2));

    let summary = run_train(&args, collaborators).unwrap();
    assert_eq!(summary.iterations, 4);
    assert!((summary.final_lr - 1e-5).abs() < 1e-10);
    assert_eq!(summary.snapshot, out.join("snapshot_model.json"));
    assert!(summary.snapshot.exists());
    assert_eq!(*calls.lock().unwrap(), 5);
    assert_eq!(
        *loads.lock().unwrap(),
        vec![
            ("trainval".to_string(), "2007".to_string()),
            ("trainval".to_string(), "2012".to_string())
        ]
    );
}

#[test]
fn run_train_rejects_an_empty_schedule() {
    let args = TrainArgs::try_parse_from(["train", "--iteration", "0"]).unwrap();
    let collaborators = TrainCollaborators::new(Box::new(VocStub(Arc::default())), Box::new(ConstantChain));
    let err = run_train(&args, collaborators).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DetectorError>(),
        Some(DetectorError::Configuration(_))
    ));
}
