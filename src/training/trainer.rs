//! Training loop and its periodic actions.
//!
//! After every update, in this order: evaluation at schedule points, the log
//! record, the loss plot, the final snapshot and finally the learning-rate
//! shift, so a record written at a decay iteration still shows the old rate.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::common::{DetectorError, DetectorResult};
use crate::data::{TimeCalc, TrainingSchedule};
use crate::detection_runners::DetectorModel;
use crate::training::dataset::TrainExample;
use crate::training::optimizer::{Gradients, MomentumSgd};
use crate::training::report::{LogRecord, LogReport, LossTerms};

pub const SNAPSHOT_FILE: &str = "snapshot_model.json";
pub const PLOT_FILE: &str = "loss.png";

/// Loss and gradient computation for one example. The model must be run
/// with `training = true`.
pub trait TrainChain {
    fn step(&mut self, model: &mut DetectorModel, example: &TrainExample) -> DetectorResult<(LossTerms, Gradients)>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Mean average precision over the classes.
    pub map: f64,
    pub ap: Vec<f64>,
}

pub trait Evaluator {
    fn evaluate(&mut self, model: &mut DetectorModel) -> DetectorResult<Evaluation>;
}

pub trait LossPlotter {
    fn plot(&mut self, records: &[LogRecord], path: &Path) -> DetectorResult<()>;
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub out: PathBuf,
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub lr_shift: f32,
    pub log_interval: u64,
    pub plot_interval: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            out: PathBuf::from("result"),
            lr: 1e-3,
            momentum: 0.9,
            weight_decay: 5e-4,
            lr_shift: 0.1,
            log_interval: 20,
            plot_interval: 3000,
        }
    }
}

impl TrainerConfig {
    pub fn with_out<P: AsRef<Path>>(mut self, out: P) -> Self {
        self.out = out.as_ref().to_path_buf();
        self
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_weight_decay(mut self, rate: f32) -> Self {
        self.weight_decay = rate;
        self
    }

    pub fn with_log_interval(mut self, n: u64) -> Self {
        self.log_interval = n;
        self
    }

    pub fn with_plot_interval(mut self, n: u64) -> Self {
        self.plot_interval = n;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub iterations: u64,
    pub final_lr: f32,
    /// Iterations at which the evaluator ran, with its result.
    pub evaluations: Vec<(u64, Evaluation)>,
    pub snapshot: PathBuf,
}

pub struct Trainer<I> {
    model: DetectorModel,
    chain: Box<dyn TrainChain>,
    loader: I,
    epoch_len: usize,
    schedule: TrainingSchedule,
    optimizer: MomentumSgd,
    evaluator: Option<Box<dyn Evaluator>>,
    plotter: Option<Box<dyn LossPlotter>>,
    config: TrainerConfig,
}

impl<I> Trainer<I>
where
    I: Iterator<Item = DetectorResult<TrainExample>>,
{
    pub fn new(
        model: DetectorModel,
        chain: Box<dyn TrainChain>,
        loader: I,
        epoch_len: usize,
        schedule: TrainingSchedule,
        config: TrainerConfig,
    ) -> Self {
        let optimizer = MomentumSgd::new(config.lr, config.momentum, config.weight_decay);
        Self {
            model,
            chain,
            loader,
            epoch_len: epoch_len.max(1),
            schedule,
            optimizer,
            evaluator: None,
            plotter: None,
            config,
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

    pub fn model(&self) -> &DetectorModel {
        &self.model
    }

    pub fn into_model(self) -> DetectorModel {
        self.model
    }

    fn evaluate(&mut self, iteration: u64, evaluations: &mut Vec<(u64, Evaluation)>) -> DetectorResult<()> {
        if let Some(evaluator) = self.evaluator.as_mut() {
            let t = Instant::now();
            let result = evaluator.evaluate(&mut self.model)?;
            log::info!("Evaluation at iteration {iteration}: map={:.4} ({:.2?})", result.map, t.elapsed());
            evaluations.push((iteration, result));
        }
        Ok(())
    }

    pub fn run(&mut self) -> DetectorResult<TrainSummary> {
        if self.config.log_interval == 0 || self.config.plot_interval == 0 {
            return Err(DetectorError::configuration("log and plot intervals must be positive"));
        }
        let start = Instant::now();
        let mut report = LogReport::new(&self.config.out);
        let mut timing = TimeCalc::default();
        let mut evaluations = Vec::new();
        let snapshot = self.config.out.join(SNAPSHOT_FILE);

        log::info!(
            "Training for {} iterations, lr {} shifted by {} every {} iterations",
            self.schedule.total_iterations,
            self.optimizer.lr,
            self.config.lr_shift,
            self.schedule.lr_decay_iteration
        );
        if self.schedule.is_evaluation_point(0) {
            self.evaluate(0, &mut evaluations)?;
        }

        for iteration in 1..=self.schedule.total_iterations {
            let t = Instant::now();
            let example = self
                .loader
                .next()
                .unwrap_or_else(|| Err(DetectorError::Worker("data loader ended".to_string())))?;
            timing.add_or_push(0, t.elapsed());

            let t = Instant::now();
            let (terms, grads) = self.chain.step(&mut self.model, &example)?;
            self.optimizer.update(self.model.params_mut(), &grads)?;
            timing.add_or_push(1, t.elapsed());
            report.observe(&terms);

            if self.schedule.is_evaluation_point(iteration) {
                self.evaluate(iteration, &mut evaluations)?;
            }
            if iteration % self.config.log_interval == 0 {
                let epoch = iteration / self.epoch_len as u64;
                let map = evaluations.last().map(|(_, e)| e.map);
                report.emit(iteration, epoch, start.elapsed().as_secs_f64(), self.optimizer.lr, map)?;
                log::trace!(
                    "fetch {:?} | step {:?} | total {:?} per iteration",
                    timing.avg_i(0).unwrap_or_default(),
                    timing.avg_i(1).unwrap_or_default(),
                    timing.avg()
                );
                timing.clear();
            }
            if iteration % self.config.plot_interval == 0 {
                if let Some(plotter) = self.plotter.as_mut() {
                    plotter.plot(report.records(), &self.config.out.join(PLOT_FILE))?;
                }
            }
            if self.schedule.is_final(iteration) {
                self.model.save_snapshot(&snapshot)?;
                log::info!("Saved detector to {}", snapshot.display());
            }
            if self.schedule.should_decay(iteration) {
                self.optimizer.shift_lr(self.config.lr_shift);
                log::info!("Learning rate shifted to {:e}", self.optimizer.lr);
            }
        }

        Ok(TrainSummary {
            iterations: self.schedule.total_iterations,
            final_lr: self.optimizer.lr,
            evaluations,
            snapshot,
        })
    }
}
