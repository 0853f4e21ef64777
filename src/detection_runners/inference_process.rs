use std::time::Instant;

use crate::common::DetectorResult;
use crate::utils;

/// Three-step inference pipeline: prepare inputs, run the network, decode.
pub trait InferenceProcess {
    type Input;
    type Prepared;
    type Raw;
    type Output;

    /// Pre-process the input data.
    fn preprocess(&self, xs: &[Self::Input]) -> DetectorResult<Vec<Self::Prepared>>;

    /// Executes the model on the preprocessed data.
    fn inference(&mut self, xs: Vec<Self::Prepared>) -> DetectorResult<Vec<Self::Raw>>;

    /// Post-process the model's output against the original inputs.
    fn postprocess(&self, ys: Vec<Self::Raw>, xs0: &[Self::Input]) -> DetectorResult<Vec<Self::Output>>;

    /// Executes the full pipeline.
    fn run(&mut self, xs: &[Self::Input]) -> DetectorResult<Vec<Self::Output>> {
        let ys = self.preprocess(xs)?;
        let ys = self.inference(ys)?;
        self.postprocess(ys, xs)
    }

    /// Executes the full pipeline, tracing the time spent in each step.
    fn run_profiled(&mut self, xs: &[Self::Input], profile: bool) -> DetectorResult<Vec<Self::Output>> {
        let detect_time = Instant::now();
        let mut detect_elapsed = detect_time.elapsed();

        let t_pre = Instant::now();
        let ys = self.preprocess(xs)?;
        let t_pre = t_pre.elapsed();
        detect_elapsed = utils::trace(false, "TIME", "Preprocessing input", detect_time, detect_elapsed);

        let t_exe = Instant::now();
        let ys = self.inference(ys)?;
        let t_exe = t_exe.elapsed();
        detect_elapsed = utils::trace(false, "TIME", "Detection run", detect_time, detect_elapsed);

        let t_post = Instant::now();
        let ys = self.postprocess(ys, xs)?;
        let t_post = t_post.elapsed();
        utils::trace(false, "TIME", "Postprocessing", detect_time, detect_elapsed);

        if profile {
            log::info!("> Preprocess: {t_pre:?} | Inference: {t_exe:?} | Postprocess: {t_post:?}");
        }
        Ok(ys)
    }
}
