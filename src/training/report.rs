use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::{DetectorError, DetectorResult};

/// Loss terms reported by one training step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossTerms {
    pub loss: f32,
    pub roi_loc_loss: f32,
    pub roi_cls_loss: f32,
    pub rpn_loc_loss: f32,
    pub rpn_cls_loss: f32,
}

impl LossTerms {
    fn add(&mut self, other: &LossTerms) {
        self.loss += other.loss;
        self.roi_loc_loss += other.roi_loc_loss;
        self.roi_cls_loss += other.roi_cls_loss;
        self.rpn_loc_loss += other.rpn_loc_loss;
        self.rpn_cls_loss += other.rpn_cls_loss;
    }

    fn mean(&self, n: usize) -> LossTerms {
        let n = n.max(1) as f32;
        LossTerms {
            loss: self.loss / n,
            roi_loc_loss: self.roi_loc_loss / n,
            roi_cls_loss: self.roi_cls_loss / n,
            rpn_loc_loss: self.rpn_loc_loss / n,
            rpn_cls_loss: self.rpn_cls_loss / n,
        }
    }
}

/// One line of the training log, averaged over the interval it closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub iteration: u64,
    pub epoch: u64,
    pub elapsed_time: f64,
    pub lr: f32,
    #[serde(rename = "main/loss")]
    pub loss: f32,
    #[serde(rename = "main/roi_loc_loss")]
    pub roi_loc_loss: f32,
    #[serde(rename = "main/roi_cls_loss")]
    pub roi_cls_loss: f32,
    #[serde(rename = "main/rpn_loc_loss")]
    pub rpn_loc_loss: f32,
    #[serde(rename = "main/rpn_cls_loss")]
    pub rpn_cls_loss: f32,
    #[serde(rename = "validation/main/map", skip_serializing_if = "Option::is_none", default)]
    pub map: Option<f64>,
}

/// Accumulates loss terms between log points and rewrites `{out}/log` as a
/// JSON array of every record so far.
#[derive(Debug)]
pub struct LogReport {
    path: PathBuf,
    records: Vec<LogRecord>,
    sums: LossTerms,
    count: usize,
}

impl LogReport {
    pub fn new(out: &Path) -> Self {
        Self {
            path: out.join("log"),
            records: Vec::new(),
            sums: LossTerms::default(),
            count: 0,
        }
    }

    pub fn observe(&mut self, terms: &LossTerms) {
        self.sums.add(terms);
        self.count += 1;
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn emit(
        &mut self,
        iteration: u64,
        epoch: u64,
        elapsed_time: f64,
        lr: f32,
        map: Option<f64>,
    ) -> DetectorResult<&LogRecord> {
        let mean = self.sums.mean(self.count);
        self.sums = LossTerms::default();
        self.count = 0;
        let record = LogRecord {
            iteration,
            epoch,
            elapsed_time,
            lr,
            loss: mean.loss,
            roi_loc_loss: mean.roi_loc_loss,
            roi_cls_loss: mean.roi_cls_loss,
            rpn_loc_loss: mean.rpn_loc_loss,
            rpn_cls_loss: mean.rpn_cls_loss,
            map,
        };
        log::info!(
            "iter {:>7} | epoch {:>3} | {:>9.1}s | lr {:.2e} | loss {:.4} | roi_loc {:.4} | roi_cls {:.4} | rpn_loc {:.4} | rpn_cls {:.4} | map {}",
            record.iteration,
            record.epoch,
            record.elapsed_time,
            record.lr,
            record.loss,
            record.roi_loc_loss,
            record.roi_cls_loss,
            record.rpn_loc_loss,
            record.rpn_cls_loss,
            record.map.map(|m| format!("{m:.4}")).unwrap_or_default()
        );
        self.records.push(record);
        self.write()?;
        Ok(&self.records[self.records.len() - 1])
    }

    fn write(&self) -> DetectorResult<()> {
        let io_err = |source| DetectorError::Io { path: self.path.clone(), source };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = fs::File::create(&self.path).map_err(io_err)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.records).map_err(|source| DetectorError::Json {
            path: self.path.clone(),
            source,
        })
    }
}
