use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::common::{BackboneSpec, Composite, DetectorError, DetectorResult};
use crate::data::{FsAccess, Snapshot};

/// Where a detector's initial parameters come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PretrainedSource {
    /// Random initialization only.
    #[default]
    None,
    /// A complete detector snapshot on disk.
    Path(PathBuf),
    /// An entry of the builder's [`PretrainedRegistry`].
    Named(String),
}

/// Supplies a trained classification network whose `conv1`, `bn1` and
/// `res2..res5` stages are transplanted into a detector.
pub trait ClassifierSource: Debug + Send + Sync {
    fn load(&self, backbone: &BackboneSpec) -> DetectorResult<Composite>;
}

/// Reads `{dir}/{backbone}_imagenet.json` snapshots. Without an explicit
/// directory the user's model cache is used.
#[derive(Debug, Clone, Default)]
pub struct SnapshotClassifier {
    pub dir: Option<PathBuf>,
}

impl SnapshotClassifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: Some(dir.into()) }
    }
}

impl ClassifierSource for SnapshotClassifier {
    fn load(&self, backbone: &BackboneSpec) -> DetectorResult<Composite> {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => FsAccess::models_dir().map_err(|e| DetectorError::configuration(e.to_string()))?,
        };
        let path = dir.join(format!("{}_imagenet.json", backbone.name));
        log::info!("Loading classification weights from {}", path.display());
        Snapshot::load(&path)?.to_tree()
    }
}

#[derive(Debug, Clone)]
pub enum PretrainedEntry {
    /// Trained detector weights; also fixes the default class count.
    Detector { path: PathBuf, n_fg_class: usize },
    Classification(Arc<dyn ClassifierSource>),
}

/// Immutable table of named pretrained sources owned by the detector builder.
#[derive(Debug, Clone)]
pub struct PretrainedRegistry {
    entries: BTreeMap<String, PretrainedEntry>,
}

impl Default for PretrainedRegistry {
    fn default() -> Self {
        Self::empty().with_classifier("imagenet", Arc::new(SnapshotClassifier::default()))
    }
}

impl PretrainedRegistry {
    pub fn empty() -> Self {
        Self { entries: BTreeMap::new() }
    }

    pub fn with_detector(mut self, name: &str, path: impl Into<PathBuf>, n_fg_class: usize) -> Self {
        self.entries.insert(
            name.to_string(),
            PretrainedEntry::Detector { path: path.into(), n_fg_class },
        );
        self
    }

    pub fn with_classifier(mut self, name: &str, source: Arc<dyn ClassifierSource>) -> Self {
        self.entries.insert(name.to_string(), PretrainedEntry::Classification(source));
        self
    }

    pub fn lookup(&self, name: &str) -> DetectorResult<&PretrainedEntry> {
        self.entries.get(name).ok_or_else(|| {
            DetectorError::configuration(format!(
                "unknown pretrained model `{name}` (known: {})",
                self.entries.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    /// Class count implied by a named detector entry, if any.
    pub fn default_n_fg_class(&self, source: &PretrainedSource) -> Option<usize> {
        match source {
            PretrainedSource::Named(name) => match self.entries.get(name) {
                Some(PretrainedEntry::Detector { n_fg_class, .. }) => Some(*n_fg_class),
                _ => None,
            },
            _ => None,
        }
    }
}
