use crate::common::{DetectorError, DetectorResult};

/// Shape of a bottleneck ResNet: number of blocks in each of `res2..res5` and
/// the width of `conv1`. Stage `k` (2-based) uses `base_width * 2^(k-2)` middle
/// channels and four times that on its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneSpec {
    pub name: String,
    pub blocks: [usize; 4],
    pub base_width: usize,
}

/// Backbone stages, in execution order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Conv1,
    Res2,
    Res3,
    Res4,
    Res5,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Conv1 => "conv1",
            Self::Res2 => "res2",
            Self::Res3 => "res3",
            Self::Res4 => "res4",
            Self::Res5 => "res5",
        }
    }

    pub fn residual() -> [Stage; 4] {
        [Stage::Res2, Stage::Res3, Stage::Res4, Stage::Res5]
    }

    fn residual_index(&self) -> Option<usize> {
        match self {
            Self::Conv1 => None,
            Self::Res2 => Some(0),
            Self::Res3 => Some(1),
            Self::Res4 => Some(2),
            Self::Res5 => Some(3),
        }
    }
}

impl BackboneSpec {
    pub fn new(name: &str, blocks: [usize; 4], base_width: usize) -> Self {
        Self {
            name: name.to_string(),
            blocks,
            base_width,
        }
    }

    pub fn resnet50() -> Self {
        Self::new("resnet50", [3, 4, 6, 3], 64)
    }

    pub fn resnet101() -> Self {
        Self::new("resnet101", [3, 4, 23, 3], 64)
    }

    pub fn conv1_channels(&self) -> usize {
        self.base_width
    }

    /// `(in, mid, out)` channels of a residual stage.
    pub fn stage_channels(&self, stage: Stage) -> (usize, usize, usize) {
        let Some(i) = stage.residual_index() else {
            return (3, self.base_width, self.base_width);
        };
        let mid = self.base_width << i;
        let input = if i == 0 { self.base_width } else { mid * 2 };
        (input, mid, mid * 4)
    }

    pub fn stage_blocks(&self, stage: Stage) -> usize {
        stage.residual_index().map(|i| self.blocks[i]).unwrap_or(1)
    }

    /// Channels of the feature map the detector's backbone emits (`res4`).
    pub fn feature_channels(&self) -> usize {
        self.stage_channels(Stage::Res4).2
    }

    /// Channels entering the two head projections (`res5`).
    pub fn head_channels(&self) -> usize {
        self.stage_channels(Stage::Res5).2
    }

    /// Width of the proposal stage's 3x3 convolution.
    pub fn rpn_mid_channels(&self) -> usize {
        self.base_width * 8
    }
}

/// Immutable table of the backbones a builder can assemble.
#[derive(Debug, Clone)]
pub struct BackboneRegistry {
    entries: Vec<BackboneSpec>,
}

impl Default for BackboneRegistry {
    fn default() -> Self {
        Self {
            entries: vec![BackboneSpec::resnet50(), BackboneSpec::resnet101()],
        }
    }
}

impl BackboneRegistry {
    pub fn empty() -> Self {
        Self { entries: vec![] }
    }

    pub fn with_backbone(mut self, spec: BackboneSpec) -> Self {
        self.entries.retain(|e| e.name != spec.name);
        self.entries.push(spec);
        self
    }

    pub fn lookup(&self, name: &str) -> DetectorResult<&BackboneSpec> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                DetectorError::configuration(format!(
                    "unknown backbone `{name}` (known: {})",
                    self.names().join(", ")
                ))
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resnet50_channels_match_reference_widths() {
        let spec = BackboneSpec::resnet50();
        assert_eq!(spec.stage_channels(Stage::Res2), (64, 64, 256));
        assert_eq!(spec.stage_channels(Stage::Res3), (256, 128, 512));
        assert_eq!(spec.stage_channels(Stage::Res4), (512, 256, 1024));
        assert_eq!(spec.stage_channels(Stage::Res5), (1024, 512, 2048));
        assert_eq!(spec.rpn_mid_channels(), 512);
        assert_eq!(spec.stage_blocks(Stage::Res4), 6);
    }

    #[test]
    fn unknown_backbone_is_a_configuration_error() {
        let registry = BackboneRegistry::default();
        assert!(registry.lookup("ResNet101").is_ok());
        assert!(matches!(registry.lookup("vgg19"), Err(DetectorError::Configuration(_))));
    }
}
