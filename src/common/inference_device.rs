#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum InferenceDevice {
    #[default] CPU,
    CUDA(usize),
}

const CPU: &str = "CPU";
const CUDA: &str = "CUDA";

impl InferenceDevice {
    /// `--gpu` convention: a negative id selects the host.
    pub fn from_gpu_id(gpu: i64) -> Self {
        if gpu < 0 {
            InferenceDevice::CPU
        } else {
            InferenceDevice::CUDA(gpu as usize)
        }
    }

    pub fn str(&self) -> &'static str {
        match self {
            InferenceDevice::CPU => CPU,
            InferenceDevice::CUDA(_) => CUDA,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, InferenceDevice::CPU)
    }
}

impl std::fmt::Display for InferenceDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceDevice::CPU => write!(f, "{}", self.str()),
            InferenceDevice::CUDA(id) => write!(f, "{}:{}", self.str(), id),
        }
    }
}
