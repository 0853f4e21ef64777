mod backbone;
mod bbox;
mod detection;
mod detector_error;
mod inference_device;
mod param_tree;
mod pretrained;
mod proposal;

pub use backbone::*;
pub use bbox::*;
pub use detection::*;
pub use detector_error::*;
pub use inference_device::*;
pub use param_tree::*;
pub use pretrained::*;
pub use proposal::*;
