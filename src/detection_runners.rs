pub mod backend;
pub mod detector_model;
pub mod image_ops;
pub mod inference_process;
pub mod initializer;
pub mod nms;
pub mod region_proposal;
pub mod resnet;
pub mod roi_bridge;
pub mod weight_transplant;

pub use backend::{Backend, NdArrayBackend};
pub use detector_model::{DetectorModel, DetectorOutput};
pub use region_proposal::{AnchorProposer, FixedProposer, ProposalContext, ProposalSet, RegionProposer};
