//! Mosaic Weights
//!
//! Reading and normalizing checkpoint weights:
//! - Memory-mapped tensor archives (`TensorArchive`)
//! - Checkpoint key mapping onto module paths (`WeightKeyMapper`)
//! - Layout and dtype conversion
//! - Quantization plans from component configs and manifests (`QuantizationPlanResolver`)
//! - Loading whole snapshot components (`load_component`)

pub mod archive;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod loader;
pub mod mapper;
mod numeric;
pub mod quantization;

pub use archive::{ArchiveTensor, TensorArchive, TensorRecord, write_archive};
pub use dtype::DType;
pub use error::{KeyMappingError, WeightsError, WeightsResult};
pub use layout::{decode_to_f32, permute_nchw_to_nhwc};
pub use loader::{
    ComponentWeights, LoadedParameter, ParameterData, SnapshotLayout, load_component,
    required_parameters,
};
pub use mapper::{ChannelOrder, KeyMapping, KeyTransform, ParameterPlan, WeightKeyMapper};
pub use quantization::{
    LayerQuantization, PrepackedLayer, QuantizationManifest, QuantizationMode, QuantizationPlan,
    QuantizationPlanResolver, QuantizationSpec,
};
