pub mod conversion;
pub mod manager;
pub mod models;
pub mod registry;

pub use conversion::{AllButLast, ConversionSpec, InputConversion, SelectColumns};
pub use manager::{ManagerOptions, ModelManager, TrainOutcome, DEFAULT_DESCRIPTION, FORMAT_VERSION};
pub use models::{EpochRecord, FitParams, History, LeastSquaresModel, Model, Objective, SgdModel};
pub use registry::{ConversionFactory, ModelLoader, Registry};
