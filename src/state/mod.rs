pub mod extractor;
pub mod stabilizer;

pub use extractor::{
    BiasState, DerivativesState, DeterministicState, ExecutionState, FeatureInputs, FlowState,
    RegimeState, StateExtractor, ToxicityState,
};
pub use stabilizer::Stabilized;
