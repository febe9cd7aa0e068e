//! Stabilizer invocation building

pub mod stabilizer;

pub use stabilizer::{
    build_invocation, BuildError, Dimensions, OutputParams, PresetBlock, RenderSettings,
    StabilizerInvocation,
};
