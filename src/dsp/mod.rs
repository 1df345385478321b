pub mod gain_controller;
pub mod limiter;
pub mod utils;

pub use gain_controller::{
    AudioBlockProcessor, BlockStatus, GainController, GainParameters, ProcessorState,
    SilenceReason,
};
pub use limiter::{LimiterConfig, LimiterStage};
