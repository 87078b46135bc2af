mod engine;
#[cfg(feature = "ffmpeg-cli")]
mod ffmpeg;

pub use engine::{CancelToken, EngineError, EngineResult, MediaEngine, NullMediaEngine};
#[cfg(feature = "ffmpeg-cli")]
pub use ffmpeg::FfmpegCliEngine;
