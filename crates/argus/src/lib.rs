#![doc = include_str!("../README.md")]

use argus_capture::CaptureError;
use argus_m2m::M2mError;

pub mod config;
pub mod pipeline;
pub mod recorder;
pub mod track;

/// Top-level pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The camera path failed.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// A codec device failed and no fallback applied.
    #[error(transparent)]
    Codec(#[from] M2mError),

    /// Hardware encode is disabled and no software encoder was supplied.
    #[error("no encoder available: hardware disabled and no software fallback")]
    NoEncoder,

    /// Worker or sink I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub mod prelude {
    pub use crate::PipelineError;
    pub use crate::config::PipelineConfig;
    pub use crate::pipeline::Pipeline;
    pub use crate::recorder::{MediaPacket, PacketSink, VIDEO_STREAM, VideoRecorder};
    pub use crate::track::{EncodedFrame, EncodedTrack, OnEncoded, SoftwareEncoder};
}
