#![doc = include_str!("../README.md")]

use std::path::PathBuf;

use argus_core::prelude::{Interval, Resolution};
use argus_m2m::M2mError;

pub mod probe;
pub mod source;

/// Errors raised while probing or streaming a camera.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The camera device could not be opened or refused the negotiation.
    #[error("capture backend: {0}")]
    Backend(String),

    /// The camera offers no format the pipeline can consume.
    #[error("no usable format on {path}")]
    NoUsableFormat { path: PathBuf },

    /// The chained hardware decoder failed.
    #[error(transparent)]
    Decode(#[from] M2mError),
}

/// Capture configuration resolved from the pipeline config.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CaptureConfig {
    /// Camera device node.
    pub device: PathBuf,
    /// Requested resolution; the driver may adjust it.
    pub resolution: Resolution,
    /// Requested frame interval, if any.
    pub interval: Option<Interval>,
    /// Decoder node used when the camera only offers compressed formats.
    pub decoder_device: PathBuf,
    /// Depth of the frame handoff queue.
    pub queue_depth: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            resolution: Resolution {
                width: std::num::NonZeroU32::new(1280).unwrap_or(std::num::NonZeroU32::MIN),
                height: std::num::NonZeroU32::new(720).unwrap_or(std::num::NonZeroU32::MIN),
            },
            interval: None,
            decoder_device: PathBuf::from("/dev/video10"),
            queue_depth: 4,
        }
    }
}

pub mod prelude {
    pub use crate::probe::{CameraInfo, list_cameras, preferred_format, probe_formats};
    pub use crate::source::{CaptureHandle, start_capture};
    pub use crate::{CaptureConfig, CaptureError};
}
