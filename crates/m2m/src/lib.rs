#![doc = include_str!("../README.md")]

use std::path::PathBuf;

pub mod buffer;
pub mod decoder;
pub mod device;
pub mod encoder;
pub mod scaler;
pub mod sys;

/// Kernel device nodes for the codec triad.
///
/// Passed at construction so tests and multi-instance setups can target
/// different nodes; the defaults are the Raspberry Pi assignments.
///
/// # Example
/// ```rust
/// use argus_m2m::DeviceNodes;
///
/// let nodes = DeviceNodes::default();
/// assert_eq!(nodes.encoder.to_str(), Some("/dev/video11"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceNodes {
    /// Stateful decoder node.
    pub decoder: PathBuf,
    /// Scaler (ISP resize) node.
    pub scaler: PathBuf,
    /// Stateful encoder node.
    pub encoder: PathBuf,
}

impl Default for DeviceNodes {
    fn default() -> Self {
        Self {
            decoder: PathBuf::from("/dev/video10"),
            scaler: PathBuf::from("/dev/video12"),
            encoder: PathBuf::from("/dev/video11"),
        }
    }
}

/// Errors raised by the codec device layer.
#[derive(Debug, thiserror::Error)]
pub enum M2mError {
    /// The device node could not be opened or lacks the M2M capability.
    /// Fatal to that device; callers decide whether to fall back to a
    /// software path.
    #[error("device {path} unavailable: {reason}")]
    DeviceUnavailable { path: PathBuf, reason: String },

    /// The kernel rejected the requested format or buffer count during
    /// configuration.
    #[error("buffer allocation failed on {queue} queue: {source}")]
    BufferAllocationFailed {
        queue: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A live control write (e.g. bitrate) was rejected. Non-fatal: the
    /// previous value stays applied.
    #[error("control 0x{id:08x} update failed: {source}")]
    ControlUpdateFailed {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    /// A submission was attempted while the device was not streaming.
    #[error("device is not streaming")]
    NotStreaming,

    /// Kernel I/O error outside the configuration path.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl M2mError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            M2mError::DeviceUnavailable { .. } => "device_unavailable",
            M2mError::BufferAllocationFailed { .. } => "buffer_allocation_failed",
            M2mError::ControlUpdateFailed { .. } => "control_update_failed",
            M2mError::NotStreaming => "not_streaming",
            M2mError::Io(_) => "io",
        }
    }

    /// Whether the owning stage may keep running after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, M2mError::ControlUpdateFailed { .. })
    }
}

pub mod prelude {
    pub use crate::buffer::{
        BufferGroup, BufferSource, CompletedBuffer, Direction, DmaBuf, DmaHandle, GroupFormat,
        MemoryKind,
    };
    pub use crate::decoder::Decoder;
    pub use crate::device::{CodecDevice, CodecRole, CompletionFn};
    pub use crate::encoder::{Encoder, EncoderTuning};
    pub use crate::scaler::Scaler;
    pub use crate::{DeviceNodes, M2mError};
}
