#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod controls;
pub mod format;
pub mod metrics;
pub mod queue;
pub mod worker;

pub mod prelude {
    pub use crate::{
        buffer::{FrameBuffer, FrameMeta, Plane},
        controls::{ControlId, ControlValue},
        format::{
            FOURCC_H264, FOURCC_MJPG, FOURCC_YUV420, FourCc, Interval, MediaFormat, Resolution,
        },
        metrics::StageMetrics,
        queue::{
            BoundedRx, BoundedTx, FifoQueue, NewestRx, NewestTx, RecvOutcome, SendOutcome,
            bounded, newest,
        },
        worker::Worker,
    };
}
