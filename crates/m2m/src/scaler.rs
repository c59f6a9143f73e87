//! ISP-backed hardware scaler.
//!
//! Resizes planar YUV 4:2:0 frames between the camera's native geometry
//! and the encoder's target geometry. Typically fed zero-copy from the
//! decoder's exported buffers, with its own results exported onward to the
//! encoder.

use std::{path::Path, sync::Arc};

use argus_core::prelude::{Resolution, StageMetrics, FOURCC_YUV420};

use crate::{
    buffer::{BufferSource, MemoryKind},
    device::{CodecDevice, CodecRole, CompletionFn, QueueConfig},
    M2mError,
};

const SCALER_BUFFERS: u32 = 2;

struct ScalerRole;

impl CodecRole for ScalerRole {
    fn name(&self) -> &'static str {
        "scaler"
    }
}

/// Hardware resize stage (`/dev/video12` on the Pi).
pub struct Scaler {
    device: CodecDevice,
}

impl Scaler {
    /// Open and start a scaler converting `from` frames to `to` frames.
    /// `input` selects copied bytes or zero-copy DMA-BUF input.
    pub fn open(
        path: &Path,
        from: Resolution,
        to: Resolution,
        input: MemoryKind,
    ) -> Result<Self, M2mError> {
        let mut device = CodecDevice::open(path)?;
        device.configure(
            QueueConfig {
                fourcc: FOURCC_YUV420,
                resolution: from,
                sizeimage: 0,
                count: SCALER_BUFFERS,
                kind: input,
            },
            QueueConfig {
                fourcc: FOURCC_YUV420,
                resolution: to,
                sizeimage: 0,
                count: SCALER_BUFFERS,
                kind: MemoryKind::MmapExported,
            },
        )?;
        device.start(ScalerRole)?;
        Ok(Self { device })
    }

    /// Submit one frame for resizing. `on_frame` runs on the scaler's
    /// worker thread with the resized frame, in submission order.
    pub fn scale(
        &self,
        frame: BufferSource<'_>,
        timestamp_us: u64,
        on_frame: CompletionFn,
    ) -> Result<(), M2mError> {
        self.device.emplace_buffer(frame, timestamp_us, on_frame)
    }

    /// Submissions not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.device.in_flight()
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        self.device.metrics()
    }

    /// Stop streaming and release buffers. Idempotent.
    pub fn stop(&mut self) {
        self.device.stop();
    }
}
