//! Stateful hardware video decoder.
//!
//! Feeds compressed access units (MJPEG frames or H.264 NAL sequences) to
//! the decoder node and delivers planar YUV 4:2:0 frames through completion
//! callbacks. Mid-stream resolution changes are handled by reallocating the
//! result queue in place; submissions made during the switch simply complete
//! at the new geometry.

use std::{path::Path, sync::Arc};

use argus_core::prelude::{FourCc, Resolution, StageMetrics, FOURCC_YUV420};
use tracing::{debug, info};

use crate::{
    buffer::{BufferGroup, BufferSource, Direction, MemoryKind},
    device::{CodecDevice, CodecRole, CompletionFn, DeviceHandle, QueueConfig},
    sys, M2mError,
};

/// Slots per queue. Two is enough to keep the silicon busy while the
/// previous result is being consumed.
const DECODER_BUFFERS: u32 = 2;

/// Capacity for one compressed access unit. Generous for MJPEG at the
/// resolutions the ISP produces.
const CODED_SIZEIMAGE: u32 = 512 * 1024;

struct DecoderRole {
    capture_count: u32,
}

impl CodecRole for DecoderRole {
    fn name(&self) -> &'static str {
        "decoder"
    }

    /// Only the decoder renegotiates mid-stream; encoder and scaler nodes
    /// reject these subscriptions.
    fn events(&self) -> &'static [u32] {
        &[sys::V4L2_EVENT_SOURCE_CHANGE, sys::V4L2_EVENT_EOS]
    }

    fn handle_event(
        &mut self,
        event: &sys::v4l2_event,
        device: &DeviceHandle,
        capture: &mut BufferGroup,
    ) -> Result<(), M2mError> {
        match event.type_ {
            sys::V4L2_EVENT_SOURCE_CHANGE => {
                // The coded stream changed geometry. Only the result queue
                // is rebuilt; the compressed input queue keeps streaming.
                let kind = capture.kind();
                device.stream_off(Direction::Capture)?;
                capture.release();
                device.request_buffers(Direction::Capture, kind, 0)?;
                let fresh = device.alloc_group(Direction::Capture, kind, self.capture_count)?;
                for index in 0..fresh.len() as u32 {
                    device.queue_capture(index, kind)?;
                }
                device.stream_on(Direction::Capture)?;
                info!(
                    format = %fresh.format().fourcc,
                    resolution = %fresh.format().resolution,
                    "decoder renegotiated result queue"
                );
                *capture = fresh;
                Ok(())
            }
            sys::V4L2_EVENT_EOS => {
                debug!("decoder signalled end of stream");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Hardware decoder stage (`/dev/video10` on the Pi).
pub struct Decoder {
    device: CodecDevice,
}

impl Decoder {
    /// Open and start a decoder for the given compressed format. The
    /// resolution is the camera's advertised coded size; the driver may
    /// revise it via a source-change event once it parses the stream.
    pub fn open(path: &Path, coded: FourCc, resolution: Resolution) -> Result<Self, M2mError> {
        let mut device = CodecDevice::open(path)?;
        device.configure(
            QueueConfig {
                fourcc: coded,
                resolution,
                sizeimage: CODED_SIZEIMAGE,
                count: DECODER_BUFFERS,
                kind: MemoryKind::Mmap,
            },
            QueueConfig {
                fourcc: FOURCC_YUV420,
                resolution,
                sizeimage: 0,
                count: DECODER_BUFFERS,
                kind: MemoryKind::MmapExported,
            },
        )?;
        device.start(DecoderRole {
            capture_count: DECODER_BUFFERS,
        })?;
        Ok(Self { device })
    }

    /// Submit one compressed access unit. `on_frame` runs on the decoder's
    /// worker thread with the decoded YUV frame, in submission order.
    pub fn decode(
        &self,
        bitstream: &[u8],
        timestamp_us: u64,
        on_frame: CompletionFn,
    ) -> Result<(), M2mError> {
        self.device
            .emplace_buffer(BufferSource::Bytes(bitstream), timestamp_us, on_frame)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_decoder_role_subscribes_stream_events() {
        let role = DecoderRole { capture_count: 2 };
        assert_eq!(
            role.events(),
            &[sys::V4L2_EVENT_SOURCE_CHANGE, sys::V4L2_EVENT_EOS]
        );
    }
}
