//! Stateful hardware H.264 encoder.
//!
//! Accepts planar YUV 4:2:0 input (copied bytes or zero-copy DMA-BUF
//! handles from an upstream stage) and emits an H.264 elementary stream.
//! Bitrate and frame rate are adjustable while streaming; keyframes can be
//! forced for recording start points.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use argus_core::prelude::{Resolution, StageMetrics, FOURCC_H264, FOURCC_YUV420};
use tracing::debug;

use crate::{
    buffer::{BufferSource, MemoryKind},
    device::{CodecDevice, CodecRole, CompletionFn, QueueConfig},
    sys, M2mError,
};

/// Slots per queue. The encoder runs deeper than the decoder so bitrate
/// spikes do not stall the camera thread.
const ENCODER_BUFFERS: u32 = 4;

/// Capacity for one coded frame.
const CODED_SIZEIMAGE: u32 = 512 * 1024;

/// The codec silicon works in steps of this many bits per second; values
/// in between round down.
const BITRATE_QUANTUM: u32 = 25_000;

/// Below this the rate controller produces unusable output.
const BITRATE_FLOOR: u32 = 1_000_000;

/// Clamp a requested bitrate to what the encoder accepts: at least the
/// floor, and a whole multiple of the quantum.
pub fn align_bitrate(requested: u32) -> u32 {
    let clamped = requested.max(BITRATE_FLOOR);
    clamped - clamped % BITRATE_QUANTUM
}

/// Initial encoder parameters.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncoderTuning {
    /// Target bitrate in bits per second. Aligned on apply.
    pub bitrate_bps: u32,
    /// Nominal input frame rate, used by the rate controller.
    pub fps: u32,
    /// Frames between forced IDR keyframes.
    pub keyframe_interval: u32,
}

impl Default for EncoderTuning {
    fn default() -> Self {
        Self {
            bitrate_bps: 5_000_000,
            fps: 30,
            keyframe_interval: 600,
        }
    }
}

struct EncoderRole;

impl CodecRole for EncoderRole {
    fn name(&self) -> &'static str {
        "encoder"
    }
}

/// Hardware encoder stage (`/dev/video11` on the Pi).
pub struct Encoder {
    device: CodecDevice,
    applied_bitrate: AtomicU32,
    applied_fps: AtomicU32,
}

impl Encoder {
    /// Open and start an encoder. `input` selects how frames arrive:
    /// [`MemoryKind::Mmap`] for copied bytes, [`MemoryKind::Dmabuf`] for
    /// zero-copy handles exported by an upstream device.
    pub fn open(
        path: &Path,
        resolution: Resolution,
        tuning: EncoderTuning,
        input: MemoryKind,
    ) -> Result<Self, M2mError> {
        let mut device = CodecDevice::open(path)?;
        device.configure(
            QueueConfig {
                fourcc: FOURCC_YUV420,
                resolution,
                sizeimage: 0,
                count: ENCODER_BUFFERS,
                kind: input,
            },
            QueueConfig {
                fourcc: FOURCC_H264,
                resolution,
                sizeimage: CODED_SIZEIMAGE,
                count: ENCODER_BUFFERS,
                kind: MemoryKind::Mmap,
            },
        )?;

        // Stream properties are baked in before the first frame; SPS/PPS
        // repetition keeps late joiners decodable.
        let handle = device.handle();
        handle.set_control(sys::V4L2_CID_MPEG_VIDEO_REPEAT_SEQ_HEADER, 1)?;
        handle.set_control(
            sys::V4L2_CID_MPEG_VIDEO_H264_PROFILE,
            sys::V4L2_MPEG_VIDEO_H264_PROFILE_BASELINE,
        )?;
        handle.set_control(
            sys::V4L2_CID_MPEG_VIDEO_H264_LEVEL,
            sys::V4L2_MPEG_VIDEO_H264_LEVEL_4_0,
        )?;
        handle.set_control(
            sys::V4L2_CID_MPEG_VIDEO_H264_I_PERIOD,
            tuning.keyframe_interval as i32,
        )?;
        handle.set_control(
            sys::V4L2_CID_MPEG_VIDEO_BITRATE_MODE,
            sys::V4L2_MPEG_VIDEO_BITRATE_MODE_VBR,
        )?;
        let bitrate = align_bitrate(tuning.bitrate_bps);
        handle.set_control(sys::V4L2_CID_MPEG_VIDEO_BITRATE, bitrate as i32)?;
        handle.set_output_fps(tuning.fps)?;

        device.start(EncoderRole)?;
        Ok(Self {
            device,
            applied_bitrate: AtomicU32::new(bitrate),
            applied_fps: AtomicU32::new(tuning.fps),
        })
    }

    /// Submit one raw frame. `on_packet` runs on the encoder's worker
    /// thread with the coded frame, in submission order.
    pub fn encode(
        &self,
        frame: BufferSource<'_>,
        timestamp_us: u64,
        on_packet: CompletionFn,
    ) -> Result<(), M2mError> {
        self.device.emplace_buffer(frame, timestamp_us, on_packet)
    }

    /// Change the target bitrate while streaming. The value is clamped and
    /// quantized; a request that lands on the already-applied value is a
    /// no-op. On rejection the previous bitrate stays in effect.
    pub fn set_bitrate(&self, requested_bps: u32) -> Result<(), M2mError> {
        let aligned = align_bitrate(requested_bps);
        if aligned == self.applied_bitrate.load(Ordering::Acquire) {
            return Ok(());
        }
        self.device
            .handle()
            .set_control(sys::V4L2_CID_MPEG_VIDEO_BITRATE, aligned as i32)?;
        self.applied_bitrate.store(aligned, Ordering::Release);
        debug!(bitrate = aligned, "encoder bitrate updated");
        Ok(())
    }

    /// Bitrate currently programmed into the driver.
    pub fn bitrate(&self) -> u32 {
        self.applied_bitrate.load(Ordering::Acquire)
    }

    /// Update the nominal frame rate used by the rate controller. A request
    /// matching the applied rate is a no-op.
    pub fn set_fps(&self, fps: u32) -> Result<(), M2mError> {
        if fps == self.applied_fps.load(Ordering::Acquire) {
            return Ok(());
        }
        self.device.handle().set_output_fps(fps)?;
        self.applied_fps.store(fps, Ordering::Release);
        Ok(())
    }

    /// Make the next encoded frame an IDR keyframe.
    pub fn force_keyframe(&self) -> Result<(), M2mError> {
        self.device
            .handle()
            .set_control(sys::V4L2_CID_MPEG_VIDEO_FORCE_KEY_FRAME, 1)
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
    fn bitrate_is_clamped_to_the_floor() {
        assert_eq!(align_bitrate(500_000), 1_000_000);
        assert_eq!(align_bitrate(0), 1_000_000);
        assert_eq!(align_bitrate(1_000_000), 1_000_000);
    }

    #[test]
    fn bitrate_quantizes_down() {
        assert_eq!(align_bitrate(10_013_000), 10_000_000);
        assert_eq!(align_bitrate(10_025_000), 10_025_000);
        assert_eq!(align_bitrate(1_024_999), 1_000_000);
    }
}
