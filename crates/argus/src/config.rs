//! Pipeline configuration.

use std::{num::NonZeroU32, path::PathBuf};

use argus_capture::CaptureConfig;
use argus_core::prelude::{Interval, Resolution};
use argus_m2m::{DeviceNodes, prelude::EncoderTuning};

/// Everything needed to bring the pipeline up.
///
/// # Example
/// ```rust
/// use argus::config::PipelineConfig;
///
/// let cfg = PipelineConfig::default();
/// assert_eq!(cfg.resolution.width.get(), 640);
/// assert_eq!(cfg.fps, 30);
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineConfig {
    /// Camera device node.
    pub camera: PathBuf,
    /// Target (encoded) resolution. The capture side may run larger and be
    /// scaled down in hardware.
    pub resolution: Resolution,
    /// Target frame rate.
    pub fps: u32,
    /// Whether the hardware codec path is enabled. With it off the track
    /// requires a software encoder.
    pub hardware: bool,
    /// Encoder target bitrate in bits per second.
    pub bitrate_bps: u32,
    /// Frames between forced keyframes.
    pub keyframe_interval: u32,
    /// Codec triad device nodes.
    pub nodes: DeviceNodes,
    /// Depth of the recorder's packet queue.
    pub record_queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera: PathBuf::from("/dev/video0"),
            resolution: Resolution {
                width: NonZeroU32::new(640).unwrap_or(NonZeroU32::MIN),
                height: NonZeroU32::new(480).unwrap_or(NonZeroU32::MIN),
            },
            fps: 30,
            hardware: true,
            bitrate_bps: 5_000_000,
            keyframe_interval: 600,
            nodes: DeviceNodes::default(),
            record_queue_depth: 8,
        }
    }
}

impl PipelineConfig {
    /// Capture-side configuration derived from this pipeline config.
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device: self.camera.clone(),
            resolution: self.resolution,
            interval: Interval::from_fps(self.fps),
            decoder_device: self.nodes.decoder.clone(),
            queue_depth: 4,
        }
    }

    /// Encoder tuning derived from this pipeline config.
    pub fn encoder_tuning(&self) -> EncoderTuning {
        EncoderTuning {
            bitrate_bps: self.bitrate_bps,
            fps: self.fps,
            keyframe_interval: self.keyframe_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_classic_webcam_profile() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.camera, PathBuf::from("/dev/video0"));
        assert_eq!(cfg.resolution.height.get(), 480);
        assert!(cfg.hardware);
        assert_eq!(cfg.record_queue_depth, 8);
        assert_eq!(cfg.nodes.encoder, PathBuf::from("/dev/video11"));
    }

    #[test]
    fn derived_configs_carry_the_same_geometry() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.capture_config().resolution, cfg.resolution);
        assert_eq!(cfg.encoder_tuning().keyframe_interval, 600);
    }
}
