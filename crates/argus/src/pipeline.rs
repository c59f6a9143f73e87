//! Pipeline assembly: camera in, coded frames and recordings out.

use std::sync::Arc;

use argus_capture::prelude::{CaptureHandle, start_capture};
use argus_core::prelude::{RecvOutcome, Worker};
use tracing::{info, warn};

use crate::{
    PipelineError,
    config::PipelineConfig,
    recorder::{PacketSink, VideoRecorder},
    track::{EncodedTrack, OnEncoded, SoftwareEncoder},
};

/// A running capture → scale → encode pipeline.
///
/// Subscribers attached via [`Pipeline::subscribe`] receive every coded
/// frame; [`Pipeline::record_to`] adds a keyframe-aligned recorder.
pub struct Pipeline {
    capture: CaptureHandle,
    track: Arc<EncodedTrack>,
    pump: Worker,
    recorders: Vec<VideoRecorder>,
}

impl Pipeline {
    /// Bring the whole pipeline up from configuration. `fallback` is used
    /// when the hardware encoder is unavailable (or disabled in config).
    pub fn start(
        config: &PipelineConfig,
        fallback: Option<Box<dyn SoftwareEncoder>>,
    ) -> Result<Self, PipelineError> {
        let capture = start_capture(&config.capture_config())?;
        let capture_res = capture.resolution();

        let track = if config.hardware {
            EncodedTrack::with_fallback(
                &config.nodes,
                capture_res,
                config.resolution,
                config.encoder_tuning(),
                fallback,
            )?
        } else {
            let Some(encoder) = fallback else {
                return Err(PipelineError::NoEncoder);
            };
            EncodedTrack::software(encoder)
        };
        let track = Arc::new(track);

        // Frame pump: moves captured frames into the track at capture
        // cadence. Drops are already accounted for at the capture queue.
        let rx = capture.frames().clone();
        let pump_track = Arc::clone(&track);
        let mut pump = Worker::new("frame-pump", move || match rx.recv() {
            RecvOutcome::Data(frame) => {
                if let Err(err) = pump_track.push_frame(&frame) {
                    warn!(%err, "frame push failed");
                }
                true
            }
            RecvOutcome::Empty | RecvOutcome::Closed => false,
        });
        pump.run().map_err(PipelineError::Io)?;

        info!(camera = %config.camera.display(), target = %config.resolution, "pipeline up");
        Ok(Self {
            capture,
            track,
            pump,
            recorders: Vec::new(),
        })
    }

    /// The capture stage, for snapshots and camera controls.
    pub fn capture(&self) -> &CaptureHandle {
        &self.capture
    }

    /// The encode stage, for bitrate changes and forced keyframes.
    pub fn track(&self) -> &EncodedTrack {
        &self.track
    }

    /// Register a subscriber for every coded frame.
    pub fn subscribe(&self, on_encoded: OnEncoded) {
        self.track.subscribe(on_encoded);
    }

    /// Start recording into `sink`. A keyframe is forced so the recording
    /// begins immediately rather than at the next scheduled one.
    pub fn record_to(&mut self, sink: Box<dyn PacketSink>, queue_depth: usize) -> Result<(), PipelineError> {
        let recorder = VideoRecorder::start(sink, queue_depth).map_err(PipelineError::Io)?;
        self.track.subscribe(recorder.subscriber());
        self.track.force_keyframe()?;
        self.recorders.push(recorder);
        Ok(())
    }

    /// Shut the pipeline down: capture first so nothing new flows in, then
    /// the pump, the codec stages, and the recorders. Idempotent.
    pub fn stop(&mut self) {
        self.capture.stop();
        self.pump.stop();
        // The track's own stop runs when the last Arc drops; recorders
        // flush-close here.
        for recorder in &mut self.recorders {
            recorder.stop();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
