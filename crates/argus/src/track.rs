//! Encoded video track.
//!
//! Consumes raw frames, resizes them when the capture geometry differs
//! from the target, encodes to H.264, and fans the coded frames out to
//! every subscriber. The hardware path chains scaler output into the
//! encoder by DMA-BUF handle, so a frame is copied at most once (out of
//! the camera). When the codec devices are unavailable a caller-supplied
//! software encoder keeps the track alive.

use std::{io, sync::Arc};

use argus_core::prelude::{FrameBuffer, Resolution};
use argus_m2m::{
    DeviceNodes, M2mError,
    prelude::{
        BufferSource, CompletedBuffer, CompletionFn, Encoder, EncoderTuning, MemoryKind, Scaler,
    },
};
use parking_lot::Mutex;
use tracing::{info, warn};

/// One coded frame, borrowed from the encoder's result slot. Subscribers
/// copy out if they keep it past the callback.
pub struct EncodedFrame<'a> {
    pub data: &'a [u8],
    pub timestamp_us: u64,
    pub keyframe: bool,
}

/// Subscriber callback. Runs on the encoder's worker thread; keep it cheap.
pub type OnEncoded = Box<dyn FnMut(&EncodedFrame<'_>) + Send>;

/// Fallback encoder used when the hardware path is unavailable. The
/// implementation (x264, openh264, ...) lives outside this crate.
pub trait SoftwareEncoder: Send {
    /// Encode one raw frame, returning the bitstream and whether it is a
    /// keyframe.
    fn encode_frame(&mut self, frame: &FrameBuffer) -> io::Result<(Vec<u8>, bool)>;
}

type Subscribers = Arc<Mutex<Vec<OnEncoded>>>;

fn dispatch_to(subscribers: &Subscribers) -> CompletionFn {
    let subscribers = Arc::clone(subscribers);
    Box::new(move |done: CompletedBuffer<'_>| {
        let frame = EncodedFrame {
            data: done.data,
            timestamp_us: done.timestamp_us,
            keyframe: done.keyframe,
        };
        for on_encoded in subscribers.lock().iter_mut() {
            on_encoded(&frame);
        }
    })
}

enum Backend {
    Hardware {
        scaler: Option<Scaler>,
        // Shared with in-flight scaler callbacks; dropped last on stop.
        encoder: Option<Arc<Encoder>>,
    },
    Software(Mutex<Box<dyn SoftwareEncoder>>),
}

/// Raw-frames-in, coded-frames-out stage with subscriber fan-out.
pub struct EncodedTrack {
    backend: Backend,
    subscribers: Subscribers,
}

impl EncodedTrack {
    /// Bring up the hardware path: a scaler when `capture` and `target`
    /// geometry differ, and the encoder, DMA-chained.
    pub fn hardware(
        nodes: &DeviceNodes,
        capture: Resolution,
        target: Resolution,
        tuning: EncoderTuning,
    ) -> Result<Self, M2mError> {
        let scaler = if capture != target {
            Some(Scaler::open(
                &nodes.scaler,
                capture,
                target,
                MemoryKind::Mmap,
            )?)
        } else {
            None
        };
        let input = if scaler.is_some() {
            MemoryKind::Dmabuf
        } else {
            MemoryKind::Mmap
        };
        let encoder = Encoder::open(&nodes.encoder, target, tuning, input)?;
        info!(%capture, %target, scaled = scaler.is_some(), "hardware track up");
        Ok(Self {
            backend: Backend::Hardware {
                scaler,
                encoder: Some(Arc::new(encoder)),
            },
            subscribers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Track backed by a software encoder only.
    pub fn software(encoder: Box<dyn SoftwareEncoder>) -> Self {
        Self {
            backend: Backend::Software(Mutex::new(encoder)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Try the hardware path; fall back to software when the devices are
    /// missing and a fallback was supplied.
    pub fn with_fallback(
        nodes: &DeviceNodes,
        capture: Resolution,
        target: Resolution,
        tuning: EncoderTuning,
        fallback: Option<Box<dyn SoftwareEncoder>>,
    ) -> Result<Self, M2mError> {
        match Self::hardware(nodes, capture, target, tuning) {
            Ok(track) => Ok(track),
            Err(err) => match fallback {
                Some(encoder) => {
                    warn!(%err, "hardware encode unavailable, using software fallback");
                    Ok(Self::software(encoder))
                }
                None => Err(err),
            },
        }
    }

    /// Register a subscriber for every coded frame from now on.
    pub fn subscribe(&self, on_encoded: OnEncoded) {
        self.subscribers.lock().push(on_encoded);
    }

    /// Feed one raw frame through the track.
    pub fn push_frame(&self, frame: &FrameBuffer) -> Result<(), M2mError> {
        let timestamp_us = frame.meta().timestamp_us;
        match &self.backend {
            Backend::Hardware { scaler, encoder } => {
                let Some(encoder) = encoder else {
                    return Err(M2mError::NotStreaming);
                };
                let Some(plane) = frame.planes().first() else {
                    return Ok(());
                };
                match scaler {
                    Some(scaler) => {
                        let encoder = Arc::clone(encoder);
                        let subscribers = Arc::clone(&self.subscribers);
                        scaler.scale(
                            BufferSource::Bytes(plane.data()),
                            timestamp_us,
                            Box::new(move |scaled: CompletedBuffer<'_>| {
                                // Hand the scaled frame onward without a copy
                                // when the slot is exported.
                                let source = match scaled.dma {
                                    Some(handle) => BufferSource::Dma {
                                        handle,
                                        bytesused: scaled.data.len() as u32,
                                    },
                                    None => BufferSource::Bytes(scaled.data),
                                };
                                if let Err(err) = encoder.encode(
                                    source,
                                    scaled.timestamp_us,
                                    dispatch_to(&subscribers),
                                ) {
                                    warn!(%err, "encode submission failed");
                                }
                            }),
                        )
                    }
                    None => encoder.encode(
                        BufferSource::Bytes(plane.data()),
                        timestamp_us,
                        dispatch_to(&self.subscribers),
                    ),
                }
            }
            Backend::Software(encoder) => {
                let (data, keyframe) = encoder.lock().encode_frame(frame)?;
                let coded = EncodedFrame {
                    data: &data,
                    timestamp_us,
                    keyframe,
                };
                for on_encoded in self.subscribers.lock().iter_mut() {
                    on_encoded(&coded);
                }
                Ok(())
            }
        }
    }

    /// Adjust the encoder bitrate. No-op on the software path.
    pub fn set_bitrate(&self, bitrate_bps: u32) -> Result<(), M2mError> {
        if let Backend::Hardware {
            encoder: Some(encoder),
            ..
        } = &self.backend
        {
            encoder.set_bitrate(bitrate_bps)?;
        }
        Ok(())
    }

    /// Force the next coded frame to be a keyframe. No-op on the software
    /// path (software encoders decide per `encode_frame`).
    pub fn force_keyframe(&self) -> Result<(), M2mError> {
        if let Backend::Hardware {
            encoder: Some(encoder),
            ..
        } = &self.backend
        {
            encoder.force_keyframe()?;
        }
        Ok(())
    }

    /// Stop the hardware stages. The scaler goes first so no callback can
    /// submit into a stopping encoder. Idempotent.
    pub fn stop(&mut self) {
        if let Backend::Hardware { scaler, encoder } = &mut self.backend {
            if let Some(mut scaler) = scaler.take() {
                scaler.stop();
            }
            // Last holder; the device stops on drop.
            encoder.take();
        }
    }
}

impl Drop for EncodedTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::prelude::{FOURCC_YUV420, FrameMeta, MediaFormat};
    use std::sync::mpsc;

    /// Test double: "encodes" by tagging the bytes, keyframe every 10th.
    struct StubEncoder {
        frames: u32,
    }

    impl SoftwareEncoder for StubEncoder {
        fn encode_frame(&mut self, frame: &FrameBuffer) -> io::Result<(Vec<u8>, bool)> {
            let keyframe = self.frames % 10 == 0;
            self.frames += 1;
            Ok((frame.planes()[0].data().to_vec(), keyframe))
        }
    }

    fn frame(timestamp_us: u64) -> FrameBuffer {
        let fmt = MediaFormat::new(FOURCC_YUV420, Resolution::new(640, 480).unwrap());
        FrameBuffer::from_vec(
            FrameMeta::new(fmt, timestamp_us),
            vec![(timestamp_us % 251) as u8; 32],
            640,
        )
    }

    #[test]
    fn thirty_frames_complete_in_order_with_keyframes() {
        let track = EncodedTrack::software(Box::new(StubEncoder { frames: 0 }));
        let (tx, rx) = mpsc::channel();
        track.subscribe(Box::new(move |coded| {
            tx.send((coded.timestamp_us, coded.keyframe)).ok();
        }));

        for n in 0..30u64 {
            track.push_frame(&frame(1_000 + n * 33_333)).unwrap();
        }

        let seen: Vec<(u64, bool)> = rx.try_iter().collect();
        assert_eq!(seen.len(), 30);
        let timestamps: Vec<u64> = seen.iter().map(|(ts, _)| *ts).collect();
        let mut sorted = timestamps.clone();
        sorted.sort_unstable();
        assert_eq!(timestamps, sorted);
        assert_eq!(timestamps[0], 1_000);
        assert!(seen.iter().filter(|(_, key)| *key).count() >= 1);
    }

    #[test]
    fn every_subscriber_sees_every_frame() {
        let track = EncodedTrack::software(Box::new(StubEncoder { frames: 0 }));
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        track.subscribe(Box::new(move |coded| {
            tx_a.send(coded.data.to_vec()).ok();
        }));
        track.subscribe(Box::new(move |coded| {
            tx_b.send(coded.data.to_vec()).ok();
        }));

        track.push_frame(&frame(7)).unwrap();
        assert_eq!(rx_a.try_iter().count(), 1);
        assert_eq!(rx_b.try_iter().count(), 1);
    }

    #[test]
    fn control_calls_are_noops_on_the_software_path() {
        let mut track = EncodedTrack::software(Box::new(StubEncoder { frames: 0 }));
        track.set_bitrate(500_000).unwrap();
        track.force_keyframe().unwrap();
        track.stop();
        track.stop();
    }
}
