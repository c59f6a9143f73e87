//! Keyframe-aligned video recording.
//!
//! The recorder sits behind a small bounded queue so a slow disk or muxer
//! never stalls the encoder callback; overflow drops the newest packet and
//! counts it. Recording starts at the first keyframe, which also becomes
//! the zero point for presentation timestamps, so the written stream always
//! begins decodable and at pts 0.

use std::{io, sync::Arc};

use argus_core::prelude::{BoundedTx, RecvOutcome, SendOutcome, StageMetrics, Worker, bounded};
use tracing::{debug, warn};

use crate::track::{EncodedFrame, OnEncoded};

/// Video stream index inside the recorded container.
pub const VIDEO_STREAM: u32 = 0;

/// One packet handed to the sink, pts rebased to the recording start.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub data: Vec<u8>,
    pub pts_us: u64,
    pub keyframe: bool,
    pub stream: u32,
}

/// Destination for recorded packets (muxer, file writer, ...). Called from
/// the recorder's worker thread.
pub trait PacketSink: Send {
    fn write_packet(&mut self, packet: &MediaPacket) -> io::Result<()>;
}

#[derive(Clone)]
struct QueuedFrame {
    data: Vec<u8>,
    timestamp_us: u64,
    keyframe: bool,
}

/// Keyframe gate and timestamp rebase. Frames before the first keyframe
/// are refused; the first keyframe's timestamp becomes pts 0.
#[derive(Default)]
struct PacketGate {
    base_us: Option<u64>,
}

impl PacketGate {
    fn admit(&mut self, timestamp_us: u64, keyframe: bool) -> Option<u64> {
        match self.base_us {
            Some(base) => Some(timestamp_us.saturating_sub(base)),
            None if keyframe => {
                self.base_us = Some(timestamp_us);
                Some(0)
            }
            None => None,
        }
    }
}

/// Recording stage: bounded handoff queue plus a drain worker writing to
/// the sink.
pub struct VideoRecorder {
    tx: BoundedTx<QueuedFrame>,
    worker: Worker,
    metrics: Arc<StageMetrics>,
}

impl VideoRecorder {
    /// Start recording into `sink`.
    pub fn start(mut sink: Box<dyn PacketSink>, queue_depth: usize) -> io::Result<Self> {
        let (tx, rx) = bounded::<QueuedFrame>(queue_depth);
        let metrics = Arc::new(StageMetrics::default());
        let worker_metrics = Arc::clone(&metrics);
        let mut gate = PacketGate::default();
        let mut worker = Worker::new("recorder", move || {
            let frame = match rx.recv() {
                RecvOutcome::Data(frame) => frame,
                _ => return false,
            };
            let Some(pts_us) = gate.admit(frame.timestamp_us, frame.keyframe) else {
                // Still waiting for the opening keyframe.
                return true;
            };
            let packet = MediaPacket {
                data: frame.data,
                pts_us,
                keyframe: frame.keyframe,
                stream: VIDEO_STREAM,
            };
            if let Err(err) = sink.write_packet(&packet) {
                worker_metrics.error();
                warn!(%err, "packet sink write failed");
            } else {
                worker_metrics.completed();
            }
            true
        });
        worker.run()?;
        Ok(Self {
            tx,
            worker,
            metrics,
        })
    }

    /// Queue one coded frame. Never blocks; returns whether it was
    /// accepted (a full queue drops the frame and counts it).
    pub fn push(&self, data: &[u8], timestamp_us: u64, keyframe: bool) -> bool {
        self.metrics.submitted();
        let frame = QueuedFrame {
            data: data.to_vec(),
            timestamp_us,
            keyframe,
        };
        match self.tx.send(frame) {
            SendOutcome::Ok => true,
            _ => {
                self.metrics.dropped();
                false
            }
        }
    }

    /// Subscriber callback for wiring this recorder into an
    /// [`EncodedTrack`](crate::track::EncodedTrack).
    pub fn subscriber(&self) -> OnEncoded {
        let tx = self.tx.clone();
        let metrics = Arc::clone(&self.metrics);
        Box::new(move |coded: &EncodedFrame<'_>| {
            metrics.submitted();
            let frame = QueuedFrame {
                data: coded.data.to_vec(),
                timestamp_us: coded.timestamp_us,
                keyframe: coded.keyframe,
            };
            if !matches!(tx.send(frame), SendOutcome::Ok) {
                metrics.dropped();
            }
        })
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Stop accepting frames and join the drain worker. Queued frames that
    /// have not been written yet are discarded. Idempotent.
    pub fn stop(&mut self) {
        self.tx.close();
        self.worker.stop();
        debug!("recorder stopped");
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct MemorySink {
        packets: Arc<Mutex<Vec<MediaPacket>>>,
    }

    impl PacketSink for MemorySink {
        fn write_packet(&mut self, packet: &MediaPacket) -> io::Result<()> {
            self.packets.lock().push(packet.clone());
            Ok(())
        }
    }

    fn wait_for(sink: &MemorySink, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.packets.lock().len() < count {
            assert!(Instant::now() < deadline, "timed out waiting for packets");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn gate_waits_for_a_keyframe_then_rebases() {
        let mut gate = PacketGate::default();
        assert_eq!(gate.admit(5_000, false), None);
        assert_eq!(gate.admit(6_000, false), None);
        assert_eq!(gate.admit(7_000, true), Some(0));
        assert_eq!(gate.admit(8_500, false), Some(1_500));
        assert_eq!(gate.admit(9_000, true), Some(2_000));
    }

    #[test]
    fn recording_starts_at_the_first_keyframe() {
        let sink = MemorySink::default();
        let mut recorder = VideoRecorder::start(Box::new(sink.clone()), 8).unwrap();

        recorder.push(b"delta", 10_000, false);
        recorder.push(b"key", 11_000, true);
        recorder.push(b"delta", 12_000, false);
        wait_for(&sink, 2);
        recorder.stop();

        let packets = sink.packets.lock();
        assert_eq!(packets.len(), 2);
        assert!(packets[0].keyframe);
        assert_eq!(packets[0].pts_us, 0);
        assert_eq!(packets[1].pts_us, 1_000);
        assert_eq!(packets[0].stream, VIDEO_STREAM);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        // Build the queue by hand so no drain worker races the pushes.
        let (tx, rx) = bounded::<QueuedFrame>(8);
        for n in 0..8u64 {
            let outcome = tx.send(QueuedFrame {
                data: vec![0],
                timestamp_us: n,
                keyframe: false,
            });
            assert_eq!(outcome, SendOutcome::Ok);
        }
        let ninth = tx.send(QueuedFrame {
            data: vec![0],
            timestamp_us: 8,
            keyframe: false,
        });
        assert_eq!(ninth, SendOutcome::Full);
        assert_eq!(rx.len(), 8);
    }

    #[test]
    fn stop_is_idempotent() {
        let sink = MemorySink::default();
        let mut recorder = VideoRecorder::start(Box::new(sink), 8).unwrap();
        recorder.stop();
        recorder.stop();
    }
}
