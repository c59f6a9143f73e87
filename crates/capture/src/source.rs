//! Streaming camera source.
//!
//! Opens a capture device, negotiates the preferred format, and streams
//! frames on a worker thread. Compressed camera formats are chained
//! through the hardware decoder so the handoff queue always carries planar
//! YUV 4:2:0. The handoff is a bounded non-blocking queue: when the
//! consumer stalls, new frames are dropped rather than delaying capture.

use std::{path::PathBuf, sync::Arc, sync::mpsc, thread, time::Duration};

use argus_core::prelude::{
    BoundedRx, ControlId, ControlValue, FrameBuffer, FrameMeta, MediaFormat, NewestRx,
    RecvOutcome, Resolution, SendOutcome, StageMetrics, bounded, newest,
};
use argus_m2m::prelude::{CompletedBuffer, Decoder};
use tracing::{debug, info, warn};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::{buffer::Type, prelude::*, video::Capture as _};

use crate::probe::{preferred_format, probe_formats, to_v4l_fourcc};
use crate::{CaptureConfig, CaptureError};

const STREAM_BUFFERS: u32 = 4;

/// Running capture session. Dropping the handle stops the worker.
pub struct CaptureHandle {
    rx: BoundedRx<FrameBuffer>,
    latest: NewestRx<FrameBuffer>,
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
    device: PathBuf,
    format: MediaFormat,
    fps: Option<f64>,
    metrics: Arc<StageMetrics>,
}

impl CaptureHandle {
    /// The queue frames arrive on.
    pub fn frames(&self) -> &BoundedRx<FrameBuffer> {
        &self.rx
    }

    /// The most recently captured frame, if any. Snapshot consumers use
    /// this instead of draining the queue.
    pub fn frame(&self) -> Option<FrameBuffer> {
        match self.latest.recv() {
            RecvOutcome::Data(frame) => Some(frame),
            _ => None,
        }
    }

    /// The format negotiated with the camera. Consumers always receive
    /// raw frames; a compressed camera format means the decoder is in
    /// the path.
    pub fn format(&self) -> MediaFormat {
        self.format
    }

    pub fn resolution(&self) -> Resolution {
        self.format.resolution
    }

    /// Negotiated frame rate, when the driver reported one.
    pub fn fps(&self) -> Option<f64> {
        self.fps
    }

    /// Apply a camera control. Fire-and-forget: rejection is logged, not
    /// surfaced, since exposure/focus tweaks must not disturb streaming.
    pub fn set_control(&self, id: ControlId, value: ControlValue) {
        let result = Device::with_path(&self.device).and_then(|dev| {
            dev.set_control(v4l::Control {
                id: id.0,
                value: v4l::control::Value::Integer(value.as_i64()),
            })
        });
        if let Err(err) = result {
            warn!(id = id.0, %err, "camera control rejected");
        }
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Stop the worker and close the frame queue. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.rx.close();
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn raw_stride(format: MediaFormat) -> usize {
    let width = format.resolution.width.get() as usize;
    match &format.code.bytes() {
        b"YUYV" => width * 2,
        _ => width,
    }
}

/// Open the camera, negotiate a format, and start streaming.
pub fn start_capture(config: &CaptureConfig) -> Result<CaptureHandle, CaptureError> {
    let offered = probe_formats(&config.device)?;
    let code = preferred_format(&offered).ok_or_else(|| CaptureError::NoUsableFormat {
        path: config.device.clone(),
    })?;

    let dev =
        Device::with_path(&config.device).map_err(|e| CaptureError::Backend(e.to_string()))?;
    let mut fmt = dev
        .format()
        .map_err(|e| CaptureError::Backend(e.to_string()))?;
    fmt.width = config.resolution.width.get();
    fmt.height = config.resolution.height.get();
    fmt.fourcc = to_v4l_fourcc(code);
    let fmt = dev
        .set_format(&fmt)
        .map_err(|e| CaptureError::Backend(e.to_string()))?;

    if let Some(iv) = config.interval {
        let mut params = dev
            .params()
            .map_err(|e| CaptureError::Backend(e.to_string()))?;
        params.interval.numerator = iv.numerator.get();
        params.interval.denominator = iv.denominator.get();
        dev.set_params(&params)
            .map_err(|e| CaptureError::Backend(e.to_string()))?;
    }
    let fps = dev.params().ok().and_then(|p| {
        (p.interval.numerator > 0)
            .then(|| p.interval.denominator as f64 / p.interval.numerator as f64)
    });

    let resolution = Resolution::new(fmt.width, fmt.height).ok_or_else(|| {
        CaptureError::Backend(format!("driver granted zero geometry {}x{}", fmt.width, fmt.height))
    })?;
    let format = MediaFormat::new(code, resolution);
    info!(device = %config.device.display(), %format, "camera negotiated");

    // Compressed cameras get the hardware decoder inline; the queue then
    // carries decoded YUV.
    let decoder = if code.is_compressed() {
        Some(Decoder::open(&config.decoder_device, code, resolution)?)
    } else {
        None
    };

    let mut stream = Stream::with_buffers(&dev, Type::VideoCapture, STREAM_BUFFERS)
        .map_err(|e| CaptureError::Backend(e.to_string()))?;
    // Short poll timeout so the worker observes stop promptly.
    stream.set_timeout(Duration::from_millis(50));

    let (tx, rx) = bounded(config.queue_depth);
    let (latest_tx, latest_rx) = newest();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let metrics = Arc::new(StageMetrics::default());
    let worker_metrics = Arc::clone(&metrics);
    let worker = thread::Builder::new()
        .name("capture".into())
        .spawn(move || {
            let stride = raw_stride(format);
            loop {
                if stop_rx.try_recv().is_ok() {
                    break;
                }
                match stream.next() {
                    Ok((buf, meta)) => {
                        let used = (meta.bytesused as usize).min(buf.len());
                        let ts_us = Duration::from(meta.timestamp).as_micros().min(u64::MAX as u128)
                            as u64;
                        worker_metrics.submitted();
                        match &decoder {
                            Some(decoder) => {
                                let tx = tx.clone();
                                let latest_tx = latest_tx.clone();
                                let metrics = Arc::clone(&worker_metrics);
                                let result = decoder.decode(
                                    &buf[..used],
                                    ts_us,
                                    Box::new(move |done: CompletedBuffer<'_>| {
                                        let fmt = MediaFormat::new(
                                            done.format.fourcc,
                                            done.format.resolution,
                                        );
                                        let meta = FrameMeta::new(fmt, done.timestamp_us)
                                            .with_keyframe(true);
                                        let frame = FrameBuffer::copy_from_slices(
                                            meta,
                                            &[(done.data, done.format.bytesperline as usize)],
                                        );
                                        latest_tx.send(frame.clone());
                                        match tx.send(frame) {
                                            SendOutcome::Ok => metrics.completed(),
                                            _ => metrics.dropped(),
                                        }
                                    }),
                                );
                                if let Err(err) = result {
                                    worker_metrics.error();
                                    warn!(%err, "decode submission failed");
                                    if err.is_fatal() {
                                        break;
                                    }
                                }
                            }
                            None => {
                                let meta = FrameMeta::new(format, ts_us).with_keyframe(true);
                                let frame =
                                    FrameBuffer::from_vec(meta, buf[..used].to_vec(), stride);
                                latest_tx.send(frame.clone());
                                match tx.send(frame) {
                                    SendOutcome::Ok => worker_metrics.completed(),
                                    SendOutcome::Full => worker_metrics.dropped(),
                                    SendOutcome::Closed => break,
                                }
                            }
                        }
                    }
                    Err(err) => {
                        // Timeouts are expected with the short poll timeout.
                        if err.kind() != std::io::ErrorKind::TimedOut {
                            thread::sleep(Duration::from_millis(5));
                        }
                    }
                }
            }
            debug!("capture worker exited");
        })
        .map_err(|e| CaptureError::Backend(e.to_string()))?;

    Ok(CaptureHandle {
        rx,
        latest: latest_rx,
        stop_tx: Some(stop_tx),
        worker: Some(worker),
        device: config.device.clone(),
        format,
        fps,
        metrics,
    })
}
