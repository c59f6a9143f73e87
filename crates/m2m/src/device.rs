//! Generic stateful memory-to-memory codec device.
//!
//! A [`CodecDevice`] drives one `/dev/videoN` M2M node: callers submit
//! frames with [`CodecDevice::emplace_buffer`] and a background worker
//! collects results, invoking one completion callback per submission in
//! strict FIFO order. Codec-specific behaviour (event reactions, control
//! programming) lives in a [`CodecRole`] implementation.

use std::{
    mem,
    num::NonZeroU32,
    os::fd::RawFd,
    panic::{self, AssertUnwindSafe},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use argus_core::prelude::{FifoQueue, FourCc, Resolution, StageMetrics, Worker};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::{
    buffer::{BufferGroup, BufferSource, CompletedBuffer, Direction, GroupFormat, MemoryKind},
    sys, M2mError,
};

/// Completion callback for one submitted buffer. The payload borrows the
/// capture slot, which is requeued to the driver as soon as the callback
/// returns.
pub type CompletionFn = Box<dyn for<'a> FnOnce(CompletedBuffer<'a>) + Send>;

/// How long the submit path and the worker sleep when there is nothing
/// to do. Matches the silicon's per-frame latency scale.
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(1);

/// Requested configuration for one queue of the M2M pair.
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    pub fourcc: FourCc,
    pub resolution: Resolution,
    /// Requested payload capacity; the driver may round it up. Zero lets
    /// the driver pick (required for compressed capture formats).
    pub sizeimage: u32,
    /// Slots to request. The driver may grant more.
    pub count: u32,
    pub kind: MemoryKind,
}

/// Raw fd wrapper with typed ioctl helpers. Shared between the submitter
/// and the dequeue worker; every call is a single ioctl, which the kernel
/// serialises per queue.
pub struct DeviceHandle {
    fd: RawFd,
}

/// One dequeued buffer, direction-agnostic.
pub(crate) struct Dequeued {
    pub index: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub timestamp_us: u64,
}

impl DeviceHandle {
    fn open(path: &Path) -> Result<Self, M2mError> {
        let fd = sys::open_device(path).map_err(|err| M2mError::DeviceUnavailable {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Ok(Self { fd })
    }

    fn verify_m2m(&self, path: &Path) -> Result<(), M2mError> {
        let mut cap: sys::v4l2_capability = unsafe { mem::zeroed() };
        sys::xioctl(self.fd, sys::VIDIOC_QUERYCAP, &mut cap).map_err(|err| {
            M2mError::DeviceUnavailable {
                path: path.to_path_buf(),
                reason: err.to_string(),
            }
        })?;
        let caps = if cap.device_caps != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        let wanted = sys::V4L2_CAP_VIDEO_M2M_MPLANE | sys::V4L2_CAP_STREAMING;
        if caps & wanted != wanted {
            return Err(M2mError::DeviceUnavailable {
                path: path.to_path_buf(),
                reason: format!("not a streaming M2M device (caps {caps:#010x})"),
            });
        }
        Ok(())
    }

    /// Negotiate one queue's format and return what the driver settled on.
    pub(crate) fn set_format(
        &self,
        direction: Direction,
        fourcc: FourCc,
        resolution: Resolution,
        sizeimage: u32,
    ) -> Result<GroupFormat, M2mError> {
        let mut pix: sys::v4l2_pix_format_mplane = unsafe { mem::zeroed() };
        pix.width = resolution.width.get();
        pix.height = resolution.height.get();
        pix.pixelformat = fourcc.to_u32();
        pix.field = sys::V4L2_FIELD_NONE;
        pix.num_planes = 1;
        pix.plane_fmt[0].sizeimage = sizeimage;
        let mut fmt: sys::v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = direction.buf_type();
        fmt.fmt.pix_mp = pix;
        sys::xioctl(self.fd, sys::VIDIOC_S_FMT, &mut fmt)?;
        Ok(Self::format_from(&fmt))
    }

    /// Read back one queue's current format.
    pub(crate) fn get_format(&self, direction: Direction) -> Result<GroupFormat, M2mError> {
        let mut fmt: sys::v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = direction.buf_type();
        sys::xioctl(self.fd, sys::VIDIOC_G_FMT, &mut fmt)?;
        Ok(Self::format_from(&fmt))
    }

    fn format_from(fmt: &sys::v4l2_format) -> GroupFormat {
        let pix = unsafe { fmt.fmt.pix_mp };
        let width = pix.width;
        let height = pix.height;
        let plane = pix.plane_fmt[0];
        GroupFormat {
            fourcc: FourCc::from(pix.pixelformat),
            resolution: Resolution {
                width: NonZeroU32::new(width).unwrap_or(NonZeroU32::MIN),
                height: NonZeroU32::new(height).unwrap_or(NonZeroU32::MIN),
            },
            sizeimage: plane.sizeimage,
            bytesperline: plane.bytesperline,
        }
    }

    pub(crate) fn request_buffers(
        &self,
        direction: Direction,
        kind: MemoryKind,
        count: u32,
    ) -> Result<u32, M2mError> {
        let mut req: sys::v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = direction.buf_type();
        req.memory = kind.memory();
        sys::xioctl(self.fd, sys::VIDIOC_REQBUFS, &mut req).map_err(|err| {
            M2mError::BufferAllocationFailed {
                queue: match direction {
                    Direction::Output => "output",
                    Direction::Capture => "capture",
                },
                source: err,
            }
        })?;
        Ok(req.count)
    }

    /// Allocate, map, and (optionally) export the slots for one queue.
    pub(crate) fn alloc_group(
        &self,
        direction: Direction,
        kind: MemoryKind,
        count: u32,
    ) -> Result<BufferGroup, M2mError> {
        let format = self.get_format(direction)?;
        let granted = self.request_buffers(direction, kind, count)?;
        let mut group = BufferGroup::new(direction, kind, format);
        for index in 0..granted {
            let mut buf: sys::v4l2_buffer = unsafe { mem::zeroed() };
            let mut plane: sys::v4l2_plane = unsafe { mem::zeroed() };
            buf.index = index;
            buf.type_ = direction.buf_type();
            buf.memory = kind.memory();
            buf.length = 1;
            buf.m.planes = &mut plane;
            sys::xioctl(self.fd, sys::VIDIOC_QUERYBUF, &mut buf).map_err(|err| {
                M2mError::BufferAllocationFailed {
                    queue: "querybuf",
                    source: err,
                }
            })?;
            let length = plane.length;
            match kind {
                MemoryKind::Mmap | MemoryKind::MmapExported => {
                    let offset = unsafe { plane.m.mem_offset };
                    let ptr = sys::mmap_plane(self.fd, length as usize, offset).map_err(|err| {
                        M2mError::BufferAllocationFailed {
                            queue: "mmap",
                            source: err,
                        }
                    })?;
                    group.push_mapped(ptr, length)?;
                }
                MemoryKind::Dmabuf => group.push_unmapped(),
            }
            if kind == MemoryKind::MmapExported {
                let fd = self.export_buffer(direction, index)?;
                group.attach_export(index as usize, fd);
            }
        }
        debug!(
            ?direction,
            count = group.len(),
            sizeimage = format.sizeimage,
            "allocated buffer group"
        );
        Ok(group)
    }

    fn export_buffer(&self, direction: Direction, index: u32) -> Result<RawFd, M2mError> {
        let mut exp: sys::v4l2_exportbuffer = unsafe { mem::zeroed() };
        exp.type_ = direction.buf_type();
        exp.index = index;
        exp.flags = libc::O_CLOEXEC as u32;
        sys::xioctl(self.fd, sys::VIDIOC_EXPBUF, &mut exp).map_err(|err| {
            M2mError::BufferAllocationFailed {
                queue: "expbuf",
                source: err,
            }
        })?;
        Ok(exp.fd)
    }

    /// Queue an output slot carrying `bytesused` payload bytes.
    pub(crate) fn queue_output(
        &self,
        index: u32,
        bytesused: u32,
        timestamp_us: u64,
        kind: MemoryKind,
        dma_fd: Option<RawFd>,
    ) -> Result<(), M2mError> {
        let mut buf: sys::v4l2_buffer = unsafe { mem::zeroed() };
        let mut plane: sys::v4l2_plane = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = Direction::Output.buf_type();
        buf.memory = kind.memory();
        buf.field = sys::V4L2_FIELD_NONE;
        buf.timestamp = sys::timestamp_from_us(timestamp_us);
        buf.length = 1;
        plane.bytesused = bytesused;
        if let Some(fd) = dma_fd {
            plane.m.fd = fd;
            plane.length = bytesused;
        }
        buf.m.planes = &mut plane;
        sys::xioctl(self.fd, sys::VIDIOC_QBUF, &mut buf)?;
        Ok(())
    }

    /// Return a capture slot to the driver.
    pub(crate) fn queue_capture(&self, index: u32, kind: MemoryKind) -> Result<(), M2mError> {
        let mut buf: sys::v4l2_buffer = unsafe { mem::zeroed() };
        let mut plane: sys::v4l2_plane = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = Direction::Capture.buf_type();
        buf.memory = kind.memory();
        buf.length = 1;
        buf.m.planes = &mut plane;
        sys::xioctl(self.fd, sys::VIDIOC_QBUF, &mut buf)?;
        Ok(())
    }

    /// Non-blocking dequeue. `None` means nothing is ready.
    pub(crate) fn try_dequeue(
        &self,
        direction: Direction,
        kind: MemoryKind,
    ) -> Result<Option<Dequeued>, M2mError> {
        let mut buf: sys::v4l2_buffer = unsafe { mem::zeroed() };
        let mut plane: sys::v4l2_plane = unsafe { mem::zeroed() };
        buf.type_ = direction.buf_type();
        buf.memory = kind.memory();
        buf.length = 1;
        buf.m.planes = &mut plane;
        match sys::xioctl(self.fd, sys::VIDIOC_DQBUF, &mut buf) {
            Ok(()) => Ok(Some(Dequeued {
                index: buf.index,
                bytesused: plane.bytesused,
                flags: buf.flags,
                timestamp_us: sys::timestamp_to_us(buf.timestamp),
            })),
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn stream_on(&self, direction: Direction) -> Result<(), M2mError> {
        let mut type_ = direction.buf_type() as i32;
        sys::xioctl(self.fd, sys::VIDIOC_STREAMON, &mut type_)?;
        Ok(())
    }

    pub(crate) fn stream_off(&self, direction: Direction) -> Result<(), M2mError> {
        let mut type_ = direction.buf_type() as i32;
        sys::xioctl(self.fd, sys::VIDIOC_STREAMOFF, &mut type_)?;
        Ok(())
    }

    pub(crate) fn subscribe_event(&self, event_type: u32) -> Result<(), M2mError> {
        let mut sub: sys::v4l2_event_subscription = unsafe { mem::zeroed() };
        sub.type_ = event_type;
        sys::xioctl(self.fd, sys::VIDIOC_SUBSCRIBE_EVENT, &mut sub)?;
        Ok(())
    }

    pub(crate) fn dequeue_event(&self) -> Option<sys::v4l2_event> {
        if !sys::event_pending(self.fd) {
            return None;
        }
        let mut event: sys::v4l2_event = unsafe { mem::zeroed() };
        match sys::xioctl(self.fd, sys::VIDIOC_DQEVENT, &mut event) {
            Ok(()) => Some(event),
            Err(_) => None,
        }
    }

    /// Program one codec control, failing loudly with its id.
    pub(crate) fn set_control(&self, id: u32, value: i32) -> Result<(), M2mError> {
        let mut ctrl: sys::v4l2_ext_control = unsafe { mem::zeroed() };
        ctrl.id = id;
        ctrl.u.value = value;
        let mut ctrls: sys::v4l2_ext_controls = unsafe { mem::zeroed() };
        ctrls.count = 1;
        ctrls.controls = &mut ctrl;
        sys::xioctl(self.fd, sys::VIDIOC_S_EXT_CTRLS, &mut ctrls)
            .map_err(|err| M2mError::ControlUpdateFailed { id, source: err })
    }

    /// Tell the driver the output queue's nominal frame rate.
    pub(crate) fn set_output_fps(&self, fps: u32) -> Result<(), M2mError> {
        let mut output: sys::v4l2_outputparm = unsafe { mem::zeroed() };
        output.timeperframe = sys::v4l2_fract {
            numerator: 1,
            denominator: fps.max(1),
        };
        let mut parm: sys::v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = Direction::Output.buf_type();
        parm.parm.output = output;
        sys::xioctl(self.fd, sys::VIDIOC_S_PARM, &mut parm)?;
        Ok(())
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Pairs free output slots with pending completion callbacks. Submissions
/// and completions are both FIFO, so popping one callback per dequeued
/// capture buffer reunites each result with its submitter.
pub(crate) struct SubmissionLedger {
    free: FifoQueue<u32>,
    pending: FifoQueue<CompletionFn>,
}

impl SubmissionLedger {
    pub(crate) fn new() -> Self {
        Self {
            free: FifoQueue::new(),
            pending: FifoQueue::new(),
        }
    }

    pub(crate) fn seed(&self, count: u32) {
        self.free.clear();
        self.pending.clear();
        for index in 0..count {
            self.free.push(index);
        }
    }

    pub(crate) fn acquire_slot(&self) -> Option<u32> {
        self.free.pop()
    }

    pub(crate) fn recycle_slot(&self, index: u32) {
        self.free.push(index);
    }

    /// Register a callback for the submission about to be queued. Must be
    /// called before QBUF so the completion order matches the queue order.
    pub(crate) fn begin(&self, on_complete: CompletionFn) {
        self.pending.push(on_complete);
    }

    /// Take back the most recent registration after a failed QBUF.
    pub(crate) fn abort_last(&self) -> Option<CompletionFn> {
        self.pending.pop_back()
    }

    /// Claim the callback owed to the oldest in-flight submission.
    pub(crate) fn complete(&self) -> Option<CompletionFn> {
        self.pending.pop()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Codec-specific behaviour plugged into the device's dequeue loop.
pub trait CodecRole: Send + 'static {
    /// Short name used in the worker thread name and log lines.
    fn name(&self) -> &'static str;

    /// Device events the role wants delivered. Subscribed before streaming
    /// starts; most nodes reject subscriptions they do not emit, so roles
    /// that never react leave this empty.
    fn events(&self) -> &'static [u32] {
        &[]
    }

    /// React to a dequeued device event. Runs on the worker thread with
    /// streaming active; the default ignores everything.
    fn handle_event(
        &mut self,
        _event: &sys::v4l2_event,
        _device: &DeviceHandle,
        _capture: &mut BufferGroup,
    ) -> Result<(), M2mError> {
        Ok(())
    }
}

/// State owned by the dequeue worker thread.
struct DequeueState<R: CodecRole> {
    handle: Arc<DeviceHandle>,
    ledger: Arc<SubmissionLedger>,
    metrics: Arc<StageMetrics>,
    capture: BufferGroup,
    output_kind: MemoryKind,
    role: R,
}

impl<R: CodecRole> DequeueState<R> {
    /// One scheduling pass. Returns whether any progress was made so the
    /// worker knows when to idle-sleep.
    fn poll(&mut self) -> bool {
        let mut progressed = false;

        // Reclaim consumed output slots so submitters can reuse them.
        loop {
            match self.handle.try_dequeue(Direction::Output, self.output_kind) {
                Ok(Some(done)) => {
                    self.ledger.recycle_slot(done.index);
                    progressed = true;
                }
                Ok(None) => break,
                Err(err) => {
                    self.metrics.error();
                    warn!(role = self.role.name(), %err, "output dequeue failed");
                    break;
                }
            }
        }

        // Deliver completed capture buffers, one callback per result.
        loop {
            match self
                .handle
                .try_dequeue(Direction::Capture, self.capture.kind())
            {
                Ok(Some(done)) => {
                    progressed = true;
                    self.deliver(done);
                }
                Ok(None) => break,
                Err(err) => {
                    self.metrics.error();
                    warn!(role = self.role.name(), %err, "capture dequeue failed");
                    break;
                }
            }
        }

        while let Some(event) = self.handle.dequeue_event() {
            progressed = true;
            if let Err(err) = self
                .role
                .handle_event(&event, &self.handle, &mut self.capture)
            {
                self.metrics.error();
                error!(role = self.role.name(), %err, "event handling failed");
            }
        }

        progressed
    }

    fn deliver(&mut self, done: Dequeued) {
        let index = done.index as usize;
        if done.bytesused == 0 {
            // Drain artifact (EOS marker); no submission is owed for it.
            self.requeue(done.index);
            return;
        }
        let Some(on_complete) = self.ledger.complete() else {
            warn!(
                role = self.role.name(),
                index, "capture buffer with no pending submission"
            );
            self.requeue(done.index);
            return;
        };
        {
            let data = self
                .capture
                .plane_bytes(index)
                .map(|bytes| &bytes[..(done.bytesused as usize).min(bytes.len())])
                .unwrap_or(&[]);
            let completed = CompletedBuffer {
                data,
                timestamp_us: done.timestamp_us,
                keyframe: done.flags & sys::V4L2_BUF_FLAG_KEYFRAME != 0,
                dma: self.capture.export_handle(index),
                format: self.capture.format(),
            };
            // A panicking consumer must not take the pipeline down; the
            // slot still has to go back to the driver.
            if panic::catch_unwind(AssertUnwindSafe(|| on_complete(completed))).is_err() {
                self.metrics.error();
                error!(role = self.role.name(), index, "completion callback panicked");
            } else {
                self.metrics.completed();
            }
        }
        self.requeue(done.index);
    }

    fn requeue(&self, index: u32) {
        if let Err(err) = self.handle.queue_capture(index, self.capture.kind()) {
            warn!(role = self.role.name(), index, %err, "capture requeue failed");
        }
    }
}

/// One stateful M2M codec node with its queue pair and dequeue worker.
pub struct CodecDevice {
    handle: Arc<DeviceHandle>,
    ledger: Arc<SubmissionLedger>,
    metrics: Arc<StageMetrics>,
    output: Mutex<Option<BufferGroup>>,
    // Present only between configure() and start().
    staged_capture: Option<BufferGroup>,
    worker: Option<Worker>,
    output_kind: MemoryKind,
    capture_kind: MemoryKind,
    output_format: Option<GroupFormat>,
    stopped: Arc<AtomicBool>,
}

impl CodecDevice {
    /// Open a device node and verify it is a streaming M2M codec.
    pub fn open(path: &Path) -> Result<Self, M2mError> {
        let handle = DeviceHandle::open(path)?;
        handle.verify_m2m(path)?;
        debug!(path = %path.display(), "opened codec device");
        Ok(Self {
            handle: Arc::new(handle),
            ledger: Arc::new(SubmissionLedger::new()),
            metrics: Arc::new(StageMetrics::default()),
            output: Mutex::new(None),
            staged_capture: None,
            worker: None,
            output_kind: MemoryKind::Mmap,
            capture_kind: MemoryKind::Mmap,
            output_format: None,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Negotiate both queue formats and allocate their buffer groups.
    pub fn configure(
        &mut self,
        output: QueueConfig,
        capture: QueueConfig,
    ) -> Result<(), M2mError> {
        let out_fmt = self.handle.set_format(
            Direction::Output,
            output.fourcc,
            output.resolution,
            output.sizeimage,
        )?;
        self.handle.set_format(
            Direction::Capture,
            capture.fourcc,
            capture.resolution,
            capture.sizeimage,
        )?;
        let out_group = self
            .handle
            .alloc_group(Direction::Output, output.kind, output.count)?;
        let cap_group = self
            .handle
            .alloc_group(Direction::Capture, capture.kind, capture.count)?;
        self.ledger.seed(out_group.len() as u32);
        self.output_kind = output.kind;
        self.capture_kind = capture.kind;
        self.output_format = Some(out_fmt);
        *self.output.lock() = Some(out_group);
        self.staged_capture = Some(cap_group);
        Ok(())
    }

    /// Negotiated output-queue format, after [`configure`](Self::configure).
    pub fn output_format(&self) -> Option<GroupFormat> {
        self.output_format
    }

    /// Subscribe to the role's events, start both queues, pre-queue every
    /// capture slot, and spawn the dequeue worker.
    pub fn start<R: CodecRole>(&mut self, role: R) -> Result<(), M2mError> {
        let capture = self.staged_capture.take().ok_or(M2mError::NotStreaming)?;
        for event in role.events() {
            self.handle.subscribe_event(*event)?;
        }
        for index in 0..capture.len() as u32 {
            self.handle.queue_capture(index, capture.kind())?;
        }
        self.handle.stream_on(Direction::Output)?;
        self.handle.stream_on(Direction::Capture)?;
        self.stopped.store(false, Ordering::Release);

        let mut state = DequeueState {
            handle: Arc::clone(&self.handle),
            ledger: Arc::clone(&self.ledger),
            metrics: Arc::clone(&self.metrics),
            capture,
            output_kind: self.output_kind,
            role,
        };
        let name = format!("m2m-{}", state.role.name());
        let mut worker = Worker::new(name, move || state.poll());
        worker.run()?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Submit one frame. Blocks briefly when every output slot is in
    /// flight; returns once a slot frees up or the device stops. The
    /// callback runs exactly once on the worker thread, in submission
    /// order.
    pub fn emplace_buffer(
        &self,
        source: BufferSource<'_>,
        timestamp_us: u64,
        on_complete: CompletionFn,
    ) -> Result<(), M2mError> {
        if self.worker.is_none() {
            return Err(M2mError::NotStreaming);
        }
        let index = loop {
            if self.stopped.load(Ordering::Acquire) {
                return Err(M2mError::NotStreaming);
            }
            match self.ledger.acquire_slot() {
                Some(index) => break index,
                None => thread::sleep(BACKPRESSURE_SLEEP),
            }
        };

        let mut guard = self.output.lock();
        let Some(group) = guard.as_mut() else {
            self.ledger.recycle_slot(index);
            return Err(M2mError::NotStreaming);
        };

        let (bytesused, dma_fd) = match source {
            BufferSource::Bytes(bytes) => {
                let Some(slot) = group.plane_bytes_mut(index as usize) else {
                    self.ledger.recycle_slot(index);
                    return Err(M2mError::NotStreaming);
                };
                let len = bytes.len().min(slot.len());
                slot[..len].copy_from_slice(&bytes[..len]);
                (len as u32, None)
            }
            BufferSource::Dma { handle, bytesused } => (bytesused, Some(handle.as_raw_fd())),
        };

        // Register before QBUF so the pending order matches queue order.
        self.ledger.begin(on_complete);
        if let Err(err) = self
            .handle
            .queue_output(index, bytesused, timestamp_us, group.kind(), dma_fd)
        {
            self.ledger.abort_last();
            self.ledger.recycle_slot(index);
            self.metrics.error();
            return Err(err);
        }
        self.metrics.submitted();
        Ok(())
    }

    /// Submissions queued but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.ledger.pending_len()
    }

    /// Stop streaming and release every buffer. Idempotent; pending
    /// completion callbacks that have not fired are dropped without being
    /// invoked.
    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let was_streaming = self.worker.is_some();
        if let Some(mut worker) = self.worker.take() {
            // Joining drops the worker's capture group, unmapping its planes.
            worker.stop();
        }
        let _ = self.handle.stream_off(Direction::Output);
        let _ = self.handle.stream_off(Direction::Capture);
        if let Some(mut group) = self.output.lock().take() {
            let kind = group.kind();
            group.release();
            let _ = self.handle.request_buffers(Direction::Output, kind, 0);
        }
        if let Some(mut group) = self.staged_capture.take() {
            let kind = group.kind();
            group.release();
            let _ = self.handle.request_buffers(Direction::Capture, kind, 0);
        } else if was_streaming {
            // The capture group went to the worker at start; its mappings
            // are gone, so hand the driver its buffers back too.
            let _ = self
                .handle
                .request_buffers(Direction::Capture, self.capture_kind, 0);
        }
        debug!("codec device stopped");
    }
}

impl Drop for CodecDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{os::fd::IntoRawFd, sync::mpsc};

    fn callback(tx: mpsc::Sender<u32>, tag: u32) -> CompletionFn {
        Box::new(move |_done| {
            tx.send(tag).ok();
        })
    }

    fn test_format() -> GroupFormat {
        GroupFormat {
            fourcc: FourCc::new(*b"YU12"),
            resolution: Resolution::new(2, 2).unwrap(),
            sizeimage: 6,
            bytesperline: 2,
        }
    }

    fn fire(cb: CompletionFn) {
        let completed = CompletedBuffer {
            data: &[],
            timestamp_us: 0,
            keyframe: false,
            dma: None,
            format: test_format(),
        };
        cb(completed);
    }

    /// Device over an fd that tolerates close but rejects every ioctl, so
    /// the teardown paths can run without a codec node.
    fn inert_device() -> CodecDevice {
        let fd = std::fs::File::open("/dev/null").unwrap().into_raw_fd();
        CodecDevice {
            handle: Arc::new(DeviceHandle { fd }),
            ledger: Arc::new(SubmissionLedger::new()),
            metrics: Arc::new(StageMetrics::default()),
            output: Mutex::new(Some(BufferGroup::new(
                Direction::Output,
                MemoryKind::Mmap,
                test_format(),
            ))),
            staged_capture: Some(BufferGroup::new(
                Direction::Capture,
                MemoryKind::Mmap,
                test_format(),
            )),
            worker: None,
            output_kind: MemoryKind::Mmap,
            capture_kind: MemoryKind::Mmap,
            output_format: None,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    struct NullRole;

    impl CodecRole for NullRole {
        fn name(&self) -> &'static str {
            "null"
        }
    }

    #[test]
    fn ledger_pairs_completions_in_submission_order() {
        let ledger = SubmissionLedger::new();
        ledger.seed(4);
        let (tx, rx) = mpsc::channel();
        for tag in 0..4 {
            let index = ledger.acquire_slot().unwrap();
            assert_eq!(index, tag);
            ledger.begin(callback(tx.clone(), tag));
        }
        assert!(ledger.acquire_slot().is_none());
        for _ in 0..4 {
            fire(ledger.complete().unwrap());
        }
        let order: Vec<u32> = rx.try_iter().collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn ledger_rollback_removes_only_the_failed_submission() {
        let ledger = SubmissionLedger::new();
        ledger.seed(2);
        let (tx, rx) = mpsc::channel();
        ledger.begin(callback(tx.clone(), 1));
        ledger.begin(callback(tx.clone(), 2));
        assert!(ledger.abort_last().is_some());
        assert_eq!(ledger.pending_len(), 1);
        fire(ledger.complete().unwrap());
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(ledger.complete().is_none());
    }

    #[test]
    fn recycled_slots_come_back_in_release_order() {
        let ledger = SubmissionLedger::new();
        ledger.seed(2);
        let a = ledger.acquire_slot().unwrap();
        let b = ledger.acquire_slot().unwrap();
        ledger.recycle_slot(b);
        ledger.recycle_slot(a);
        assert_eq!(ledger.acquire_slot(), Some(b));
        assert_eq!(ledger.acquire_slot(), Some(a));
    }

    #[test]
    fn result_side_reallocation_leaves_submissions_intact() {
        // A source-change rebuilds only the capture group; in-flight
        // submissions keep their slots and their completion order.
        let ledger = SubmissionLedger::new();
        ledger.seed(2);
        let (tx, rx) = mpsc::channel();
        let a = ledger.acquire_slot().unwrap();
        ledger.begin(callback(tx.clone(), 10));
        let b = ledger.acquire_slot().unwrap();
        ledger.begin(callback(tx.clone(), 20));

        // Stand-in for the renegotiated capture group: a fresh group at a
        // new geometry, no interaction with the ledger.
        let fresh = BufferGroup::new(
            Direction::Capture,
            MemoryKind::Mmap,
            GroupFormat {
                fourcc: FourCc::new(*b"YU12"),
                resolution: Resolution::new(1920, 1080).unwrap(),
                sizeimage: 1920 * 1080 * 3 / 2,
                bytesperline: 1920,
            },
        );
        assert!(fresh.is_empty());
        assert_eq!(ledger.pending_len(), 2);

        fire(ledger.complete().unwrap());
        fire(ledger.complete().unwrap());
        let order: Vec<u32> = rx.try_iter().collect();
        assert_eq!(order, vec![10, 20]);
        ledger.recycle_slot(a);
        ledger.recycle_slot(b);
        assert_eq!(ledger.acquire_slot(), Some(a));
    }

    #[test]
    fn panicking_callback_is_contained() {
        let cb: CompletionFn = Box::new(|_done| panic!("consumer bug"));
        let result = panic::catch_unwind(AssertUnwindSafe(|| fire(cb)));
        assert!(result.is_err());
    }

    #[test]
    fn event_subscription_is_opt_in_per_role() {
        assert!(NullRole.events().is_empty());
    }

    #[test]
    fn stop_releases_groups_once_and_is_idempotent() {
        let mut device = inert_device();
        device.stop();
        assert!(device.output.lock().is_none());
        assert!(device.staged_capture.is_none());
        assert!(device.stopped.load(Ordering::Acquire));
        // Second call hits the stopped guard; nothing is left to release
        // and nothing panics.
        device.stop();
        assert!(device.output.lock().is_none());
    }

    #[test]
    fn stop_joins_a_started_worker_and_frees_its_capture_queue() {
        let mut device = inert_device();
        // Started shape: the capture group has moved to the worker.
        device.staged_capture = None;
        let mut worker = Worker::new("m2m-null", || false);
        worker.run().unwrap();
        device.worker = Some(worker);
        device.stop();
        assert!(device.worker.is_none());
        assert!(device.output.lock().is_none());
        device.stop();
    }
}
