use smallvec::SmallVec;
use std::sync::Arc;

use crate::format::MediaFormat;

/// Metadata carried with every frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    /// Format describing layout and resolution.
    pub format: MediaFormat,
    /// Monotonic timestamp in microseconds.
    pub timestamp_us: u64,
    /// Whether this frame is a self-contained sync point (keyframe).
    pub keyframe: bool,
}

impl FrameMeta {
    /// Create metadata for a raw frame (keyframe flag off).
    pub fn new(format: MediaFormat, timestamp_us: u64) -> Self {
        Self {
            format,
            timestamp_us,
            keyframe: false,
        }
    }

    /// Set the keyframe flag.
    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }
}

/// One plane of image or bitstream data with its row stride.
#[derive(Debug, Clone)]
pub struct Plane {
    data: Vec<u8>,
    stride: usize,
}

impl Plane {
    /// Own the provided bytes as a plane.
    pub fn new(data: Vec<u8>, stride: usize) -> Self {
        Self { data, stride }
    }

    /// The plane bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Stride in bytes (0 for packed bitstream planes).
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Length of the plane in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the plane holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct FrameInner {
    meta: FrameMeta,
    planes: SmallVec<[Plane; 3]>,
}

/// Reference-counted captured frame shared between pipeline consumers.
///
/// Cloning the handle is cheap and shares the underlying planes; the data
/// lives until the last holder drops it. Copying out of transient device
/// memory (a capture slot about to be re-queued) is explicit via
/// [`FrameBuffer::copy_from_slices`].
///
/// # Example
/// ```rust
/// use argus_core::prelude::*;
///
/// let fmt = MediaFormat::new(FOURCC_YUV420, Resolution::new(4, 2).unwrap());
/// let meta = FrameMeta::new(fmt, 100);
/// let frame = FrameBuffer::copy_from_slices(meta, &[(&[0u8; 12], 4)]);
/// let shared = frame.clone();
/// assert_eq!(shared.meta().timestamp_us, 100);
/// assert_eq!(shared.planes()[0].len(), 12);
/// ```
#[derive(Clone)]
pub struct FrameBuffer {
    inner: Arc<FrameInner>,
}

impl FrameBuffer {
    /// Build a frame from owned planes.
    pub fn from_planes(meta: FrameMeta, planes: SmallVec<[Plane; 3]>) -> Self {
        Self {
            inner: Arc::new(FrameInner { meta, planes }),
        }
    }

    /// Build a single-plane frame from an owned byte vector.
    pub fn from_vec(meta: FrameMeta, data: Vec<u8>, stride: usize) -> Self {
        let mut planes = SmallVec::new();
        planes.push(Plane::new(data, stride));
        Self::from_planes(meta, planes)
    }

    /// Deep-copy plane slices into a new frame.
    ///
    /// This is the lifetime boundary between device-owned buffer slots and
    /// the reference-counted frame: the slot may be re-queued immediately
    /// after this returns.
    pub fn copy_from_slices(meta: FrameMeta, planes: &[(&[u8], usize)]) -> Self {
        let planes = planes
            .iter()
            .map(|(data, stride)| Plane::new(data.to_vec(), *stride))
            .collect();
        Self::from_planes(meta, planes)
    }

    /// Metadata describing this frame.
    pub fn meta(&self) -> &FrameMeta {
        &self.inner.meta
    }

    /// The frame planes.
    pub fn planes(&self) -> &[Plane] {
        &self.inner.planes
    }

    /// Total payload size across planes.
    pub fn byte_len(&self) -> usize {
        self.inner.planes.iter().map(Plane::len).sum()
    }

    /// Number of live handles to this frame (for slot-reuse accounting).
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("meta", &self.inner.meta)
            .field("planes", &self.inner.planes.len())
            .field("bytes", &self.byte_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FOURCC_YUV420, MediaFormat, Resolution};

    fn meta() -> FrameMeta {
        FrameMeta::new(
            MediaFormat::new(FOURCC_YUV420, Resolution::new(2, 2).unwrap()),
            42,
        )
    }

    #[test]
    fn copy_is_independent_of_source() {
        let mut src = vec![1u8, 2, 3, 4];
        let frame = FrameBuffer::copy_from_slices(meta(), &[(&src, 2)]);
        src.fill(0);
        assert_eq!(frame.planes()[0].data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn clone_shares_data() {
        let frame = FrameBuffer::from_vec(meta(), vec![9; 6], 2);
        let other = frame.clone();
        assert_eq!(frame.handle_count(), 2);
        assert_eq!(other.planes()[0].data(), frame.planes()[0].data());
    }

    #[test]
    fn keyframe_flag_travels_with_meta() {
        let m = meta().with_keyframe(true);
        let frame = FrameBuffer::from_vec(m, vec![0; 6], 2);
        assert!(frame.meta().keyframe);
    }
}
