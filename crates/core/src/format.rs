use std::{fmt, num::NonZeroU32, str::FromStr};

/// Four-character code describing a pixel or bitstream format.
///
/// The little-endian `u32` encoding is exactly the V4L2 fourcc value, so
/// these round-trip through the kernel boundary unmodified.
///
/// # Example
/// ```rust
/// use argus_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"YU12");
/// assert_eq!(fcc.to_string(), "YU12");
/// assert_eq!(FourCc::from(fcc.to_u32()), fcc);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding (the V4L2 pixelformat value).
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// The raw bytes.
    pub const fn bytes(self) -> [u8; 4] {
        self.0
    }

    /// Try to render as a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Whether this fourcc names a compressed bitstream rather than raw
    /// pixels. Compressed camera formats require a chained decoder before
    /// frames are consumable as planar YUV.
    pub fn is_compressed(self) -> bool {
        matches!(&self.0, b"H264" | b"H265" | b"HEVC" | b"MJPG" | b"JPEG")
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("fourcc must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(FourCc(arr))
    }
}

/// Planar YUV 4:2:0 (V4L2 `YU12`), the normalized raw format of the pipeline.
pub const FOURCC_YUV420: FourCc = FourCc::new(*b"YU12");
/// H.264 bitstream.
pub const FOURCC_H264: FourCc = FourCc::new(*b"H264");
/// Motion-JPEG, the common compressed camera format.
pub const FOURCC_MJPG: FourCc = FourCc::new(*b"MJPG");

/// Resolution of a frame.
///
/// # Example
/// ```rust
/// use argus_core::prelude::Resolution;
///
/// let res = Resolution::new(640, 480).unwrap();
/// assert_eq!(res.width.get(), 640);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    /// Width in pixels (non-zero).
    pub width: NonZeroU32,
    /// Height in pixels (non-zero).
    pub height: NonZeroU32,
}

impl Resolution {
    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    /// Byte size of one planar YUV 4:2:0 image at this resolution.
    pub fn yuv420_size(&self) -> usize {
        let w = self.width.get() as usize;
        let h = self.height.get() as usize;
        w * h + 2 * (w.div_ceil(2) * h.div_ceil(2))
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Frame interval expressed as a rational (seconds per frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Interval {
    /// Numerator of the interval rational.
    pub numerator: NonZeroU32,
    /// Denominator of the interval rational.
    pub denominator: NonZeroU32,
}

impl Interval {
    /// Interval for a whole-number frame rate (`1/fps`).
    pub fn from_fps(fps: u32) -> Option<Self> {
        Some(Self {
            numerator: NonZeroU32::new(1)?,
            denominator: NonZeroU32::new(fps)?,
        })
    }

    /// Frames per second implied by this interval.
    pub fn fps(&self) -> f64 {
        self.denominator.get() as f64 / self.numerator.get() as f64
    }
}

/// Pixel format plus geometry; the negotiated shape of one buffer queue.
///
/// # Example
/// ```rust
/// use argus_core::prelude::{FOURCC_YUV420, MediaFormat, Resolution};
///
/// let fmt = MediaFormat::new(FOURCC_YUV420, Resolution::new(640, 480).unwrap());
/// assert!(!fmt.code.is_compressed());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFormat {
    /// Pixel/bitstream format code.
    pub code: FourCc,
    /// Frame geometry.
    pub resolution: Resolution,
}

impl MediaFormat {
    /// Create a media format.
    pub fn new(code: FourCc, resolution: Resolution) -> Self {
        Self { code, resolution }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.code, self.resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_through_u32() {
        for code in ["YU12", "H264", "MJPG", "NV12"] {
            let fcc: FourCc = code.parse().unwrap();
            assert_eq!(FourCc::from(fcc.to_u32()), fcc);
            assert_eq!(fcc.to_string(), code);
        }
    }

    #[test]
    fn compressed_detection() {
        assert!(FOURCC_MJPG.is_compressed());
        assert!(FOURCC_H264.is_compressed());
        assert!(!FOURCC_YUV420.is_compressed());
    }

    #[test]
    fn yuv420_size_rounds_odd_dimensions_up() {
        let even = Resolution::new(640, 480).unwrap();
        assert_eq!(even.yuv420_size(), 640 * 480 * 3 / 2);
        let odd = Resolution::new(3, 3).unwrap();
        // 9 luma + 2 * (2 * 2) chroma
        assert_eq!(odd.yuv420_size(), 9 + 8);
    }

    #[test]
    fn interval_fps() {
        let iv = Interval::from_fps(30).unwrap();
        assert_eq!(iv.fps(), 30.0);
    }
}
