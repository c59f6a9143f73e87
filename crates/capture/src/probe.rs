//! Camera discovery: which nodes are cameras, and what formats they offer.

use std::path::{Path, PathBuf};

use argus_core::prelude::{FOURCC_MJPG, FOURCC_YUV420, FourCc};
use v4l::capability::Flags;
use v4l::video::Capture as _;
use v4l::{Device, format::FourCC};

use crate::CaptureError;

/// One capture-capable `/dev/video*` node.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub path: PathBuf,
    pub card: String,
    pub driver: String,
    pub bus_info: String,
}

/// Enumerate capture-capable video nodes. M2M codec nodes and other
/// non-capture devices are skipped; nodes that fail to answer QUERYCAP are
/// skipped rather than aborting the scan.
pub fn list_cameras() -> Vec<CameraInfo> {
    let mut cameras = Vec::new();
    for node in v4l::context::enum_devices() {
        let Ok(dev) = Device::with_path(node.path()) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !(caps.capabilities.contains(Flags::VIDEO_CAPTURE)
            || caps.capabilities.contains(Flags::VIDEO_CAPTURE_MPLANE))
        {
            continue;
        }
        cameras.push(CameraInfo {
            path: node.path().to_path_buf(),
            card: caps.card,
            driver: caps.driver,
            bus_info: caps.bus,
        });
    }
    cameras
}

/// Formats the pipeline can consume directly or via the hardware decoder,
/// in preference order. MJPEG first: USB cameras deliver full frame rates
/// only on their compressed formats, and the decoder makes them free.
const PREFERRED: [FourCc; 3] = [FOURCC_MJPG, FOURCC_YUV420, FourCc::new(*b"YUYV")];

/// List the pixel formats a camera offers.
pub fn probe_formats(path: &Path) -> Result<Vec<FourCc>, CaptureError> {
    let dev = Device::with_path(path).map_err(|e| CaptureError::Backend(e.to_string()))?;
    let descriptions = dev
        .enum_formats()
        .map_err(|e| CaptureError::Backend(e.to_string()))?;
    Ok(descriptions
        .iter()
        .map(|d| FourCc::new(d.fourcc.repr))
        .collect())
}

/// Pick the most useful format from an offered set.
pub fn preferred_format(offered: &[FourCc]) -> Option<FourCc> {
    PREFERRED.iter().copied().find(|p| offered.contains(p))
}

pub(crate) fn to_v4l_fourcc(code: FourCc) -> FourCC {
    FourCC::new(&code.bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_wins_when_offered() {
        let offered = [FourCc::new(*b"YUYV"), FOURCC_MJPG];
        assert_eq!(preferred_format(&offered), Some(FOURCC_MJPG));
    }

    #[test]
    fn raw_fallback_without_mjpeg() {
        let offered = [FourCc::new(*b"YUYV")];
        assert_eq!(preferred_format(&offered), Some(FourCc::new(*b"YUYV")));
        assert_eq!(preferred_format(&[]), None);
    }
}
