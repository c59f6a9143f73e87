//! Driver-owned buffer pools for one side of an M2M device.
//!
//! A [`BufferGroup`] wraps the slots a driver allocated for one queue:
//! mmap'd planes the process can read and write, or exported DMA-BUF file
//! descriptors that travel between devices without a copy.

use std::{io, marker::PhantomData, os::fd::RawFd, ptr::NonNull, slice};

use argus_core::prelude::{FourCc, Resolution};

use crate::sys;

/// Which queue of the M2M pair a group serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The queue frames are submitted on (device input).
    Output,
    /// The queue results are collected from (device result).
    Capture,
}

impl Direction {
    pub(crate) fn buf_type(self) -> u32 {
        match self {
            Direction::Output => sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            Direction::Capture => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        }
    }
}

/// How a group's slots are backed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    /// Driver-allocated, mapped into the process.
    Mmap,
    /// Driver-allocated, additionally exported as DMA-BUF fds.
    MmapExported,
    /// Foreign DMA-BUF fds queued by descriptor; nothing is mapped.
    Dmabuf,
}

impl MemoryKind {
    pub(crate) fn memory(self) -> u32 {
        match self {
            MemoryKind::Mmap | MemoryKind::MmapExported => sys::V4L2_MEMORY_MMAP,
            MemoryKind::Dmabuf => sys::V4L2_MEMORY_DMABUF,
        }
    }
}

/// Negotiated single-plane format of one queue.
#[derive(Clone, Copy, Debug)]
pub struct GroupFormat {
    pub fourcc: FourCc,
    pub resolution: Resolution,
    pub sizeimage: u32,
    pub bytesperline: u32,
}

/// One mmap'd plane. Unmapped on drop.
struct MappedPlane {
    ptr: NonNull<u8>,
    length: usize,
}

// The mapping is plain shared memory; the pointer is only dereferenced
// through &self/&mut self.
unsafe impl Send for MappedPlane {}
unsafe impl Sync for MappedPlane {}

impl MappedPlane {
    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.length) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.length) }
    }
}

impl Drop for MappedPlane {
    fn drop(&mut self) {
        unsafe { sys::munmap_plane(self.ptr.as_ptr(), self.length) };
    }
}

/// An owned DMA-BUF file descriptor exported from a driver buffer.
/// Closed on drop.
pub struct DmaBuf {
    fd: RawFd,
}

impl DmaBuf {
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Borrow the descriptor for the duration of a downstream submission.
    pub fn handle(&self) -> DmaHandle<'_> {
        DmaHandle {
            fd: self.fd,
            _owner: PhantomData,
        }
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A borrowed DMA-BUF descriptor. The lifetime ties it to the slot it came
/// from, so it cannot outlive the completion callback that received it.
#[derive(Clone, Copy)]
pub struct DmaHandle<'a> {
    fd: RawFd,
    _owner: PhantomData<&'a DmaBuf>,
}

impl DmaHandle<'_> {
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Payload handed to a completion callback. Borrows the capture slot; the
/// device requeues the slot once the callback returns, so anything kept
/// past the callback must be copied out.
pub struct CompletedBuffer<'a> {
    pub data: &'a [u8],
    pub timestamp_us: u64,
    pub keyframe: bool,
    pub dma: Option<DmaHandle<'a>>,
    pub format: GroupFormat,
}

/// What to feed into an output slot on submission.
pub enum BufferSource<'a> {
    /// Copy these bytes into the slot's mapping.
    Bytes(&'a [u8]),
    /// Queue a foreign DMA-BUF by descriptor; no copy.
    Dma { handle: DmaHandle<'a>, bytesused: u32 },
}

struct Slot {
    mapping: Option<MappedPlane>,
    export: Option<DmaBuf>,
}

/// All slots the driver allocated for one queue, plus the negotiated format.
pub struct BufferGroup {
    direction: Direction,
    kind: MemoryKind,
    format: GroupFormat,
    slots: Vec<Slot>,
}

impl BufferGroup {
    pub(crate) fn new(direction: Direction, kind: MemoryKind, format: GroupFormat) -> Self {
        Self {
            direction,
            kind,
            format,
            slots: Vec::new(),
        }
    }

    pub(crate) fn push_mapped(&mut self, ptr: *mut u8, length: u32) -> io::Result<()> {
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "mmap returned NULL"))?;
        self.slots.push(Slot {
            mapping: Some(MappedPlane {
                ptr,
                length: length as usize,
            }),
            export: None,
        });
        Ok(())
    }

    pub(crate) fn push_unmapped(&mut self) {
        self.slots.push(Slot {
            mapping: None,
            export: None,
        });
    }

    pub(crate) fn attach_export(&mut self, index: usize, fd: RawFd) {
        self.slots[index].export = Some(DmaBuf { fd });
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn format(&self) -> GroupFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    // Indices come back from the driver; an out-of-range one must not
    // take the worker down, so these tolerate it and return None.
    pub(crate) fn plane_bytes(&self, index: usize) -> Option<&[u8]> {
        self.slots
            .get(index)?
            .mapping
            .as_ref()
            .map(MappedPlane::as_slice)
    }

    pub(crate) fn plane_bytes_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.slots
            .get_mut(index)?
            .mapping
            .as_mut()
            .map(MappedPlane::as_mut_slice)
    }

    pub(crate) fn export_handle(&self, index: usize) -> Option<DmaHandle<'_>> {
        self.slots.get(index)?.export.as_ref().map(DmaBuf::handle)
    }

    /// Drop all slots (unmapping and closing exports). The caller must have
    /// stopped streaming and is expected to follow with REQBUFS(0).
    pub(crate) fn release(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> BufferGroup {
        BufferGroup::new(
            Direction::Capture,
            MemoryKind::Mmap,
            GroupFormat {
                fourcc: FourCc::new(*b"YU12"),
                resolution: Resolution::new(2, 2).unwrap(),
                sizeimage: 6,
                bytesperline: 2,
            },
        )
    }

    #[test]
    fn out_of_range_slot_lookups_yield_none() {
        let mut group = group();
        assert!(group.plane_bytes(0).is_none());
        assert!(group.plane_bytes_mut(3).is_none());
        assert!(group.export_handle(99).is_none());
        group.push_unmapped();
        assert!(group.plane_bytes(0).is_none());
        assert!(group.plane_bytes(1).is_none());
    }
}
