use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::component::PortId;

/// Caller-owned buffer handed to the adapter through `use_buffers`.
///
/// Clones share identity and the reference count, so a buffer can be
/// matched back to its port slot by pointer equality.
#[derive(Clone)]
pub struct CameraBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    handle: u64,
    len: usize,
    refs: AtomicU32,
}

impl CameraBuffer {
    pub fn new(handle: u64, len: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                handle,
                len,
                refs: AtomicU32::new(0),
            }),
        }
    }

    /// Allocate `count` buffers of `len` bytes with consecutive handles
    pub fn pool(first_handle: u64, count: usize, len: usize) -> Vec<CameraBuffer> {
        (0..count as u64)
            .map(|i| CameraBuffer::new(first_handle + i, len))
            .collect()
    }

    /// Native handle (opaque to the adapter)
    pub fn handle(&self) -> u64 {
        self.inner.handle
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn same_as(&self, other: &CameraBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Outstanding references held by consumers of this buffer
    pub fn ref_count(&self) -> u32 {
        self.inner.refs.load(Ordering::Acquire)
    }

    pub(crate) fn set_refs(&self, refs: u32) {
        self.inner.refs.store(refs, Ordering::Release);
    }

    /// Drop one reference, returning how many remain
    pub(crate) fn release_ref(&self) -> u32 {
        let prev = self
            .inner
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_sub(1))
            })
            .unwrap_or(0);
        prev.saturating_sub(1)
    }
}

impl std::fmt::Debug for CameraBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraBuffer")
            .field("handle", &self.inner.handle)
            .field("len", &self.inner.len)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Kind of frame delivered upstream, and the kind a caller returns with
/// `fill_this_buffer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Preview,
    Snapshot,
    Video,
    Image,
    Raw,
    FrameData,
    ReprocessInput,
}

impl FrameType {
    /// Port that produces this kind of frame
    pub fn port(self) -> PortId {
        match self {
            FrameType::Preview | FrameType::Snapshot | FrameType::Video => PortId::Preview,
            FrameType::Image => PortId::Image,
            FrameType::Raw => PortId::Video,
            FrameType::FrameData => PortId::Measurement,
            FrameType::ReprocessInput => PortId::ReprocessInput,
        }
    }
}

/// Frame handed to the upstream consumer
#[derive(Clone, Debug)]
pub struct Frame {
    pub buffer: CameraBuffer,
    pub frame_type: FrameType,
    pub meta: Arc<FrameMetadata>,
    /// Time the adapter received the completion
    pub timestamp: Instant,
}

#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub port: PortId,
    pub slot: usize,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub offset: u32,
    pub filled_len: u32,
    pub device_timestamp: Option<Duration>,
}

/// Pixel formats the ports negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Nv12,
    Yuyv,
    Rgb565,
    Raw10,
    Jpeg,
}

impl PixelFormat {
    /// Bytes per pixel on the luma/main plane
    pub fn line_bytes(self, width: u32) -> u32 {
        match self {
            PixelFormat::Nv12 | PixelFormat::Jpeg => width,
            PixelFormat::Yuyv | PixelFormat::Rgb565 => width * 2,
            PixelFormat::Raw10 => width * 5 / 4,
        }
    }

    /// Size of one buffer with the given stride and height
    pub fn buffer_size(self, stride: u32, height: u32) -> usize {
        let base = stride as usize * height as usize;
        match self {
            PixelFormat::Nv12 | PixelFormat::Jpeg => base * 3 / 2,
            _ => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_refs_saturate_at_zero() {
        let buf = CameraBuffer::new(7, 64);
        assert_eq!(buf.release_ref(), 0);
        buf.set_refs(2);
        let clone = buf.clone();
        assert_eq!(clone.release_ref(), 1);
        assert_eq!(buf.ref_count(), 1);
        assert!(buf.same_as(&clone));
        assert!(!buf.same_as(&CameraBuffer::new(7, 64)));
    }

    #[test]
    fn frame_types_map_to_ports() {
        assert_eq!(FrameType::Snapshot.port(), PortId::Preview);
        assert_eq!(FrameType::Raw.port(), PortId::Video);
        assert_eq!(FrameType::FrameData.port(), PortId::Measurement);
    }

    #[test]
    fn nv12_size_includes_chroma() {
        assert_eq!(PixelFormat::Nv12.buffer_size(640, 480), 640 * 480 * 3 / 2);
        assert_eq!(PixelFormat::Yuyv.buffer_size(1280, 480), 1280 * 480);
    }
}
