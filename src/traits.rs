//! Core traits and types for the producer side of acquisition.
//!
//! A [`SourceLoader`] turns a source path into a [`Producer`], a producer lists
//! [`DeviceInfo`] descriptors and opens them into [`DeviceHandle`]s, and a
//! device handle fills [`FrameBuffer`]s owned by the session's pool.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CaptureError, Result};

/// Pixel format code (e.g., YUYV, MJPG, RGB3). Carried as opaque metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

#[cfg(feature = "v4l2")]
impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

/// Frame geometry reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a packed 2-bytes-per-pixel format.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            fourcc,
            size: width.saturating_mul(2).saturating_mul(height),
        }
    }
}

/// Immutable descriptor of one discoverable device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    /// Producer-unique identifier (device node path, serial, ...).
    pub id: String,
    /// Vendor or driver name.
    pub vendor: String,
    /// Model or card name.
    pub model: String,
    /// Serial number or bus information.
    pub serial_number: String,
    /// Source path of the producer that listed this device.
    pub source: PathBuf,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {}, {})",
            self.id, self.vendor, self.model, self.serial_number
        )
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Session-assigned frame id, strictly increasing per session.
    pub frame_id: u64,
    /// Sequence number reported by the device.
    pub device_sequence: u64,
    /// Capture timestamp reported by the device.
    pub timestamp: Duration,
    /// Bytes of `data` holding the frame.
    pub bytes_used: usize,
    /// Frame geometry, if the device reports one.
    pub format: Option<Format>,
}

/// Payload of one buffer slot.
///
/// Devices overwrite `data` and the device-side metadata fields; the capture
/// loop stamps `frame_id`.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    /// Raw frame bytes.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl FrameBuffer {
    /// Create an empty buffer with `capacity` bytes pre-allocated.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            metadata: FrameMetadata::default(),
        }
    }

    /// Valid frame bytes.
    pub fn bytes(&self) -> &[u8] {
        let used = self.metadata.bytes_used.min(self.data.len());
        self.data.get(..used).unwrap_or_default()
    }

    /// Reset metadata before reuse. Keeps the allocation.
    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.metadata = FrameMetadata::default();
    }
}

/// An open device able to fill frame buffers.
pub trait DeviceHandle: Send {
    /// Fill `buffer` with the next frame.
    ///
    /// Implementations must return within a bounded time. A capture thread
    /// still inside this call after the session's `join_timeout` is detached
    /// and its device is never handed back.
    fn fill_buffer(&mut self, buffer: &mut FrameBuffer) -> std::result::Result<(), CaptureError>;

    /// Release the device. Called once, when the owning session is destroyed.
    ///
    /// A handle lost with a panicked or detached capture thread is only
    /// dropped, so implementations should also release the device on drop.
    fn close(&mut self);
}

/// A loaded producer module exposing devices of one family.
pub trait Producer: Send + Sync {
    /// List the devices reachable right now.
    fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Open a listed device for exclusive acquisition.
    fn open_device(&self, info: &DeviceInfo) -> Result<Box<dyn DeviceHandle>>;
}

/// Resolves a source path into a producer.
pub trait SourceLoader: Send + Sync {
    /// Load the producer located at `path`.
    fn load(&self, path: &Path) -> Result<Arc<dyn Producer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        let format = Format::new(640, 480, FourCC::YUYV);
        assert_eq!(format.size, 640 * 480 * 2);
        assert_eq!(FourCC::MJPG.to_string(), "MJPG");
    }

    #[test]
    fn test_format_size_saturates() {
        let format = Format::new(u32::MAX / 2, 3, FourCC::YUYV);
        assert_eq!(format.size, u32::MAX);
    }

    #[test]
    fn test_frame_buffer_bytes_respects_bytes_used() {
        let mut buffer = FrameBuffer::with_capacity(16);
        buffer.data.extend_from_slice(&[1, 2, 3, 4]);
        buffer.metadata.bytes_used = 2;
        assert_eq!(buffer.bytes(), &[1, 2]);

        buffer.metadata.bytes_used = 10;
        assert_eq!(buffer.bytes(), &[1, 2, 3, 4]);

        buffer.clear();
        assert!(buffer.bytes().is_empty());
        assert!(buffer.data.capacity() >= 16);
    }
}
