//! Source path resolution.
//!
//! `mock://<n>` resolves to an in-process producer with `n` cameras. Any other
//! path is treated as a V4L2 device directory (e.g. `/dev`) when the `v4l2`
//! feature is enabled.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AcquireError, Result};
use crate::mock::MockProducer;
use crate::traits::{Producer, SourceLoader};

/// Scheme prefix of mock sources.
pub const MOCK_SCHEME: &str = "mock://";

/// Loader used by the CLI and the hardware harness.
#[derive(Debug, Clone)]
pub struct DefaultLoader {
    mock_frame_interval: Duration,
}

impl Default for DefaultLoader {
    fn default() -> Self {
        Self {
            mock_frame_interval: Duration::from_millis(33),
        }
    }
}

impl DefaultLoader {
    /// Loader whose mock cameras capture every `interval`.
    pub const fn with_mock_frame_interval(interval: Duration) -> Self {
        Self {
            mock_frame_interval: interval,
        }
    }
}

impl SourceLoader for DefaultLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Producer>> {
        let text = path.to_string_lossy();
        if let Some(count) = text.strip_prefix(MOCK_SCHEME) {
            let count: usize = count.parse().map_err(|_| AcquireError::SourceLoad {
                path: path.to_path_buf(),
                reason: format!("expected {MOCK_SCHEME}<camera count>"),
            })?;
            return Ok(Arc::new(MockProducer::with_cameras(
                path,
                count,
                self.mock_frame_interval,
            )));
        }
        load_device_directory(path)
    }
}

#[cfg(feature = "v4l2")]
fn load_device_directory(path: &Path) -> Result<Arc<dyn Producer>> {
    Ok(Arc::new(crate::device::V4l2Producer::open(path)?))
}

#[cfg(not(feature = "v4l2"))]
fn load_device_directory(path: &Path) -> Result<Arc<dyn Producer>> {
    Err(AcquireError::SourceLoad {
        path: path.to_path_buf(),
        reason: "built without the v4l2 feature".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_uri() {
        let loader = DefaultLoader::with_mock_frame_interval(Duration::ZERO);
        let producer = loader.load(Path::new("mock://3")).expect("load");
        let devices = producer.list_devices().expect("list");
        assert_eq!(devices.len(), 3);
        assert!(devices.iter().all(|d| d.source == Path::new("mock://3")));
    }

    #[test]
    fn test_bad_mock_uri() {
        let loader = DefaultLoader::default();
        assert!(matches!(
            loader.load(Path::new("mock://many")),
            Err(AcquireError::SourceLoad { .. })
        ));
    }

    #[cfg(not(feature = "v4l2"))]
    #[test]
    fn test_device_directory_needs_v4l2() {
        let loader = DefaultLoader::default();
        assert!(matches!(
            loader.load(Path::new("/dev")),
            Err(AcquireError::SourceLoad { .. })
        ));
    }
}
