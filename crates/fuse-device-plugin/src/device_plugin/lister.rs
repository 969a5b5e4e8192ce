//! Resource discovery.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use super::pool::DevicePool;
use super::FUSE_NAME;
use super::FUSE_PATH;
use super::NAMESPACE;

/// Discovers resources on the host and creates a device pool for each one.
pub trait ResourceLister: Send + Sync {
    /// namespace qualifying the discovered resource names cluster-wide
    fn resource_namespace(&self) -> &str;

    /// names of the resources currently present on the host
    fn discover(&self) -> BTreeSet<String>;

    /// fresh, empty pool for a discovered resource
    fn new_plugin(&self, name: &str) -> DevicePool;
}

/// Lists the FUSE device when its device node exists.
#[derive(Debug, Clone)]
pub struct FuseLister {
    device_path: PathBuf,
}

impl Default for FuseLister {
    fn default() -> Self {
        Self::new(FUSE_PATH)
    }
}

impl FuseLister {
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }
}

impl ResourceLister for FuseLister {
    fn resource_namespace(&self) -> &str {
        NAMESPACE
    }

    fn discover(&self) -> BTreeSet<String> {
        let mut resources = BTreeSet::new();

        match fs::metadata(&self.device_path) {
            Ok(_) => {
                debug!("Discovered {}", self.device_path.display());
                resources.insert(FUSE_NAME.to_string());
            }
            Err(e) => {
                debug!("{} not available: {e}", self.device_path.display());
            }
        }

        resources
    }

    fn new_plugin(&self, name: &str) -> DevicePool {
        debug!("Creating device plugin {name}");
        DevicePool::new(name, self.device_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test_log::test]
    fn discovers_fuse_when_device_exists() {
        let device = tempfile::NamedTempFile::new().expect("temp device");
        let lister = FuseLister::new(device.path());

        let expected = BTreeSet::from([FUSE_NAME.to_string()]);
        assert_eq!(lister.discover(), expected);
        // probing has no side effects
        assert_eq!(lister.discover(), expected);
    }

    #[test_log::test]
    fn discovers_nothing_when_device_is_missing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let lister = FuseLister::new(dir.path().join("fuse"));

        assert!(lister.discover().is_empty());
        assert!(lister.discover().is_empty());
    }

    #[test]
    fn namespace_is_constant() {
        assert_eq!(FuseLister::default().resource_namespace(), "devices.kubevirt.io");
        assert_eq!(FuseLister::default().device_path(), Path::new("/dev/fuse"));
    }

    #[test]
    fn new_plugin_starts_empty() {
        let lister = FuseLister::new("/dev/fuse");
        let pool = lister.new_plugin(FUSE_NAME);

        assert_eq!(pool.resource(), "fuse");
        assert_eq!(pool.device_path(), Path::new("/dev/fuse"));
        assert!(pool.units().is_empty());
    }
}
