use std::fs::OpenOptions;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use drm::{control::Device as ControlDevice, Device as BasicDevice};
use tracing::{debug, error, info, warn};

use super::error::Error;
use crate::utils::DevPath;

static DEVICE_OPEN: AtomicBool = AtomicBool::new(false);

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    privileged: bool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.fd.dev_path());
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
        DEVICE_OPEN.store(false, Ordering::SeqCst);
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
///
/// Only one `DrmDeviceFd` may be alive per process; clones share the same node.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

impl DrmDeviceFd {
    /// Open the drm node at `path`.
    ///
    /// This function will try to acquire the master lock for the device and release
    /// the lock on drop again.
    pub fn open(path: &Path) -> Result<DrmDeviceFd, Error> {
        if DEVICE_OPEN.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyOpen);
        }

        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(source) => {
                DEVICE_OPEN.store(false, Ordering::SeqCst);
                return Err(Error::Open {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let mut dev = InternalDrmDeviceFd {
            fd: OwnedFd::from(file),
            privileged: false,
        };

        // We want to modeset, so we better be the master, if we run via a tty session.
        // This is only needed on older kernels. Newer kernels grant this permission,
        // if no other process is already the *master*. So we skip over this error.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        Ok(DrmDeviceFd(Arc::new(dev)))
    }

    /// Returns if this process holds the master lock of the device
    pub fn is_privileged(&self) -> bool {
        self.0.privileged
    }

    /// Name of the kernel driver behind this node
    pub fn driver_name(&self) -> Option<String> {
        self.get_driver()
            .ok()
            .map(|driver| driver.name().to_string_lossy().into_owned())
    }
}

/// Open the first of `nodes` driven by `driver`, or the first node that opens at all if no
/// driver is given.
pub fn open_by_driver<I>(nodes: I, driver: Option<&str>) -> Result<(PathBuf, DrmDeviceFd), Error>
where
    I: IntoIterator<Item = PathBuf>,
{
    for path in nodes {
        let fd = match DrmDeviceFd::open(&path) {
            Ok(fd) => fd,
            Err(Error::AlreadyOpen) => return Err(Error::AlreadyOpen),
            Err(err) => {
                debug!(?path, ?err, "skipping drm node");
                continue;
            }
        };

        match (driver, fd.driver_name()) {
            (None, _) => return Ok((path, fd)),
            (Some(wanted), Some(name)) if name == wanted => return Ok((path, fd)),
            (_, name) => debug!(?path, driver = ?name, "drm node driven by a different driver"),
        }
    }

    Err(Error::NoDevice {
        driver: driver.map(str::to_owned),
    })
}

/// Serializes tests touching the process wide device guard
#[cfg(test)]
pub(crate) static DEVICE_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> std::sync::MutexGuard<'static, ()> {
        DEVICE_GUARD.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[test]
    fn missing_node_clears_guard() {
        let _guard = guard();
        let missing = Path::new("/nonexistent/dri/card0");
        match DrmDeviceFd::open(missing) {
            Err(Error::Open { path, source }) => {
                assert_eq!(path, missing);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let fd = DrmDeviceFd::open(Path::new("/dev/null")).unwrap();
        assert!(!fd.is_privileged());
    }

    #[test]
    fn one_device_per_process() {
        let _guard = guard();
        let first = DrmDeviceFd::open(Path::new("/dev/null")).unwrap();
        assert!(matches!(
            DrmDeviceFd::open(Path::new("/dev/null")),
            Err(Error::AlreadyOpen)
        ));

        let clone = first.clone();
        drop(first);
        assert!(matches!(
            DrmDeviceFd::open(Path::new("/dev/null")),
            Err(Error::AlreadyOpen)
        ));

        drop(clone);
        let reopened = DrmDeviceFd::open(Path::new("/dev/null")).unwrap();
        assert_eq!(reopened.driver_name(), None);
    }

    #[test]
    fn driver_filter_skips_nodes() {
        let _guard = guard();
        let nodes = vec![PathBuf::from("/nonexistent/dri/card0"), PathBuf::from("/dev/null")];

        assert!(matches!(
            open_by_driver(nodes.clone(), Some("i915")),
            Err(Error::NoDevice { driver: Some(ref name) }) if name == "i915"
        ));
        // the rejected node was closed again
        let (path, fd) = open_by_driver(nodes, None).unwrap();
        assert_eq!(path, Path::new("/dev/null"));

        assert!(matches!(
            open_by_driver(vec![PathBuf::from("/dev/null")], None),
            Err(Error::AlreadyOpen)
        ));
        drop(fd);
        assert!(matches!(
            open_by_driver(Vec::new(), None),
            Err(Error::NoDevice { driver: None })
        ));
    }
}
