use std::io;
use std::path::PathBuf;

use drm::control::{crtc, plane};

use crate::backend::allocator::Fourcc;

/// Errors thrown by the [`KmsDevice`](super::KmsDevice)
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device node could not be opened
    #[error("Failed to open drm node `{path:?}`")]
    Open {
        /// Node that failed to open
        path: PathBuf,
        /// Underlying io error
        #[source]
        source: io::Error,
    },
    /// The drm nodes of the seat could not be listed
    #[error("Failed to enumerate drm nodes")]
    Enumerate(#[source] io::Error),
    /// No drm node was found, or none matched the requested driver
    #[error("No usable drm device found{}", driver.as_ref().map(|d| format!(" for driver `{}`", d)).unwrap_or_default())]
    NoDevice {
        /// Driver that was asked for
        driver: Option<String>,
    },
    /// Another hardware context of this process still holds a device open
    #[error("A drm device is already opened by this process")]
    AlreadyOpen,
    /// The device does not drive any connected display
    #[error("No connected connector with a usable mode found")]
    NoConnector,
    /// No crtc can drive the selected connector
    #[error("No crtc found for the connected connector")]
    NoCrtc,
    /// The given plane does not belong to this device
    #[error("Plane `{0:?}` is not managed by this device")]
    UnknownPlane(u32),
    /// The plane cannot scan out the requested format
    #[error("Plane `{plane:?}` does not support format {format}")]
    UnsupportedFormat {
        /// Plane that was asked for
        plane: plane::Handle,
        /// Requested format
        format: Fourcc,
    },
    /// The `DrmDevice` encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The crtc has not been set up yet, only the primary plane can do that
    #[error("Crtc `{0:?}` is not active yet, commit the primary plane first")]
    CrtcInactive(crtc::Handle),
}

/// Error returned when an ioctl on the device node fails
#[derive(thiserror::Error, Debug)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}
