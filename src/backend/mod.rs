//! Backend (display controller) abstraction
//!
//! Collection of the traits the compositing core uses to reach the hardware, and the
//! implementations of those traits.
//!
//! Supported display backends:
//!
//! - [`drm`]: KMS planes on a DRM device node, with dumb buffers (feature `backend_drm`)
//! - [`dummy`]: an in-process fake display controller for tests (feature `backend_dummy`)
//!
//! [`udev`] finds the drm nodes of a seat (feature `backend_udev`).
//!
//! The core only talks to the hardware through two seams:
//!
//! - [`DisplayDevice`] describes the planes of a display controller and creates, maps and
//!   commits the buffers backing them.
//! - [`PresentBackend`] is the narrow capability the flip worker holds: "scan out buffer
//!   `n` of this plane". Every [`Plane`](crate::plane::Plane) hands one out to its flip jobs.

pub mod allocator;
#[cfg(feature = "backend_drm")]
pub mod drm;
#[cfg(any(test, feature = "backend_dummy"))]
pub mod dummy;
#[cfg(feature = "backend_udev")]
pub mod udev;

use std::fmt;

use crate::utils::{Buffer as BufferCoords, Physical, Point, Size};
use allocator::{Fourcc, MappedBuffer};

/// Possible types of a hardware plane
///
/// The discriminants match the values of the kernel's `type` plane property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Additional planes composited on top of the primary plane
    Overlay = 0,
    /// The plane every crtc scans out its main framebuffer from
    Primary = 1,
    /// Small plane dedicated to the pointer image
    Cursor = 2,
}

impl PlaneType {
    /// Map the raw value of the kernel's `type` plane property
    pub fn from_raw(value: u64) -> Option<PlaneType> {
        match value {
            0 => Some(PlaneType::Overlay),
            1 => Some(PlaneType::Primary),
            2 => Some(PlaneType::Cursor),
            _ => None,
        }
    }
}

impl fmt::Display for PlaneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlaneType::Overlay => "overlay",
            PlaneType::Primary => "primary",
            PlaneType::Cursor => "cursor",
        })
    }
}

/// Static description of a hardware plane as reported by the display controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Device specific identifier of the plane (the kms object id for drm devices)
    pub id: u32,
    /// Type of the plane
    pub kind: PlaneType,
    /// Position of the plane among all planes of the same type
    pub index: usize,
    /// Pixel formats the plane can scan out
    pub formats: Vec<Fourcc>,
}

impl PlaneInfo {
    /// Returns true if the plane can scan out buffers of the given format
    pub fn supports(&self, format: Fourcc) -> bool {
        self.formats.contains(&format)
    }
}

/// Geometry of a plane on the screen
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneConfig {
    /// Location of the top-left corner of the plane on the crtc
    pub position: Point<i32, Physical>,
    /// Factor the buffer is scaled by when scanned out
    pub scale: f32,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        PlaneConfig {
            position: Point::default(),
            scale: 1.0,
        }
    }
}

impl PlaneConfig {
    /// Area covered on the crtc by a buffer of the given size
    pub fn destination(&self, buffer: Size<i32, BufferCoords>) -> (Point<i32, Physical>, Size<i32, Physical>) {
        (self.position, buffer.to_physical_scaled(self.scale as f64))
    }
}

/// A display controller exposing hardware planes.
///
/// Implementations have to be usable from several threads at once: the caller thread
/// allocates and commits geometry while flip workers present buffers.
pub trait DisplayDevice: fmt::Debug + Send + Sync + 'static {
    /// Buffer type backing the planes of this device
    type Buffer: MappedBuffer + fmt::Debug + Send + Sync + 'static;
    /// Error type returned by hardware operations
    type Error: std::error::Error + Send + Sync + 'static;

    /// All planes usable by this device
    fn planes(&self) -> &[PlaneInfo];

    /// Resolution of the screen driven by this device
    fn screen_size(&self) -> Size<i32, Physical>;

    /// Create an unmapped buffer suitable for scan-out on `plane`.
    fn create_buffer(
        &self,
        plane: &PlaneInfo,
        size: Size<i32, BufferCoords>,
        format: Fourcc,
    ) -> Result<Self::Buffer, Self::Error>;

    /// Map a buffer into the address space of this process.
    fn map_buffer(&self, buffer: &mut Self::Buffer) -> Result<(), Self::Error>;

    /// Show `buffer` on `plane` with the given geometry.
    ///
    /// May block until the display controller picked up the new state.
    fn commit(&self, plane: &PlaneInfo, buffer: &Self::Buffer, config: &PlaneConfig) -> Result<(), Self::Error>;

    /// Stop scanning out anything on `plane`.
    fn disable(&self, plane: &PlaneInfo) -> Result<(), Self::Error>;

    /// Number of planes of the given type
    fn count_planes(&self, kind: PlaneType) -> usize {
        self.planes().iter().filter(|p| p.kind == kind).count()
    }
}

/// Capability to present one of a fixed set of buffers.
///
/// This is all a flip worker ever gets to see of a plane.
pub trait PresentBackend: Send + Sync + 'static {
    /// Error returned if the presentation failed
    type Error: std::error::Error + Send + Sync + 'static;

    /// Number of buffers that can be presented
    fn buffer_count(&self) -> usize;

    /// Scan out buffer `buffer` with the geometry applied at the time of the call.
    fn present(&self, buffer: usize) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::{PlaneConfig, PlaneType};
    use crate::utils::{Physical, Point, Size};

    #[test]
    fn plane_type_raw_values() {
        assert_eq!(PlaneType::from_raw(0), Some(PlaneType::Overlay));
        assert_eq!(PlaneType::from_raw(1), Some(PlaneType::Primary));
        assert_eq!(PlaneType::from_raw(2), Some(PlaneType::Cursor));
        assert_eq!(PlaneType::from_raw(3), None);
        assert_eq!(PlaneType::Primary as u64, 1);
    }

    #[test]
    fn destination_follows_scale() {
        let config = PlaneConfig {
            position: (10, 20).into(),
            scale: 2.0,
        };
        let (loc, size) = config.destination((100, 50).into());
        assert_eq!(loc, Point::<i32, Physical>::from((10, 20)));
        assert_eq!(size, Size::<i32, Physical>::from((200, 100)));
    }
}
