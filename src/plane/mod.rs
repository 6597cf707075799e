//! Hardware planes and their buffers
//!
//! A [`Plane`] is a hardware plane claimed through the [`PlaneAllocator`], together with
//! the small ring of buffers it scans out from. Exactly one buffer of the ring is on screen,
//! the others can be drawn into.
//!
//! The plane only tracks the buffer index and the staged geometry. Presenting a buffer goes
//! through the [`PresentBackend`] handed out by [`Plane::presenter`], which is what the flip
//! worker of a [`ScreenSurface`](crate::screen::ScreenSurface) holds on to.
//!
//! The applied geometry lives next to the buffers. Every presentation reads it when it reaches
//! the device, and commits on the same plane never overlap, so a flip queued before
//! [`Plane::apply`] still lands with the geometry that was applied.
//!
//! Dropping the last reference to a plane disables the hardware plane, unmaps and destroys its
//! buffers and gives its index back to the allocator.

pub mod allocator;
mod error;

use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace, warn};

pub use self::allocator::PlaneAllocator;
pub use self::error::{AllocationError, PlaneError};

use self::allocator::Lease;
use crate::backend::allocator::{Buffer, Fourcc, MappedBuffer};
use crate::backend::{DisplayDevice, PlaneConfig, PlaneInfo, PlaneType, PresentBackend};
use crate::utils::{Buffer as BufferCoords, Physical, Point, Size};

/// Buffers of a claimed plane, shared with the flip jobs
#[derive(Debug)]
pub(crate) struct Scanout<D: DisplayDevice> {
    buffers: Vec<D::Buffer>,
    lease: Lease,
    info: PlaneInfo,
    // applied geometry, held for the whole device commit
    applied: Mutex<PlaneConfig>,
    span: tracing::Span,
    device: Arc<D>,
}

impl<D: DisplayDevice> Scanout<D> {
    pub(crate) fn new(
        device: Arc<D>,
        info: PlaneInfo,
        buffers: Vec<D::Buffer>,
        lease: Lease,
    ) -> Scanout<D> {
        let span = tracing::info_span!("plane", kind = %info.kind, index = info.index);
        Scanout {
            buffers,
            lease,
            info,
            applied: Mutex::new(PlaneConfig::default()),
            span,
            device,
        }
    }

    fn target(&self, buffer: usize) -> Result<&D::Buffer, PlaneError> {
        self.buffers.get(buffer).ok_or(PlaneError::InvalidBuffer {
            index: buffer,
            count: self.buffers.len(),
        })
    }

    /// Geometry of the last successful [`Scanout::apply`]
    pub(crate) fn applied(&self) -> PlaneConfig {
        *self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Show `buffer` with new geometry, which later presentations keep using
    pub(crate) fn apply(&self, buffer: usize, config: PlaneConfig) -> Result<(), PlaneError> {
        let _guard = self.span.enter();
        let target = self.target(buffer)?;
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(buffer, position = ?config.position, scale = config.scale, "applying geometry");
        self.device
            .commit(&self.info, target, &config)
            .map_err(|err| PlaneError::Device(Box::new(err)))?;
        *applied = config;
        Ok(())
    }
}

impl<D: DisplayDevice> PresentBackend for Scanout<D> {
    type Error = PlaneError;

    fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    #[profiling::function]
    fn present(&self, buffer: usize) -> Result<(), PlaneError> {
        let _guard = self.span.enter();
        let target = self.target(buffer)?;
        let applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        trace!(buffer, "presenting");
        self.device
            .commit(&self.info, target, &applied)
            .map_err(|err| PlaneError::Device(Box::new(err)))
    }
}

impl<D: DisplayDevice> Drop for Scanout<D> {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        if let Err(err) = self.device.disable(&self.info) {
            warn!(?err, "failed to disable plane");
        }
        debug!(index = self.lease.index(), "releasing plane");
    }
}

/// A hardware plane with its ring of buffers
#[derive(Debug)]
pub struct Plane<D: DisplayDevice> {
    scanout: Arc<Scanout<D>>,
    current: usize,
    last_submitted: Option<usize>,
    staged: PlaneConfig,
}

impl<D: DisplayDevice> Plane<D> {
    pub(crate) fn new(scanout: Scanout<D>) -> Plane<D> {
        Plane {
            scanout: Arc::new(scanout),
            current: 0,
            last_submitted: None,
            staged: PlaneConfig::default(),
        }
    }

    /// Hardware description of this plane
    pub fn info(&self) -> &PlaneInfo {
        &self.scanout.info
    }

    /// Index of this plane among the planes of its type
    pub fn plane_index(&self) -> usize {
        self.scanout.info.index
    }

    /// Type of this plane
    pub fn plane_type(&self) -> PlaneType {
        self.scanout.info.kind
    }

    /// Handle to present the buffers of this plane from another thread.
    ///
    /// The plane stays claimed until every handle is dropped.
    pub fn presenter(&self) -> Arc<dyn PresentBackend<Error = PlaneError>> {
        self.scanout.clone()
    }

    /// Number of buffers in the ring
    pub fn buffer_count(&self) -> usize {
        self.scanout.buffers.len()
    }

    /// Index of the buffer to draw into next
    pub fn current(&self) -> usize {
        self.current
    }

    /// Mark the current buffer as submitted and move on to the next one.
    ///
    /// Returns the index of the submitted buffer.
    pub fn advance(&mut self) -> usize {
        let submitted = self.current;
        self.last_submitted = Some(submitted);
        self.current = (submitted + 1) % self.buffer_count();
        submitted
    }

    fn buffer(&self, index: usize) -> Option<&D::Buffer> {
        self.scanout.buffers.get(index)
    }

    /// Pointer to the mapped memory of the current buffer
    pub fn raw(&self) -> *mut u8 {
        self.buffer(self.current)
            .and_then(MappedBuffer::ptr)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Mapped memory of the current buffer
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        match self.buffer(self.current) {
            Some(buffer) => match buffer.ptr() {
                // buffer memory is only ever written by the owner of the plane
                Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), buffer.len()) },
                None => &mut [],
            },
            None => &mut [],
        }
    }

    /// Kernel handle of buffer `index`
    pub fn buffer_handle(&self, index: usize) -> Option<u32> {
        self.buffer(index).map(MappedBuffer::gem_handle)
    }

    /// Size of the buffers
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.buffer(0).map(Buffer::size).unwrap_or_default()
    }

    /// Pixel format of the buffers
    pub fn format(&self) -> Fourcc {
        self.buffer(0).map_or(Fourcc::Xrgb8888, Buffer::format)
    }

    /// Length of a buffer row in bytes
    pub fn pitch(&self) -> u32 {
        self.buffer(0).map_or(0, MappedBuffer::pitch)
    }

    /// Stage a new position, shown on the next [`Plane::apply`]
    pub fn set_position(&mut self, x: i32, y: i32) {
        self.staged.position = (x, y).into();
    }

    /// Stage a new scale factor, shown on the next [`Plane::apply`]
    pub fn set_scale(&mut self, scale: f32) -> Result<(), PlaneError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(PlaneError::InvalidScale(scale));
        }
        self.staged.scale = scale;
        Ok(())
    }

    /// Staged position
    pub fn position(&self) -> Point<i32, Physical> {
        self.staged.position
    }

    /// Staged scale factor
    pub fn scale(&self) -> f32 {
        self.staged.scale
    }

    /// Geometry last committed by [`Plane::apply`]
    pub fn config(&self) -> PlaneConfig {
        self.scanout.applied()
    }

    /// Commit the staged geometry to the display device.
    ///
    /// Shows the last submitted buffer, or the current one if nothing was submitted yet.
    /// Every flip presented afterwards uses the applied geometry, including flips that were
    /// already queued when this was called.
    #[profiling::function]
    pub fn apply(&mut self) -> Result<(), PlaneError> {
        let buffer = self.last_submitted.unwrap_or(self.current);
        self.scanout.apply(buffer, self.staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;

    fn overlay(device: &Arc<DummyDevice>) -> Plane<DummyDevice> {
        PlaneAllocator::new(device.clone())
            .allocate_overlay((100, 50).into(), Fourcc::Argb8888)
            .unwrap()
    }

    #[test]
    fn index_wraps() {
        let device = Arc::new(DummyDevice::new(3));
        let mut plane = overlay(&device);
        assert_eq!(plane.buffer_count(), 3);
        let submitted = (0..5).map(|_| plane.advance()).collect::<Vec<_>>();
        assert_eq!(submitted, vec![0, 1, 2, 0, 1]);
        assert_eq!(plane.current(), 2);
    }

    #[test]
    fn buffer_memory_is_writable() {
        let device = Arc::new(DummyDevice::new(3));
        let mut plane = overlay(&device);
        assert!(!plane.raw().is_null());
        assert_eq!(plane.pitch(), 400);
        let memory = plane.buffer_mut();
        assert_eq!(memory.len(), 400 * 50);
        memory.fill(0xff);
        assert_eq!(unsafe { *plane.raw() }, 0xff);
    }

    #[test]
    fn scale_is_validated() {
        let device = Arc::new(DummyDevice::new(3));
        let mut plane = overlay(&device);
        assert!(matches!(plane.set_scale(0.0), Err(PlaneError::InvalidScale(_))));
        assert!(matches!(plane.set_scale(f32::NAN), Err(PlaneError::InvalidScale(_))));
        assert!(matches!(plane.set_scale(-2.0), Err(PlaneError::InvalidScale(_))));
        plane.set_scale(1.5).unwrap();
        assert_eq!(plane.scale(), 1.5);
        assert_eq!(plane.config().scale, 1.0);
    }

    #[test]
    fn apply_commits_staged_geometry() {
        let device = Arc::new(DummyDevice::new(3));
        let mut plane = overlay(&device);
        plane.set_position(10, 20);
        plane.set_scale(2.0).unwrap();
        assert!(device.commits().is_empty());

        plane.apply().unwrap();
        let commits = device.commits_on(plane.info().id);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].buffer, plane.buffer_handle(0).unwrap());
        assert_eq!(commits[0].config.position, Point::from((10, 20)));
        assert_eq!(commits[0].config.scale, 2.0);
        assert_eq!(plane.config(), commits[0].config);
    }

    #[test]
    fn present_rejects_unknown_buffer() {
        let device = Arc::new(DummyDevice::new(1));
        let plane = overlay(&device);
        let presenter = plane.presenter();
        assert!(matches!(
            presenter.present(3),
            Err(PlaneError::InvalidBuffer { index: 3, count: 3 })
        ));
    }

    #[test]
    fn failed_apply_keeps_geometry() {
        let device = Arc::new(DummyDevice::new(1));
        let mut plane = overlay(&device);
        plane.set_position(30, 40);
        device.fail_commit(true);
        assert!(matches!(plane.apply(), Err(PlaneError::Device(_))));
        assert_eq!(plane.config(), PlaneConfig::default());

        device.fail_commit(false);
        plane.presenter().present(0).unwrap();
        assert_eq!(device.commits()[0].config, PlaneConfig::default());
    }

    #[test]
    fn presenter_uses_applied_geometry() {
        let device = Arc::new(DummyDevice::new(1));
        let mut plane = overlay(&device);
        let presenter = plane.presenter();
        plane.set_position(7, 9);
        plane.apply().unwrap();
        plane.set_position(1, 1);

        presenter.present(2).unwrap();
        let commits = device.commits_on(plane.info().id);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[1].buffer, plane.buffer_handle(2).unwrap());
        assert_eq!(commits[1].config.position, Point::from((7, 9)));
    }

    #[test]
    fn drop_disables_and_frees() {
        let device = Arc::new(DummyDevice::new(1));
        let plane = overlay(&device);
        let id = plane.info().id;
        let presenter = plane.presenter();
        drop(plane);
        assert!(device.disabled().is_empty());
        assert_eq!(device.live_buffers(), 3);

        drop(presenter);
        assert_eq!(device.disabled(), vec![id]);
        assert_eq!(device.live_buffers(), 0);
    }
}
