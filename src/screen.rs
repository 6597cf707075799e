//! Drawable surfaces with asynchronous flips
//!
//! A [`ScreenSurface`] is what a renderer draws into. It owns a [`Plane`] and the
//! [`FlipQueue`] presenting it:
//!
//! - draw into [`ScreenSurface::raw`] or [`ScreenSurface::buffer_mut`]
//! - call [`ScreenSurface::schedule_flip`], which returns immediately and leaves the next
//!   buffer ready for drawing
//!
//! Position and scale changes are staged with [`ScreenSurface::set_position`] and
//! [`ScreenSurface::set_scale`] and committed by [`ScreenSurface::apply`].
//!
//! Dropping a surface stops its flip worker first and then releases the plane.

use std::io;

use tracing::warn;

use crate::backend::allocator::Fourcc;
use crate::backend::{DisplayDevice, PlaneType};
use crate::flip::FlipQueue;
use crate::plane::{Plane, PlaneError};
use crate::utils::{Buffer as BufferCoords, Physical, Point, Size};

/// A plane together with the worker flipping it
#[derive(Debug)]
pub struct ScreenSurface<D: DisplayDevice> {
    // the queue is dropped (and its worker joined) before the plane is released
    queue: FlipQueue,
    plane: Plane<D>,
}

impl<D: DisplayDevice> ScreenSurface<D> {
    /// Wrap `plane`, keeping at most `backlog` flips waiting
    pub fn new(plane: Plane<D>, backlog: usize) -> io::Result<ScreenSurface<D>> {
        let name = format!("flip-{}-{}", plane.plane_type(), plane.plane_index());
        let queue = FlipQueue::with_backlog(name, backlog)?;
        Ok(ScreenSurface { queue, plane })
    }

    /// Present the current buffer and move on to the next one.
    ///
    /// The presentation happens on the flip worker using the geometry of the last
    /// [`ScreenSurface::apply`] that finished before the flip reached the device. The buffer
    /// index is advanced before this returns.
    #[profiling::function]
    pub fn schedule_flip(&mut self) {
        let presenter = self.plane.presenter();
        let buffer = self.plane.advance();

        self.queue.enqueue(move || {
            if let Err(err) = presenter.present(buffer) {
                warn!(buffer, ?err, "page flip failed");
            }
        });
    }

    /// Pointer to the buffer to draw into
    pub fn raw(&self) -> *mut u8 {
        self.plane.raw()
    }

    /// Memory of the buffer to draw into
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.plane.buffer_mut()
    }

    /// Index of the buffer to draw into
    pub fn index(&self) -> usize {
        self.plane.current()
    }

    /// Stage a new position of the plane
    pub fn set_position(&mut self, x: i32, y: i32) {
        self.plane.set_position(x, y)
    }

    /// Stage a new scale factor of the plane
    pub fn set_scale(&mut self, scale: f32) -> Result<(), PlaneError> {
        self.plane.set_scale(scale)
    }

    /// Staged position
    pub fn position(&self) -> Point<i32, Physical> {
        self.plane.position()
    }

    /// Staged scale factor
    pub fn scale(&self) -> f32 {
        self.plane.scale()
    }

    /// Commit the staged position and scale, blocking until the device accepted them.
    ///
    /// Flips still waiting in the queue are presented with the new geometry.
    pub fn apply(&mut self) -> Result<(), PlaneError> {
        self.plane.apply()
    }

    /// Size of the buffers
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.plane.size()
    }

    /// Pixel format of the buffers
    pub fn format(&self) -> Fourcc {
        self.plane.format()
    }

    /// Length of a buffer row in bytes
    pub fn pitch(&self) -> u32 {
        self.plane.pitch()
    }

    /// Number of buffers flipped through
    pub fn buffer_count(&self) -> usize {
        self.plane.buffer_count()
    }

    /// Kernel handle of buffer `index`
    pub fn buffer_handle(&self, index: usize) -> Option<u32> {
        self.plane.buffer_handle(index)
    }

    /// Index of the plane among planes of its type
    pub fn plane_index(&self) -> usize {
        self.plane.plane_index()
    }

    /// Type of the plane
    pub fn plane_type(&self) -> PlaneType {
        self.plane.plane_type()
    }

    /// Flips waiting for the worker
    pub fn pending_flips(&self) -> usize {
        self.queue.pending()
    }

    /// Flips skipped because newer ones were scheduled
    pub fn dropped_flips(&self) -> usize {
        self.queue.dropped()
    }

    /// Flips presented (or failed) by the worker
    pub fn completed_flips(&self) -> usize {
        self.queue.executed()
    }

    /// The plane being flipped
    pub fn plane(&self) -> &Plane<D> {
        &self.plane
    }

    /// Mutable access to the plane being flipped
    pub fn plane_mut(&mut self) -> &mut Plane<D> {
        &mut self.plane
    }
}
