//! Buffer allocation and management.
//!
//! Collection of common traits around the memory backing a hardware plane.
//!
//! Buffer types supported:
//! - [DumbBuffers](dumb::DumbBuffer) through the kernel's dumb buffer interface
//! - [DummyBuffers](crate::backend::dummy::DummyBuffer) living in process memory (tests only)

#[cfg(feature = "backend_drm")]
pub mod dumb;
pub mod format;

use std::ptr::NonNull;

pub use drm_fourcc::DrmFourcc as Fourcc;

use crate::utils::{Buffer as BufferCoords, Size};

/// Common trait describing common properties of most types of buffers.
pub trait Buffer {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32 {
        self.size().w as u32
    }
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32 {
        self.size().h as u32
    }
    /// Size of the two-dimensional buffer
    fn size(&self) -> Size<i32, BufferCoords>;
    /// Pixel format of the buffer
    fn format(&self) -> Fourcc;
}

/// A buffer whose memory can be mapped into the address space of this process.
///
/// Scanout buffers are written directly by the renderer, so every plane buffer implements this.
pub trait MappedBuffer: Buffer {
    /// Length of a single row in bytes
    fn pitch(&self) -> u32;

    /// Kernel handle of the buffer object (the GEM handle for KMS devices)
    fn gem_handle(&self) -> u32;

    /// Address of the first byte of the mapping, `None` until the buffer is mapped
    fn ptr(&self) -> Option<NonNull<u8>>;

    /// Number of mapped bytes
    fn len(&self) -> usize {
        self.pitch() as usize * self.height() as usize
    }

    /// Returns true if the buffer covers no memory at all
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the buffer is mapped
    fn is_mapped(&self) -> bool {
        self.ptr().is_some()
    }
}
