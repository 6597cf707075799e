//! Module for [DumbBuffer](https://01.org/linuxgraphics/gfx-docs/drm/gpu/drm-kms.html#dumb-buffer-objects) buffers

use std::fmt;
use std::io;
use std::os::unix::io::AsFd;
use std::ptr::{self, NonNull};

use drm::buffer::Buffer as DrmBuffer;
use drm::control::{dumbbuffer::DumbBuffer as Handle, Device as ControlDevice};
use rustix::mm::{MapFlags, ProtFlags};
use tracing::{trace, warn};

use super::{format::get_bpp, Buffer, Fourcc, MappedBuffer};
use crate::backend::drm::DrmDeviceFd;
use crate::utils::{Buffer as BufferCoords, Size};

struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

/// Wrapper around raw DumbBuffer handles.
///
/// The buffer is destroyed (and unmapped, if mapped) once the wrapper is dropped.
pub struct DumbBuffer {
    fd: DrmDeviceFd,
    handle: Handle,
    format: Fourcc,
    mapping: Option<Mapping>,
}

// The mapping is plain shared memory owned by this wrapper.
unsafe impl Send for DumbBuffer {}
unsafe impl Sync for DumbBuffer {}

impl fmt::Debug for DumbBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbBuffer")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .field("mapped", &self.mapping.is_some())
            .finish()
    }
}

impl DumbBuffer {
    /// Allocate a new linear buffer of the given size and format on the device.
    pub fn create(fd: &DrmDeviceFd, size: Size<i32, BufferCoords>, fourcc: Fourcc) -> io::Result<DumbBuffer> {
        let bpp = get_bpp(fourcc).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no dumb buffer layout for format {}", fourcc),
            )
        })?;
        if size.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty buffer size"));
        }

        let handle = fd.create_dumb_buffer((size.w as u32, size.h as u32), fourcc, bpp)?;
        trace!(?handle, "created dumb buffer");

        Ok(DumbBuffer {
            fd: fd.clone(),
            handle,
            format: fourcc,
            mapping: None,
        })
    }

    /// Raw handle to the underlying buffer.
    ///
    /// Note: This handle will become invalid, once the `DumbBuffer` wrapper is dropped
    /// or the device used to create is closed. Do not copy this handle and assume it keeps being valid.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Map the buffer into the address space of this process.
    ///
    /// Mapping an already mapped buffer is a no-op.
    pub fn map(&mut self) -> io::Result<()> {
        if self.mapping.is_some() {
            return Ok(());
        }

        let len = self.handle.pitch() as usize * self.handle.size().1 as usize;
        let request = drm_ffi::mode::dumbbuffer::map(self.fd.as_fd(), u32::from(self.handle.handle()), 0, 0)?;
        let ptr = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                self.fd.as_fd(),
                request.offset,
            )?
        };
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping"))?;

        trace!(handle = ?self.handle, len, "mapped dumb buffer");
        self.mapping = Some(Mapping { ptr, len });
        Ok(())
    }

    /// Remove the mapping of this buffer, if any.
    pub fn unmap(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            if let Err(err) = unsafe { rustix::mm::munmap(mapping.ptr.as_ptr().cast(), mapping.len) } {
                warn!(handle = ?self.handle, ?err, "failed to unmap dumb buffer");
            }
        }
    }
}

impl Buffer for DumbBuffer {
    fn size(&self) -> Size<i32, BufferCoords> {
        let (w, h) = self.handle.size();
        (w as i32, h as i32).into()
    }

    fn format(&self) -> Fourcc {
        self.format
    }
}

impl MappedBuffer for DumbBuffer {
    fn pitch(&self) -> u32 {
        self.handle.pitch()
    }

    fn gem_handle(&self) -> u32 {
        u32::from(self.handle.handle())
    }

    fn ptr(&self) -> Option<NonNull<u8>> {
        self.mapping.as_ref().map(|m| m.ptr)
    }
}

impl Drop for DumbBuffer {
    fn drop(&mut self) {
        self.unmap();
        if let Err(err) = self.fd.destroy_dumb_buffer(self.handle) {
            warn!(handle = ?self.handle, ?err, "failed to destroy dumb buffer");
        }
    }
}
