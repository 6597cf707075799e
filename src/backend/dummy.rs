//! In-process fake display controller
//!
//! [`DummyDevice`] implements [`DisplayDevice`] with heap allocated buffers and records
//! everything that gets committed, so the compositing core can be exercised without
//! any hardware.
#![allow(missing_docs)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::allocator::format::format_info;
use super::allocator::{Buffer, Fourcc, MappedBuffer};
use super::{DisplayDevice, PlaneConfig, PlaneInfo, PlaneType};
use crate::utils::{Buffer as BufferCoords, Physical, Size};

#[derive(Debug, thiserror::Error)]
pub enum DummyError {
    #[error("Plane {0} does not exist")]
    UnknownPlane(u32),
    #[error("Plane {plane} does not support format {format}")]
    UnsupportedFormat { plane: u32, format: Fourcc },
    #[error("Buffer creation on plane {0} was rejected")]
    CreateFailed(u32),
    #[error("Mapping buffer {0} failed")]
    MapFailed(u32),
    #[error("Commit on plane {0} failed")]
    CommitFailed(u32),
}

/// A single recorded [`DisplayDevice::commit`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Commit {
    pub plane: u32,
    pub kind: PlaneType,
    pub index: usize,
    pub buffer: u32,
    pub config: PlaneConfig,
}

pub struct DummyBuffer {
    data: NonNull<u8>,
    len: usize,
    size: Size<i32, BufferCoords>,
    format: Fourcc,
    pitch: u32,
    handle: u32,
    mapped: bool,
    live: Arc<AtomicUsize>,
}

// The allocation is owned by the buffer and only ever freed on drop.
unsafe impl Send for DummyBuffer {}
unsafe impl Sync for DummyBuffer {}

impl fmt::Debug for DummyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DummyBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("format", &self.format)
            .field("mapped", &self.mapped)
            .finish()
    }
}

impl Buffer for DummyBuffer {
    fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }
}

impl MappedBuffer for DummyBuffer {
    fn pitch(&self) -> u32 {
        self.pitch
    }

    fn gem_handle(&self) -> u32 {
        self.handle
    }

    fn ptr(&self) -> Option<NonNull<u8>> {
        self.mapped.then_some(self.data)
    }
}

impl Drop for DummyBuffer {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.data.as_ptr(), self.len);
        drop(unsafe { Box::from_raw(slice) });
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct DummyState {
    commits: Vec<Commit>,
    disabled: Vec<u32>,
    fail_create: Vec<u32>,
    fail_map: bool,
    fail_commit: bool,
}

#[derive(Debug)]
pub struct DummyDevice {
    planes: Vec<PlaneInfo>,
    screen: Size<i32, Physical>,
    next_handle: AtomicU32,
    live: Arc<AtomicUsize>,
    present_delay: Option<Duration>,
    state: Mutex<DummyState>,
}

impl DummyDevice {
    /// A 1920x1080 screen with one primary, `overlays` overlay and one cursor plane
    pub fn new(overlays: usize) -> DummyDevice {
        let mut planes = vec![PlaneInfo {
            id: 31,
            kind: PlaneType::Primary,
            index: 0,
            formats: vec![Fourcc::Xrgb8888, Fourcc::Argb8888, Fourcc::Rgb565],
        }];
        planes.extend((0..overlays).map(|index| PlaneInfo {
            id: 32 + index as u32,
            kind: PlaneType::Overlay,
            index,
            formats: vec![Fourcc::Argb8888, Fourcc::Xrgb8888, Fourcc::Rgb565, Fourcc::Rgb888],
        }));
        planes.push(PlaneInfo {
            id: 64,
            kind: PlaneType::Cursor,
            index: 0,
            formats: vec![Fourcc::Argb8888],
        });
        DummyDevice::with_planes((1920, 1080).into(), planes)
    }

    pub fn with_planes(screen: Size<i32, Physical>, planes: Vec<PlaneInfo>) -> DummyDevice {
        DummyDevice {
            planes,
            screen,
            next_handle: AtomicU32::new(1),
            live: Arc::new(AtomicUsize::new(0)),
            present_delay: None,
            state: Mutex::new(DummyState::default()),
        }
    }

    /// Make every commit sleep for `delay`, like waiting for a vblank
    pub fn with_present_delay(mut self, delay: Duration) -> DummyDevice {
        self.present_delay = Some(delay);
        self
    }

    /// Reject buffer creation on the plane with the given id
    pub fn fail_create(&self, plane: u32) {
        self.state().fail_create.push(plane);
    }

    pub fn fail_map(&self, fail: bool) {
        self.state().fail_map = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.state().fail_commit = fail;
    }

    pub fn commits(&self) -> Vec<Commit> {
        self.state().commits.clone()
    }

    /// Commits made to the plane with the given id, in order
    pub fn commits_on(&self, plane: u32) -> Vec<Commit> {
        self.state().commits.iter().filter(|c| c.plane == plane).copied().collect()
    }

    pub fn disabled(&self) -> Vec<u32> {
        self.state().disabled.clone()
    }

    /// Number of buffers created by this device and not yet dropped
    pub fn live_buffers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, DummyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn known(&self, plane: &PlaneInfo) -> Result<(), DummyError> {
        if self.planes.iter().any(|p| p.id == plane.id) {
            Ok(())
        } else {
            Err(DummyError::UnknownPlane(plane.id))
        }
    }
}

impl DisplayDevice for DummyDevice {
    type Buffer = DummyBuffer;
    type Error = DummyError;

    fn planes(&self) -> &[PlaneInfo] {
        &self.planes
    }

    fn screen_size(&self) -> Size<i32, Physical> {
        self.screen
    }

    fn create_buffer(
        &self,
        plane: &PlaneInfo,
        size: Size<i32, BufferCoords>,
        format: Fourcc,
    ) -> Result<DummyBuffer, DummyError> {
        self.known(plane)?;
        let info = match format_info(format) {
            Some(info) if plane.supports(format) => info,
            _ => {
                return Err(DummyError::UnsupportedFormat {
                    plane: plane.id,
                    format,
                })
            }
        };
        if size.is_empty() || self.state().fail_create.contains(&plane.id) {
            return Err(DummyError::CreateFailed(plane.id));
        }

        let pitch = info
            .min_pitch(size.w as u32)
            .ok_or(DummyError::CreateFailed(plane.id))?;
        let len = (pitch as usize)
            .checked_mul(size.h as usize)
            .ok_or(DummyError::CreateFailed(plane.id))?;
        let data = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(DummyBuffer {
            // Box::into_raw never returns null
            data: NonNull::new(data).ok_or(DummyError::CreateFailed(plane.id))?,
            len,
            size,
            format,
            pitch,
            handle: self.next_handle.fetch_add(1, Ordering::SeqCst),
            mapped: false,
            live: self.live.clone(),
        })
    }

    fn map_buffer(&self, buffer: &mut DummyBuffer) -> Result<(), DummyError> {
        if self.state().fail_map {
            return Err(DummyError::MapFailed(buffer.handle));
        }
        buffer.mapped = true;
        Ok(())
    }

    fn commit(&self, plane: &PlaneInfo, buffer: &DummyBuffer, config: &PlaneConfig) -> Result<(), DummyError> {
        self.known(plane)?;
        if let Some(delay) = self.present_delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state();
        if state.fail_commit {
            return Err(DummyError::CommitFailed(plane.id));
        }
        state.commits.push(Commit {
            plane: plane.id,
            kind: plane.kind,
            index: plane.index,
            buffer: buffer.handle,
            config: *config,
        });
        Ok(())
    }

    fn disable(&self, plane: &PlaneInfo) -> Result<(), DummyError> {
        self.known(plane)?;
        self.state().disabled.push(plane.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_counted() {
        let device = DummyDevice::new(1);
        let plane = device.planes()[1].clone();
        let mut buffer = device
            .create_buffer(&plane, (64, 32).into(), Fourcc::Argb8888)
            .unwrap();
        assert_eq!(device.live_buffers(), 1);
        assert!(!buffer.is_mapped());
        device.map_buffer(&mut buffer).unwrap();
        assert_eq!(buffer.pitch(), 256);
        assert_eq!(buffer.len(), 256 * 32);
        drop(buffer);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn rejected_formats() {
        let device = DummyDevice::new(1);
        let cursor = device.planes().last().unwrap().clone();
        assert!(matches!(
            device.create_buffer(&cursor, (64, 64).into(), Fourcc::Rgb565),
            Err(DummyError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn unrepresentable_sizes() {
        let device = DummyDevice::new(1);
        let overlay = device.planes()[1].clone();
        for size in [(0, 64), (64, 0), (i32::MAX, 1)] {
            assert!(matches!(
                device.create_buffer(&overlay, size.into(), Fourcc::Argb8888),
                Err(DummyError::CreateFailed(32))
            ));
        }
        assert_eq!(device.live_buffers(), 0);
    }
}
