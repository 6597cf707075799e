//! Drm/Kms types and backend implementations
//!
//! This module provides a [`KmsDevice`], a [`DisplayDevice`] driving the planes
//! of one crtc of a drm node, with [`DumbBuffer`]s attached as framebuffers.
//!
//! ## How to use it
//!
//! The device is usually opened by [`CompositorContext::open`](crate::context::CompositorContext::open),
//! which picks the node according to its [`ContextConfig`](crate::context::ContextConfig).
//! It can also be opened by hand:
//!
//! ```no_run
//! use scanout::backend::DisplayDevice;
//! use scanout::backend::drm::KmsDevice;
//!
//! let device = KmsDevice::open(None, "seat0", Some("atmel-hlcdc")).expect("no display");
//! println!("{} planes on crtc {:?}", device.planes().len(), device.crtc());
//! ```
//!
//! ### Page flips
//!
//! The primary plane performs a full modeset on its first commit and is page flipped
//! afterwards; the commit waits for the page-flip event of the crtc, which is why
//! presentation is always driven from a [`FlipQueue`](crate::flip::FlipQueue) worker.
//! Overlay and cursor planes are updated through `SETPLANE` and can only be shown
//! once the primary plane has been committed.

mod error;
mod fd;

use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use drm::control::{
    connector, crtc, framebuffer, plane, Device as ControlDevice, Event, Mode, ModeTypeFlags, PageFlipFlags,
    ResourceHandles,
};
use drm::{ClientCapability, Device as BasicDevice};
use tracing::{debug, debug_span, info, info_span, instrument, trace, warn};

pub use self::error::{AccessError, Error};
pub use self::fd::{open_by_driver, DrmDeviceFd};
#[cfg(test)]
pub(crate) use self::fd::DEVICE_GUARD;

use super::allocator::dumb::DumbBuffer;
use super::allocator::format::{get_bpp, get_depth};
use super::allocator::{Buffer, Fourcc, MappedBuffer};
use super::{DisplayDevice, PlaneConfig, PlaneInfo, PlaneType};
use crate::utils::{Buffer as BufferCoords, DevPath, Physical, Size};

#[cfg(feature = "backend_udev")]
fn seat_gpus(seat: &str) -> Result<Vec<PathBuf>, Error> {
    super::udev::all_gpus(seat).map_err(Error::Enumerate)
}

#[cfg(not(feature = "backend_udev"))]
fn seat_gpus(seat: &str) -> Result<Vec<PathBuf>, Error> {
    debug!(seat, "built without udev, no drm node to try");
    Ok(Vec::new())
}

/// A dumb buffer with a framebuffer attached, ready for scan-out
#[derive(Debug)]
pub struct KmsBuffer {
    fb: framebuffer::Handle,
    dumb: DumbBuffer,
    drm: DrmDeviceFd,
}

impl KmsBuffer {
    /// Framebuffer handle of this buffer
    pub fn framebuffer(&self) -> framebuffer::Handle {
        self.fb
    }
}

impl Drop for KmsBuffer {
    fn drop(&mut self) {
        trace!(fb = ?self.fb, "destroying framebuffer");
        if let Err(err) = self.drm.destroy_framebuffer(self.fb) {
            warn!(fb = ?self.fb, ?err, "failed to destroy framebuffer");
        }
    }
}

impl Buffer for KmsBuffer {
    fn size(&self) -> Size<i32, BufferCoords> {
        self.dumb.size()
    }

    fn format(&self) -> Fourcc {
        Buffer::format(&self.dumb)
    }
}

impl MappedBuffer for KmsBuffer {
    fn pitch(&self) -> u32 {
        self.dumb.pitch()
    }

    fn gem_handle(&self) -> u32 {
        self.dumb.gem_handle()
    }

    fn ptr(&self) -> Option<NonNull<u8>> {
        self.dumb.ptr()
    }
}

/// The planes of one crtc of an open drm device
#[derive(Debug)]
pub struct KmsDevice {
    fd: DrmDeviceFd,
    path: PathBuf,
    crtc: crtc::Handle,
    connector: connector::Handle,
    mode: Mode,
    planes: Vec<PlaneInfo>,
    handles: Vec<plane::Handle>,
    crtc_active: AtomicBool,
    flip_lock: Mutex<()>,
    span: tracing::Span,
}

impl KmsDevice {
    /// Open a drm node and set up the first connected display.
    ///
    /// If `path` is `None`, the gpus of `seat` are tried, primary gpu first, and the first one
    /// driven by `driver` (or the first one at all, if `driver` is `None`) is used. Finding the
    /// gpus needs the `backend_udev` feature, without it `path` has to be given.
    pub fn open(path: Option<&Path>, seat: &str, driver: Option<&str>) -> Result<KmsDevice, Error> {
        let (path, fd) = match path {
            Some(path) => (path.to_path_buf(), DrmDeviceFd::open(path)?),
            None => open_by_driver(seat_gpus(seat)?, driver)?,
        };
        KmsDevice::new(fd, path)
    }

    /// Set up the first connected display of an already opened drm node.
    pub fn new(fd: DrmDeviceFd, path: PathBuf) -> Result<KmsDevice, Error> {
        let span = info_span!("backend_drm", device = ?path);
        let _guard = span.enter();
        info!(driver = ?fd.driver_name(), "KmsDevice initializing");

        if fd.set_client_capability(ClientCapability::UniversalPlanes, true).is_err() {
            warn!("Universal planes are not supported, only overlay planes will be visible");
        }

        let resources = fd.resource_handles().map_err(|source| AccessError {
            errmsg: "Error loading drm resources",
            dev: fd.dev_path(),
            source,
        })?;

        let (connector, mode) = find_connector(&fd, &resources)?;
        let crtc = find_crtc(&fd, &resources, connector)?;
        info!(?connector, ?crtc, mode = ?mode.name(), size = ?mode.size(), "Selected display");

        let mut planes = Vec::new();
        let mut handles = Vec::new();
        let plane_handles = fd.plane_handles().map_err(|source| AccessError {
            errmsg: "Error loading plane handles",
            dev: fd.dev_path(),
            source,
        })?;
        for handle in plane_handles {
            let info = fd.get_plane(handle).map_err(|source| AccessError {
                errmsg: "Failed to get plane info",
                dev: fd.dev_path(),
                source,
            })?;
            if !resources.filter_crtcs(info.possible_crtcs()).contains(&crtc) {
                continue;
            }

            let kind = plane_type(&fd, handle)?;
            let index = planes.iter().filter(|p: &&PlaneInfo| p.kind == kind).count();
            let formats = info
                .formats()
                .iter()
                .filter_map(|&code| Fourcc::try_from(code).ok())
                .collect::<Vec<_>>();
            debug!(plane = ?handle, %kind, index, formats = formats.len(), "found plane");

            planes.push(PlaneInfo {
                id: u32::from(handle),
                kind,
                index,
                formats,
            });
            handles.push(handle);
        }

        drop(_guard);
        Ok(KmsDevice {
            fd,
            path,
            crtc,
            connector,
            mode,
            planes,
            handles,
            crtc_active: AtomicBool::new(false),
            flip_lock: Mutex::new(()),
            span,
        })
    }

    /// Returns the underlying file descriptor
    pub fn device_fd(&self) -> &DrmDeviceFd {
        &self.fd
    }

    /// Path of the opened drm node
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Crtc driven by this device
    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    /// Mode the crtc is set to on the first primary commit
    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn handle(&self, plane: &PlaneInfo) -> Result<plane::Handle, Error> {
        self.planes
            .iter()
            .position(|p| p.id == plane.id)
            .map(|idx| self.handles[idx])
            .ok_or(Error::UnknownPlane(plane.id))
    }

    fn access(&self, errmsg: &'static str) -> impl FnOnce(std::io::Error) -> Error + '_ {
        move |source| {
            Error::Access(AccessError {
                errmsg,
                dev: self.fd.dev_path(),
                source,
            })
        }
    }

    fn commit_primary(&self, buffer: &KmsBuffer) -> Result<(), Error> {
        let _lock = self.flip_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if !self.crtc_active.load(Ordering::SeqCst) {
            debug!("Setting screen");
            self.fd
                .set_crtc(self.crtc, Some(buffer.fb), (0, 0), &[self.connector], Some(self.mode))
                .map_err(self.access("Error setting crtc"))?;
            self.crtc_active.store(true, Ordering::SeqCst);
            return Ok(());
        }

        ControlDevice::page_flip(&self.fd, self.crtc, buffer.fb, PageFlipFlags::EVENT, None)
            .map_err(self.access("Failed to page flip"))?;

        // wait for the flip to land, so the next flip never hits a busy crtc
        loop {
            let events = self
                .fd
                .receive_events()
                .map_err(self.access("Error processing drm events"))?;
            for event in events {
                if let Event::PageFlip(event) = event {
                    if event.crtc == self.crtc {
                        trace!(frame = event.frame, "page flip completed");
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl DisplayDevice for KmsDevice {
    type Buffer = KmsBuffer;
    type Error = Error;

    fn planes(&self) -> &[PlaneInfo] {
        &self.planes
    }

    fn screen_size(&self) -> Size<i32, Physical> {
        let (w, h) = self.mode.size();
        (w as i32, h as i32).into()
    }

    #[instrument(level = "debug", parent = &self.span, skip(self, plane), fields(plane = plane.id))]
    fn create_buffer(
        &self,
        plane: &PlaneInfo,
        size: Size<i32, BufferCoords>,
        format: Fourcc,
    ) -> Result<KmsBuffer, Error> {
        let handle = self.handle(plane)?;
        let (Some(depth), Some(bpp), true) = (get_depth(format), get_bpp(format), plane.supports(format)) else {
            return Err(Error::UnsupportedFormat { plane: handle, format });
        };

        let dumb = DumbBuffer::create(&self.fd, size, format).map_err(self.access("Failed to create dumb buffer"))?;
        let fb = self
            .fd
            .add_framebuffer(dumb.handle(), depth, bpp)
            .map_err(self.access("Failed to add framebuffer"))?;

        Ok(KmsBuffer {
            fb,
            dumb,
            drm: self.fd.clone(),
        })
    }

    fn map_buffer(&self, buffer: &mut KmsBuffer) -> Result<(), Error> {
        buffer
            .dumb
            .map()
            .map_err(self.access("Failed to map dumb buffer"))
    }

    #[profiling::function]
    fn commit(&self, plane: &PlaneInfo, buffer: &KmsBuffer, config: &PlaneConfig) -> Result<(), Error> {
        let _span = debug_span!(parent: &self.span, "commit", plane = plane.id, fb = ?buffer.fb).entered();

        if plane.kind == PlaneType::Primary {
            if config.position.x != 0 || config.position.y != 0 || config.scale != 1.0 {
                trace!("primary plane ignores position and scale");
            }
            return self.commit_primary(buffer);
        }

        let handle = self.handle(plane)?;
        if !self.crtc_active.load(Ordering::SeqCst) {
            return Err(Error::CrtcInactive(self.crtc));
        }

        let src = buffer.size();
        let (loc, dst) = config.destination(src);
        self.fd
            .set_plane(
                handle,
                self.crtc,
                Some(buffer.fb),
                0,
                (loc.x, loc.y, dst.w as u32, dst.h as u32),
                (0, 0, (src.w as u32) << 16, (src.h as u32) << 16),
            )
            .map_err(self.access("Failed to set plane"))
    }

    fn disable(&self, plane: &PlaneInfo) -> Result<(), Error> {
        let handle = self.handle(plane)?;
        debug!(parent: &self.span, plane = ?handle, "disabling plane");

        if plane.kind == PlaneType::Primary {
            let _lock = self.flip_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.crtc_active.store(false, Ordering::SeqCst);
            return self
                .fd
                .set_crtc(self.crtc, None, (0, 0), &[], None)
                .map_err(self.access("Error disabling crtc"));
        }

        self.fd
            .set_plane(handle, self.crtc, None, 0, (0, 0, 0, 0), (0, 0, 0, 0))
            .map_err(self.access("Failed to disable plane"))
    }
}

fn find_connector(fd: &DrmDeviceFd, resources: &ResourceHandles) -> Result<(connector::Handle, Mode), Error> {
    for &conn in resources.connectors() {
        let info = fd.get_connector(conn, false).map_err(|source| AccessError {
            errmsg: "Error loading connector info",
            dev: fd.dev_path(),
            source,
        })?;
        if info.state() != connector::State::Connected {
            continue;
        }

        let mode = info
            .modes()
            .iter()
            .find(|mode| mode.mode_type().contains(ModeTypeFlags::PREFERRED))
            .or_else(|| info.modes().first());
        if let Some(mode) = mode {
            return Ok((conn, *mode));
        }
    }

    Err(Error::NoConnector)
}

fn find_crtc(
    fd: &DrmDeviceFd,
    resources: &ResourceHandles,
    conn: connector::Handle,
) -> Result<crtc::Handle, Error> {
    let info = fd.get_connector(conn, false).map_err(|source| AccessError {
        errmsg: "Error loading connector info",
        dev: fd.dev_path(),
        source,
    })?;

    // use the currently connected crtc if any
    if let Some(crtc) = info
        .current_encoder()
        .and_then(|enc| fd.get_encoder(enc).ok())
        .and_then(|enc| enc.crtc())
    {
        return Ok(crtc);
    }

    // or the first one that is compatible with any encoder
    info.encoders()
        .iter()
        .filter_map(|&enc| fd.get_encoder(enc).ok())
        .find_map(|enc| resources.filter_crtcs(enc.possible_crtcs()).first().copied())
        .ok_or(Error::NoCrtc)
}

fn plane_type(fd: &DrmDeviceFd, plane: plane::Handle) -> Result<PlaneType, Error> {
    let props = fd.get_properties(plane).map_err(|source| AccessError {
        errmsg: "Failed to get properties of plane",
        dev: fd.dev_path(),
        source,
    })?;
    let (ids, vals) = props.as_props_and_values();
    for (&id, &val) in ids.iter().zip(vals.iter()) {
        let info = fd.get_property(id).map_err(|source| AccessError {
            errmsg: "Failed to get property info",
            dev: fd.dev_path(),
            source,
        })?;
        if info.name().to_str().map(|x| x == "type").unwrap_or(false) {
            if let Some(kind) = PlaneType::from_raw(val) {
                return Ok(kind);
            }
        }
    }

    // planes without a type property predate universal planes and are overlays
    Ok(PlaneType::Overlay)
}
