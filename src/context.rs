//! The compositing context
//!
//! A [`CompositorContext`] bundles an open [`DisplayDevice`], the [`PlaneAllocator`] handing
//! out its planes and, optionally, the [`ScreenSurface`] of the primary plane. There is no
//! global instance: create the context once and pass it to whatever needs to draw.
//!
//! ```no_run
//! use scanout::context::{CompositorContext, ContextConfig};
//! use scanout::backend::allocator::Fourcc;
//!
//! let mut context = CompositorContext::open(ContextConfig::from_env())?;
//! let mut overlay = context.overlay_screen((200, 100).into(), Fourcc::Argb8888)?;
//! overlay.buffer_mut().fill(0x80);
//! overlay.schedule_flip();
//!
//! if let Some(primary) = context.primary_mut() {
//!     primary.buffer_mut().fill(0xff);
//!     primary.schedule_flip();
//! }
//! # Ok::<(), scanout::context::ContextError>(())
//! ```
//!
//! ## Configuration
//!
//! [`ContextConfig::from_env`] starts from the defaults and reads the following variables:
//!
//! - `SCANOUT_DEVICE`: path of the drm node to open
//! - `SCANOUT_SEAT`: seat whose gpus are tried if no node is given, falls back to `XDG_SEAT`
//! - `SCANOUT_DRIVER`: only use drm nodes driven by this kernel driver
//! - `SCANOUT_OVERLAYS`: maximum number of overlay planes handed out
//! - `SCANOUT_FLIP_BACKLOG`: flips kept waiting per surface
//! - `SCANOUT_NO_PRIMARY`: do not set up the primary plane

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, info_span, warn};

#[cfg(feature = "backend_drm")]
use crate::backend::drm::{self, KmsDevice};
use crate::backend::allocator::Fourcc;
use crate::backend::{DisplayDevice, PlaneType};
use crate::flip::DEFAULT_BACKLOG;
use crate::plane::allocator::DEFAULT_BUFFERS;
use crate::plane::{AllocationError, PlaneAllocator};
use crate::screen::ScreenSurface;
use crate::utils::{parse_flag, Buffer as BufferCoords, Physical, Size};

/// Seat the gpus are looked up on by default
pub const DEFAULT_SEAT: &str = "seat0";

/// Settings of a [`CompositorContext`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// drm node to open, the gpus of [`ContextConfig::seat`] are tried if `None`
    pub device_path: Option<PathBuf>,
    /// Seat to look for gpus on, needs the `backend_udev` feature
    pub seat: String,
    /// Kernel driver the drm node has to be driven by
    pub driver: Option<String>,
    /// Set up the primary plane
    pub primary: bool,
    /// Buffers of the primary plane
    pub primary_buffers: usize,
    /// Buffers of each overlay plane
    pub overlay_buffers: usize,
    /// Maximum number of overlay planes handed out, all planes of the device if `None`
    pub overlay_capacity: Option<usize>,
    /// Flips kept waiting per surface
    pub flip_backlog: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            device_path: None,
            seat: String::from(DEFAULT_SEAT),
            driver: None,
            primary: true,
            primary_buffers: DEFAULT_BUFFERS,
            overlay_buffers: DEFAULT_BUFFERS,
            overlay_capacity: None,
            flip_backlog: DEFAULT_BACKLOG,
        }
    }
}

impl ContextConfig {
    /// Default configuration, overridden by `SCANOUT_*` environment variables
    pub fn from_env() -> ContextConfig {
        ContextConfig::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ContextConfig {
        let number = |name: &str| {
            let value = lookup(name)?;
            match value.trim().parse::<usize>() {
                Ok(number) => Some(number),
                Err(err) => {
                    warn!(name, value = %value, %err, "ignoring invalid setting");
                    None
                }
            }
        };

        let mut config = ContextConfig::default();
        if let Some(path) = lookup("SCANOUT_DEVICE").filter(|p| !p.is_empty()) {
            config.device_path = Some(path.into());
        }
        if let Some(seat) = lookup("SCANOUT_SEAT")
            .or_else(|| lookup("XDG_SEAT"))
            .filter(|s| !s.is_empty())
        {
            config.seat = seat;
        }
        if let Some(driver) = lookup("SCANOUT_DRIVER").filter(|d| !d.is_empty()) {
            config.driver = Some(driver);
        }
        if let Some(overlays) = number("SCANOUT_OVERLAYS") {
            config.overlay_capacity = Some(overlays);
        }
        if let Some(backlog) = number("SCANOUT_FLIP_BACKLOG") {
            config.flip_backlog = backlog;
        }
        if lookup("SCANOUT_NO_PRIMARY").map_or(false, |v| parse_flag(&v)) {
            config.primary = false;
        }
        config
    }
}

/// Errors creating a [`CompositorContext`] or its surfaces
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// No display device could be opened
    #[cfg(feature = "backend_drm")]
    #[error("Failed to open the display device")]
    DeviceOpen(#[source] drm::Error),
    /// The primary plane could not be set up
    #[error("Failed to set up the primary plane")]
    Primary(#[source] AllocationError),
    /// No overlay plane could be allocated
    #[error("Failed to allocate an overlay plane")]
    Overlay(#[source] AllocationError),
    /// The flip worker of a surface could not be started
    #[error("Failed to spawn the flip worker")]
    Worker(#[from] io::Error),
}

/// Owner of the display device and everything allocated from it
#[derive(Debug)]
pub struct CompositorContext<D: DisplayDevice> {
    // surfaces go before the allocator and the device
    primary: Option<ScreenSurface<D>>,
    allocator: PlaneAllocator<D>,
    config: ContextConfig,
    device: Arc<D>,
}

#[cfg(feature = "backend_drm")]
impl CompositorContext<KmsDevice> {
    /// Open the drm device selected by `config` and set up the context on it.
    ///
    /// Fails with [`drm::Error::AlreadyOpen`] while another context of this process is alive.
    pub fn open(config: ContextConfig) -> Result<CompositorContext<KmsDevice>, ContextError> {
        let device = KmsDevice::open(
            config.device_path.as_deref(),
            &config.seat,
            config.driver.as_deref(),
        )
        .map_err(ContextError::DeviceOpen)?;
        CompositorContext::new(device, config)
    }
}

impl<D: DisplayDevice> CompositorContext<D> {
    /// Set up a context on an already opened device
    pub fn new(device: D, config: ContextConfig) -> Result<CompositorContext<D>, ContextError> {
        let _span = info_span!("context").entered();
        let device = Arc::new(device);

        let mut allocator = PlaneAllocator::new(device.clone())
            .with_buffers(config.overlay_buffers, config.primary_buffers);
        if let Some(capacity) = config.overlay_capacity {
            allocator = allocator.with_overlay_capacity(capacity);
        }

        let size = device.screen_size();
        info!(
            width = size.w,
            height = size.h,
            overlays = allocator.capacity(PlaneType::Overlay),
            "display ready"
        );

        let primary = if config.primary {
            let plane = allocator.allocate_primary().map_err(ContextError::Primary)?;
            Some(ScreenSurface::new(plane, config.flip_backlog)?)
        } else {
            None
        };

        Ok(CompositorContext {
            primary,
            allocator,
            config,
            device,
        })
    }

    /// The display device
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// The allocator handing out the planes of the device
    pub fn allocator(&self) -> &PlaneAllocator<D> {
        &self.allocator
    }

    /// Configuration the context was created with
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Resolution of the screen
    pub fn screen_size(&self) -> Size<i32, Physical> {
        self.device.screen_size()
    }

    /// Number of planes of a type the device reports
    pub fn count_planes(&self, kind: PlaneType) -> usize {
        self.allocator.count_planes(kind)
    }

    /// Surface of the primary plane, if it was set up
    pub fn primary(&self) -> Option<&ScreenSurface<D>> {
        self.primary.as_ref()
    }

    /// Mutable surface of the primary plane, if it was set up
    pub fn primary_mut(&mut self) -> Option<&mut ScreenSurface<D>> {
        self.primary.as_mut()
    }

    /// Allocate an overlay plane and wrap it into a surface
    pub fn overlay_screen(
        &self,
        size: Size<i32, BufferCoords>,
        format: Fourcc,
    ) -> Result<ScreenSurface<D>, ContextError> {
        let plane = self
            .allocator
            .allocate_overlay(size, format)
            .map_err(ContextError::Overlay)?;
        Ok(ScreenSurface::new(plane, self.config.flip_backlog)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use std::collections::HashMap;

    #[test]
    fn primary_flips_wrap() {
        let mut context = CompositorContext::new(DummyDevice::new(3), ContextConfig::default()).unwrap();
        assert_eq!(context.screen_size(), Size::from((1920, 1080)));

        let primary = context.primary_mut().unwrap();
        assert_eq!(primary.size(), Size::from((1920, 1080)));
        assert_eq!(primary.format(), Fourcc::Xrgb8888);
        assert_eq!(primary.buffer_count(), 3);

        primary.buffer_mut().fill(0x20);
        primary.schedule_flip();
        assert_eq!(primary.index(), 1);
        primary.buffer_mut().fill(0xe0);
        primary.schedule_flip();
        assert_eq!(primary.index(), 2);
        primary.schedule_flip();
        assert_eq!(primary.index(), 0);
    }

    #[test]
    fn overlays_run_out() {
        let context = CompositorContext::new(DummyDevice::new(3), ContextConfig::default()).unwrap();
        assert_eq!(context.count_planes(PlaneType::Overlay), 3);

        let surfaces = [(200, 100), (320, 240), (64, 64)]
            .into_iter()
            .map(|size| context.overlay_screen(size.into(), Fourcc::Argb8888).unwrap())
            .collect::<Vec<_>>();
        let mut indices = surfaces.iter().map(ScreenSurface::plane_index).collect::<Vec<_>>();
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2]);

        assert!(matches!(
            context.overlay_screen((16, 16).into(), Fourcc::Argb8888),
            Err(ContextError::Overlay(AllocationError::PlaneExhausted { .. }))
        ));
    }

    #[test]
    fn without_primary() {
        let config = ContextConfig {
            primary: false,
            overlay_capacity: Some(1),
            ..ContextConfig::default()
        };
        let context = CompositorContext::new(DummyDevice::new(3), config).unwrap();
        assert!(context.primary().is_none());
        assert!(context.device().commits().is_empty());
        assert_eq!(context.allocator().capacity(PlaneType::Overlay), 1);
    }

    #[test]
    fn primary_failure_is_reported() {
        let device = DummyDevice::new(1);
        device.fail_map(true);
        assert!(matches!(
            CompositorContext::new(device, ContextConfig::default()),
            Err(ContextError::Primary(AllocationError::BufferMap {
                kind: PlaneType::Primary,
                ..
            }))
        ));
    }

    #[test]
    fn teardown_releases_everything() {
        let context = CompositorContext::new(DummyDevice::new(2), ContextConfig::default()).unwrap();
        let device = context.device().clone();
        let primary_id = context.primary().unwrap().plane().info().id;
        drop(context);
        assert_eq!(device.disabled(), vec![primary_id]);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(Arc::strong_count(&device), 1);
    }

    #[test]
    fn config_from_variables() {
        let vars = HashMap::from([
            ("SCANOUT_DEVICE", "/dev/dri/card1"),
            ("SCANOUT_DRIVER", "atmel-hlcdc"),
            ("XDG_SEAT", "seat1"),
            ("SCANOUT_OVERLAYS", "2"),
            ("SCANOUT_FLIP_BACKLOG", "nope"),
            ("SCANOUT_NO_PRIMARY", "yes"),
        ]);
        let config = ContextConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.device_path, Some(PathBuf::from("/dev/dri/card1")));
        assert_eq!(config.driver.as_deref(), Some("atmel-hlcdc"));
        assert_eq!(config.seat, "seat1");
        assert_eq!(config.overlay_capacity, Some(2));
        assert_eq!(config.flip_backlog, DEFAULT_BACKLOG);
        assert!(!config.primary);

        assert_eq!(ContextConfig::from_lookup(|_| None), ContextConfig::default());

        let seats = HashMap::from([("SCANOUT_SEAT", "seat2"), ("XDG_SEAT", "seat1")]);
        let config = ContextConfig::from_lookup(|name| seats.get(name).map(|v| v.to_string()));
        assert_eq!(config.seat, "seat2");
    }

    #[cfg(feature = "backend_drm")]
    #[test]
    fn unopenable_device_is_reported() {
        use crate::backend::drm::{Error as DrmError, DEVICE_GUARD};

        let _guard = DEVICE_GUARD
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let config = ContextConfig {
            device_path: Some(PathBuf::from("/nonexistent/dri/card0")),
            ..ContextConfig::default()
        };
        match CompositorContext::open(config) {
            Err(ContextError::DeviceOpen(DrmError::Open { path, .. })) => {
                assert_eq!(path, PathBuf::from("/nonexistent/dri/card0"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        // a node that is not a display controller fails after opening
        let config = ContextConfig {
            device_path: Some(PathBuf::from("/dev/null")),
            ..ContextConfig::default()
        };
        assert!(matches!(
            CompositorContext::open(config),
            Err(ContextError::DeviceOpen(_))
        ));
    }
}
