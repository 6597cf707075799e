//! Claiming hardware planes
//!
//! The [`PlaneAllocator`] keeps a registry of the plane indices in use per plane type.
//! Claiming an index and releasing it again happens under the registry lock, so surfaces can
//! be allocated from several threads at once. Indices are released when the last reference
//! to the [`Plane`] is dropped.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, instrument, warn};

use super::{AllocationError, Plane, Scanout};
use crate::backend::allocator::Fourcc;
use crate::backend::{DisplayDevice, PlaneInfo, PlaneType};
use crate::utils::{Buffer as BufferCoords, Size};

/// Buffers created per plane by default
pub const DEFAULT_BUFFERS: usize = 3;

#[derive(Debug)]
struct Registry {
    // in-use flags, indexed by `PlaneType as usize`
    slots: Mutex<[Vec<bool>; 3]>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, [Vec<bool>; 3]> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Claim on a registry index, released on drop
pub(crate) struct Lease {
    registry: Arc<Registry>,
    kind: PlaneType,
    index: usize,
}

impl Lease {
    fn claim(registry: &Arc<Registry>, kind: PlaneType, index: usize) -> Option<Lease> {
        let mut slots = registry.lock();
        let slot = slots[kind as usize].get_mut(index)?;
        if *slot {
            return None;
        }
        *slot = true;
        Some(Lease {
            registry: registry.clone(),
            kind,
            index,
        })
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(slot) = self.registry.lock()[self.kind as usize].get_mut(self.index) {
            *slot = false;
        }
    }
}

enum BuildError<E> {
    Create(E),
    Map(E),
}

/// Hands out the hardware planes of a [`DisplayDevice`]
pub struct PlaneAllocator<D: DisplayDevice> {
    device: Arc<D>,
    registry: Arc<Registry>,
    overlay_buffers: usize,
    primary_buffers: usize,
}

impl<D: DisplayDevice> fmt::Debug for PlaneAllocator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaneAllocator")
            .field("device", &self.device)
            .field("registry", &self.registry)
            .field("overlay_buffers", &self.overlay_buffers)
            .field("primary_buffers", &self.primary_buffers)
            .finish()
    }
}

impl<D: DisplayDevice> PlaneAllocator<D> {
    /// Create an allocator for all planes of `device`
    pub fn new(device: Arc<D>) -> PlaneAllocator<D> {
        let slots = [PlaneType::Overlay, PlaneType::Primary, PlaneType::Cursor]
            .map(|kind| vec![false; device.count_planes(kind)]);
        PlaneAllocator {
            device,
            registry: Arc::new(Registry {
                slots: Mutex::new(slots),
            }),
            overlay_buffers: DEFAULT_BUFFERS,
            primary_buffers: DEFAULT_BUFFERS,
        }
    }

    /// Limit the number of overlay planes handed out.
    ///
    /// The limit never exceeds the overlay planes the device reports.
    pub fn with_overlay_capacity(self, capacity: usize) -> PlaneAllocator<D> {
        self.registry.lock()[PlaneType::Overlay as usize].truncate(capacity);
        self
    }

    /// Number of buffers created for overlay and primary planes.
    ///
    /// Counts of zero are treated as one.
    pub fn with_buffers(mut self, overlay: usize, primary: usize) -> PlaneAllocator<D> {
        self.overlay_buffers = overlay.max(1);
        self.primary_buffers = primary.max(1);
        self
    }

    /// The device planes are allocated from
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Number of planes of a type the device reports
    pub fn count_planes(&self, kind: PlaneType) -> usize {
        self.device.count_planes(kind)
    }

    /// Number of planes of a type that can be handed out
    pub fn capacity(&self, kind: PlaneType) -> usize {
        self.registry.lock()[kind as usize].len()
    }

    /// Number of planes of a type currently handed out
    pub fn in_use(&self, kind: PlaneType) -> usize {
        self.registry.lock()[kind as usize].iter().filter(|used| **used).count()
    }

    /// Claim the first free overlay plane able to show a buffer of the given size and format.
    ///
    /// Planes rejecting the buffers are skipped. A plane whose buffers cannot be mapped fails
    /// the allocation.
    #[instrument(level = "debug", skip(self))]
    pub fn allocate_overlay(
        &self,
        size: Size<i32, BufferCoords>,
        format: Fourcc,
    ) -> Result<Plane<D>, AllocationError> {
        if size.is_empty() {
            debug!(w = size.w, h = size.h, "no plane shows an empty buffer");
            return Err(AllocationError::PlaneExhausted {
                kind: PlaneType::Overlay,
                size,
                format,
            });
        }

        let mut candidates = self
            .device
            .planes()
            .iter()
            .filter(|plane| plane.kind == PlaneType::Overlay && plane.supports(format))
            .collect::<Vec<_>>();
        candidates.sort_by_key(|plane| plane.index);

        for plane in candidates {
            let Some(lease) = Lease::claim(&self.registry, PlaneType::Overlay, plane.index) else {
                continue;
            };

            match self.build(plane, lease, size, format, self.overlay_buffers) {
                Ok(plane) => {
                    info!("plane {} overlay dumb buffer {},{}", plane.plane_index(), size.w, size.h);
                    return Ok(plane);
                }
                Err(BuildError::Create(err)) => {
                    debug!(index = plane.index, ?err, "overlay plane rejected buffer, trying next");
                }
                Err(BuildError::Map(err)) => {
                    return Err(AllocationError::BufferMap {
                        kind: PlaneType::Overlay,
                        index: plane.index,
                        source: Box::new(err),
                    });
                }
            }
        }

        Err(AllocationError::PlaneExhausted {
            kind: PlaneType::Overlay,
            size,
            format,
        })
    }

    /// Claim the primary plane with buffers covering the whole screen and show it.
    #[instrument(level = "debug", skip(self))]
    pub fn allocate_primary(&self) -> Result<Plane<D>, AllocationError> {
        let screen = self.device.screen_size();
        let size: Size<i32, BufferCoords> = (screen.w, screen.h).into();
        let format = Fourcc::Xrgb8888;
        let exhausted = || AllocationError::PlaneExhausted {
            kind: PlaneType::Primary,
            size,
            format,
        };

        let plane = self
            .device
            .planes()
            .iter()
            .filter(|plane| plane.kind == PlaneType::Primary)
            .min_by_key(|plane| plane.index)
            .ok_or_else(exhausted)?;
        let lease = Lease::claim(&self.registry, PlaneType::Primary, plane.index).ok_or_else(exhausted)?;

        let mut plane = match self.build(plane, lease, size, format, self.primary_buffers) {
            Ok(plane) => plane,
            Err(BuildError::Create(err)) => {
                return Err(AllocationError::Allocation {
                    kind: PlaneType::Primary,
                    index: plane.index,
                    source: Box::new(err),
                })
            }
            Err(BuildError::Map(err)) => {
                return Err(AllocationError::BufferMap {
                    kind: PlaneType::Primary,
                    index: plane.index,
                    source: Box::new(err),
                })
            }
        };

        plane.apply()?;
        info!("plane {} primary dumb buffer {},{}", plane.plane_index(), size.w, size.h);
        Ok(plane)
    }

    /// Give a plane back to the allocator.
    ///
    /// The plane is disabled and its index freed once no flip job references it anymore.
    pub fn release(&self, plane: Plane<D>) {
        debug!(kind = %plane.plane_type(), index = plane.plane_index(), "releasing plane");
        drop(plane);
    }

    fn build(
        &self,
        info: &PlaneInfo,
        lease: Lease,
        size: Size<i32, BufferCoords>,
        format: Fourcc,
        count: usize,
    ) -> Result<Plane<D>, BuildError<D::Error>> {
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            let mut buffer = self
                .device
                .create_buffer(info, size, format)
                .map_err(BuildError::Create)?;
            if let Err(err) = self.device.map_buffer(&mut buffer) {
                warn!(kind = %info.kind, index = info.index, ?err, "failed to map buffer");
                return Err(BuildError::Map(err));
            }
            buffers.push(buffer);
        }

        Ok(Plane::new(Scanout::new(self.device.clone(), info.clone(), buffers, lease)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use std::sync::Barrier;

    fn allocator(overlays: usize) -> (Arc<DummyDevice>, Arc<PlaneAllocator<DummyDevice>>) {
        let device = Arc::new(DummyDevice::new(overlays));
        (device.clone(), Arc::new(PlaneAllocator::new(device)))
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let (_device, allocator) = allocator(3);
        let barrier = Arc::new(Barrier::new(3));

        let handles = (0..3)
            .map(|i| {
                let allocator = allocator.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let size = (64 * (i + 1), 48 * (i + 1)).into();
                    allocator.allocate_overlay(size, Fourcc::Argb8888).unwrap()
                })
            })
            .collect::<Vec<_>>();
        let planes = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();

        let mut indices = planes.iter().map(Plane::plane_index).collect::<Vec<_>>();
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(allocator.in_use(PlaneType::Overlay), 3);

        assert!(matches!(
            allocator.allocate_overlay((64, 64).into(), Fourcc::Argb8888),
            Err(AllocationError::PlaneExhausted {
                kind: PlaneType::Overlay,
                ..
            })
        ));
    }

    #[test]
    fn first_fit_reuses_released_index() {
        let (_device, allocator) = allocator(3);
        let first = allocator.allocate_overlay((64, 64).into(), Fourcc::Argb8888).unwrap();
        let second = allocator.allocate_overlay((64, 64).into(), Fourcc::Argb8888).unwrap();
        assert_eq!((first.plane_index(), second.plane_index()), (0, 1));

        allocator.release(first);
        let third = allocator.allocate_overlay((64, 64).into(), Fourcc::Argb8888).unwrap();
        assert_eq!(third.plane_index(), 0);
    }

    #[test]
    fn repeated_cycles_do_not_leak() {
        let (device, allocator) = allocator(2);
        for _ in 0..50 {
            let a = allocator.allocate_overlay((32, 32).into(), Fourcc::Rgb565).unwrap();
            let b = allocator.allocate_overlay((32, 32).into(), Fourcc::Rgb565).unwrap();
            assert_ne!(a.plane_index(), b.plane_index());
            allocator.release(a);
            drop(b);
        }
        assert_eq!(allocator.in_use(PlaneType::Overlay), 0);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn rejected_plane_is_skipped() {
        let (device, allocator) = allocator(3);
        device.fail_create(32);
        let plane = allocator.allocate_overlay((64, 64).into(), Fourcc::Argb8888).unwrap();
        assert_eq!(plane.plane_index(), 1);
        assert_eq!(allocator.in_use(PlaneType::Overlay), 1);
        assert_eq!(device.live_buffers(), 3);
    }

    #[test]
    fn map_failure_releases_index() {
        let (device, allocator) = allocator(3);
        device.fail_map(true);
        assert!(matches!(
            allocator.allocate_overlay((64, 64).into(), Fourcc::Argb8888),
            Err(AllocationError::BufferMap { index: 0, .. })
        ));
        assert_eq!(allocator.in_use(PlaneType::Overlay), 0);
        assert_eq!(device.live_buffers(), 0);

        device.fail_map(false);
        assert!(allocator.allocate_overlay((64, 64).into(), Fourcc::Argb8888).is_ok());
    }

    #[test]
    fn unsupported_format_exhausts() {
        let (_device, allocator) = allocator(3);
        assert!(matches!(
            allocator.allocate_overlay((64, 64).into(), Fourcc::Nv12),
            Err(AllocationError::PlaneExhausted { .. })
        ));
    }

    #[test]
    fn empty_size_claims_nothing() {
        let (device, allocator) = allocator(3);
        assert!(matches!(
            allocator.allocate_overlay((0, 64).into(), Fourcc::Argb8888),
            Err(AllocationError::PlaneExhausted {
                kind: PlaneType::Overlay,
                ..
            })
        ));
        assert_eq!(allocator.in_use(PlaneType::Overlay), 0);
        assert_eq!(device.live_buffers(), 0);
        assert!(allocator.allocate_overlay((64, 64).into(), Fourcc::Argb8888).is_ok());
    }

    #[test]
    fn capacity_limits_overlays() {
        let device = Arc::new(DummyDevice::new(3));
        let allocator = PlaneAllocator::new(device).with_overlay_capacity(1);
        assert_eq!(allocator.capacity(PlaneType::Overlay), 1);
        assert_eq!(allocator.count_planes(PlaneType::Overlay), 3);
        let _plane = allocator.allocate_overlay((64, 64).into(), Fourcc::Argb8888).unwrap();
        assert!(allocator.allocate_overlay((64, 64).into(), Fourcc::Argb8888).is_err());
    }

    #[test]
    fn primary_covers_screen() {
        let (device, allocator) = allocator(0);
        let plane = allocator.allocate_primary().unwrap();
        assert_eq!(plane.size(), Size::from((1920, 1080)));
        assert_eq!(plane.format(), Fourcc::Xrgb8888);
        assert_eq!(plane.buffer_count(), 3);
        assert_eq!(device.commits().len(), 1);
        assert!(matches!(
            allocator.allocate_primary(),
            Err(AllocationError::PlaneExhausted {
                kind: PlaneType::Primary,
                ..
            })
        ));
    }
}
