use crate::backend::allocator::Fourcc;
use crate::backend::PlaneType;
use crate::utils::{Buffer as BufferCoords, Size};

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by operations on an allocated [`Plane`](super::Plane)
#[derive(Debug, thiserror::Error)]
pub enum PlaneError {
    /// Scale factors have to be finite and positive
    #[error("Invalid plane scale {0}")]
    InvalidScale(f32),
    /// The plane has no buffer with this index
    #[error("Buffer {index} out of range, the plane has {count} buffers")]
    InvalidBuffer {
        /// Requested buffer
        index: usize,
        /// Buffers of the plane
        count: usize,
    },
    /// The display device rejected the operation
    #[error("The display device failed to update the plane")]
    Device(#[source] BoxedError),
}

/// Errors returned by the [`PlaneAllocator`](super::PlaneAllocator)
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// No free plane can take a buffer of the requested size and format
    #[error("No free {kind} plane for a {}x{} {format} buffer", size.w, size.h)]
    PlaneExhausted {
        /// Requested plane type
        kind: PlaneType,
        /// Requested buffer size
        size: Size<i32, BufferCoords>,
        /// Requested pixel format
        format: Fourcc,
    },
    /// A buffer was created but could not be mapped
    #[error("Failed to map a buffer of {kind} plane {index}")]
    BufferMap {
        /// Type of the plane
        kind: PlaneType,
        /// Index of the plane among planes of its type
        index: usize,
        /// Underlying device error
        #[source]
        source: BoxedError,
    },
    /// The device could not create the buffers of the plane
    #[error("Failed to create the buffers of {kind} plane {index}")]
    Allocation {
        /// Type of the plane
        kind: PlaneType,
        /// Index of the plane among planes of its type
        index: usize,
        /// Underlying device error
        #[source]
        source: BoxedError,
    },
    /// The freshly allocated plane could not be shown
    #[error("Failed to commit the new plane")]
    Commit(#[from] PlaneError),
}
