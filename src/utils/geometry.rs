use std::fmt;

/// Type-level marker for the physical coordinate space of the display controller
#[derive(Debug)]
pub struct Physical;

/// Type-level marker for the buffer coordinate space
#[derive(Debug)]
pub struct Buffer;

/// A point as defined by its x and y coordinates
#[repr(C)]
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: std::marker::PhantomData<Kind>,
}

impl<N, Kind> From<(N, N)> for Point<N, Kind> {
    #[inline]
    fn from((x, y): (N, N)) -> Point<N, Kind> {
        Point {
            x,
            y,
            _kind: std::marker::PhantomData,
        }
    }
}

impl<N, Kind> From<Point<N, Kind>> for (N, N) {
    #[inline]
    fn from(point: Point<N, Kind>) -> (N, N) {
        (point.x, point.y)
    }
}

impl<N: fmt::Debug> fmt::Debug for Point<N, Physical> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point<Physical>")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

impl<N: fmt::Debug> fmt::Debug for Point<N, Buffer> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point<Buffer>")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

impl<N: Clone, Kind> Clone for Point<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Point {
            x: self.x.clone(),
            y: self.y.clone(),
            _kind: std::marker::PhantomData,
        }
    }
}

impl<N: Copy, Kind> Copy for Point<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Point<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<N: Eq, Kind> Eq for Point<N, Kind> {}

impl<N: Default, Kind> Default for Point<N, Kind> {
    #[inline]
    fn default() -> Self {
        Point {
            x: N::default(),
            y: N::default(),
            _kind: std::marker::PhantomData,
        }
    }
}

/// A size as defined by its width and height
///
/// Constructors of this type ensure that the values are always positive via
/// `debug_assert!()`, however manually changing the values of the fields
/// can break this invariant.
#[repr(C)]
pub struct Size<N, Kind> {
    /// horizontal coordinate
    pub w: N,
    /// vertical coordinate
    pub h: N,
    _kind: std::marker::PhantomData<Kind>,
}

impl<Kind> Size<i32, Kind> {
    /// Returns true if this [`Size`] covers no pixel at all
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }
}

impl Size<i32, Buffer> {
    /// Convert this buffer size to the size it covers on the display when scanned out
    /// with the given scale factor.
    ///
    /// The result is rounded to the nearest pixel and never collapses below one pixel.
    #[inline]
    pub fn to_physical_scaled(self, scale: f64) -> Size<i32, Physical> {
        let scaled = |v: i32| ((v as f64 * scale).round() as i32).max(1);
        Size {
            w: scaled(self.w),
            h: scaled(self.h),
            _kind: std::marker::PhantomData,
        }
    }
}

impl<N: fmt::Debug> fmt::Debug for Size<N, Physical> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size<Physical>")
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

impl<N: fmt::Debug> fmt::Debug for Size<N, Buffer> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size<Buffer>")
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

impl<Kind> From<(i32, i32)> for Size<i32, Kind> {
    #[inline]
    fn from((w, h): (i32, i32)) -> Size<i32, Kind> {
        debug_assert!(
            w >= 0 && h >= 0,
            "Attempting to create a `Size` of negative size: {:?}",
            (w, h)
        );
        Size {
            w,
            h,
            _kind: std::marker::PhantomData,
        }
    }
}

impl<N, Kind> From<Size<N, Kind>> for (N, N) {
    #[inline]
    fn from(size: Size<N, Kind>) -> (N, N) {
        (size.w, size.h)
    }
}

impl<N: Clone, Kind> Clone for Size<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Size {
            w: self.w.clone(),
            h: self.h.clone(),
            _kind: std::marker::PhantomData,
        }
    }
}

impl<N: Copy, Kind> Copy for Size<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Size<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<N: Eq, Kind> Eq for Size<N, Kind> {}

impl<N: Default, Kind> Default for Size<N, Kind> {
    #[inline]
    fn default() -> Self {
        Size {
            w: N::default(),
            h: N::default(),
            _kind: std::marker::PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, Physical, Size};

    #[test]
    fn scaled_size_rounds() {
        let size: Size<i32, Buffer> = (320, 240).into();
        assert_eq!(size.to_physical_scaled(1.5), Size::<i32, Physical>::from((480, 360)));
        assert_eq!(size.to_physical_scaled(0.001), Size::<i32, Physical>::from((1, 1)));
    }

    #[test]
    fn empty_size() {
        assert!(Size::<i32, Buffer>::from((0, 10)).is_empty());
        assert!(!Size::<i32, Buffer>::from((1, 1)).is_empty());
        // negative sizes can only be built by hand
        let negative = Size::<i32, Buffer> {
            w: -5,
            h: 10,
            _kind: std::marker::PhantomData,
        };
        assert!(negative.is_empty());
    }
}
