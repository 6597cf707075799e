//! Format info tables for the packed RGB formats scanout planes accept.
//!
//! [`format_info`] returns the layout of a format, [`get_bpp`] and [`get_depth`] are
//! shortcuts for the two values the kernel needs when a framebuffer is attached to a buffer.
//!
//! ```
//! # use scanout::backend::allocator::Fourcc;
//! # use scanout::backend::allocator::format::{get_bpp, get_depth};
//! assert_eq!(get_bpp(Fourcc::Xrgb8888), Some(32));
//! assert_eq!(get_depth(Fourcc::Xrgb8888), Some(24));
//! ```

use super::Fourcc;

/// Memory layout of a single-plane packed pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// Bits occupied by a pixel, including padding
    pub bpp: u32,
    /// Bits actually carrying color or alpha information
    pub depth: u32,
}

impl FormatInfo {
    /// Bytes occupied by a pixel
    pub const fn bytes_per_pixel(&self) -> u32 {
        (self.bpp + 7) / 8
    }

    /// Smallest row pitch in bytes for a buffer of the given width, `None` on overflow
    pub const fn min_pitch(&self, width: u32) -> Option<u32> {
        width.checked_mul(self.bytes_per_pixel())
    }
}

macro_rules! format_tables {
    ($($fourcc: ident { bpp: $bpp: expr, depth: $depth: expr $(,)? }),* $(,)?) => {
        /// Returns the layout of the specified format.
        ///
        /// Formats that are not packed RGB (or unknown) always return [`None`].
        pub const fn format_info(fourcc: Fourcc) -> Option<FormatInfo> {
            match fourcc {
                $(
                    Fourcc::$fourcc => Some(FormatInfo {
                        bpp: $bpp,
                        depth: $depth,
                    }),
                )*
                _ => None,
            }
        }

        /// All formats known to [`format_info`]
        pub fn known_formats() -> &'static [Fourcc] {
            &[$(Fourcc::$fourcc,)*]
        }
    };
}

format_tables! {
    // 8-bit bpp RGB
    Rgb332 { bpp: 8, depth: 8 },

    // 16-bit bpp RGB, 5 bits per color channel, 1 bit for alpha channel
    Argb1555 { bpp: 16, depth: 16 },
    Xrgb1555 { bpp: 16, depth: 15 },

    // 16-bit bpp RGB, 4 bits per channel
    Argb4444 { bpp: 16, depth: 16 },
    Xrgb4444 { bpp: 16, depth: 12 },

    // 16-bit bpp RGB, no alpha
    Rgb565 { bpp: 16, depth: 16 },
    Bgr565 { bpp: 16, depth: 16 },

    // 24-bit bpp RGB
    Rgb888 { bpp: 24, depth: 24 },
    Bgr888 { bpp: 24, depth: 24 },

    // 32-bit bpp RGB, 8 bits per channel
    Argb8888 { bpp: 32, depth: 32 },
    Xrgb8888 { bpp: 32, depth: 24 },
    Abgr8888 { bpp: 32, depth: 32 },
    Xbgr8888 { bpp: 32, depth: 24 },
    Rgba8888 { bpp: 32, depth: 32 },
    Rgbx8888 { bpp: 32, depth: 24 },
}

/// Returns the bits per pixel of the specified format.
pub const fn get_bpp(fourcc: Fourcc) -> Option<u32> {
    match format_info(fourcc) {
        Some(info) => Some(info.bpp),
        None => None,
    }
}

/// Returns the depth of the specified format.
pub const fn get_depth(fourcc: Fourcc) -> Option<u32> {
    match format_info(fourcc) {
        Some(info) => Some(info.depth),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{format_info, get_bpp, get_depth, known_formats, Fourcc};

    #[test]
    fn depth_never_exceeds_bpp() {
        for &format in known_formats() {
            assert!(get_depth(format).unwrap() <= get_bpp(format).unwrap());
        }
    }

    #[test]
    fn pitch_of_packed_rgb() {
        let info = format_info(Fourcc::Xrgb8888).unwrap();
        assert_eq!(info.min_pitch(1920), Some(7680));
        assert_eq!(info.min_pitch(u32::MAX), None);
        let info = format_info(Fourcc::Rgb888).unwrap();
        assert_eq!(info.min_pitch(3), Some(9));
        assert_eq!(format_info(Fourcc::Nv12), None);
    }
}
