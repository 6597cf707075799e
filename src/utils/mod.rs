//! Various utilities functions and types

mod geometry;

pub use self::geometry::{Buffer, Physical, Point, Size};

use std::os::unix::io::{AsFd, AsRawFd};
use std::path::PathBuf;

/// Trait representing open devices that *may* return a `Path`
pub trait DevPath {
    /// Returns the path of the open device if possible
    fn dev_path(&self) -> Option<PathBuf>;
}

impl<A: AsFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{:?}", self.as_fd().as_raw_fd())).ok()
    }
}

/// Interprets the value of a boolean switch.
///
/// `1`, `true`, `yes` and `y` (case insensitive) enable the switch, everything else disables it.
pub(crate) fn parse_flag(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    value == "1" || value == "true" || value == "yes" || value == "y"
}

#[cfg(test)]
mod tests {
    use super::{parse_flag, DevPath};

    #[test]
    fn dev_path_of_open_file() {
        let file = std::fs::File::open("/proc/self/status").unwrap();
        let path = file.dev_path().unwrap();
        assert!(path.ends_with("status"));
    }

    #[test]
    fn flags() {
        assert!(parse_flag("1"));
        assert!(parse_flag("Yes"));
        assert!(parse_flag(" TRUE "));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("off"));
        assert!(!parse_flag(""));
    }
}
