//! `udev` based discovery of drm nodes
//!
//! Lists the primary drm nodes (`card*`) belonging to a seat. The gpu the firmware booted
//! with comes first, the others follow in the order of their card number.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use udev::{Device, Enumerator};

use crate::context::DEFAULT_SEAT;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Gpu {
    path: PathBuf,
    card: Option<u32>,
    boot_vga: bool,
}

fn on_seat(device: &Device, seat: &str) -> bool {
    device
        .property_value("ID_SEAT")
        .map(|x| x.to_os_string())
        .unwrap_or_else(|| OsString::from(DEFAULT_SEAT))
        == *seat
}

fn is_boot_vga(device: &Device) -> io::Result<bool> {
    Ok(device
        .parent_with_subsystem(Path::new("pci"))?
        .and_then(|pci| pci.attribute_value("boot_vga").map(|id| id == "1"))
        .unwrap_or(false))
}

/// Number of a `cardN` node name
fn card_number(name: &str) -> Option<u32> {
    name.strip_prefix("card")?.parse().ok()
}

fn sort_gpus(gpus: &mut [Gpu]) {
    // nodes without a number go last, the sort is stable for them
    gpus.sort_by_key(|gpu| (!gpu.boot_vga, gpu.card.is_none(), gpu.card));
}

fn scan(seat: &str) -> io::Result<Vec<Gpu>> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;

    let mut gpus = Vec::new();
    for device in enumerator.scan_devices()? {
        if !on_seat(&device, seat) {
            trace!(sysname = ?device.sysname(), "drm node on another seat");
            continue;
        }
        let Some(path) = device.devnode().map(PathBuf::from) else {
            continue;
        };
        gpus.push(Gpu {
            card: device.sysname().to_str().and_then(card_number),
            boot_vga: is_boot_vga(&device)?,
            path,
        });
    }
    sort_gpus(&mut gpus);
    debug!(seat, ?gpus, "found drm nodes");
    Ok(gpus)
}

/// Returns the path of the primary GPU device if any
///
/// That is the gpu the firmware booted with, or the first card of the seat if no gpu
/// of the seat is marked as boot gpu.
pub fn primary_gpu<S: AsRef<str>>(seat: S) -> io::Result<Option<PathBuf>> {
    Ok(scan(seat.as_ref())?.into_iter().next().map(|gpu| gpu.path))
}

/// Returns the paths of all available GPU devices of `seat`, primary gpu first
pub fn all_gpus<S: AsRef<str>>(seat: S) -> io::Result<Vec<PathBuf>> {
    Ok(scan(seat.as_ref())?.into_iter().map(|gpu| gpu.path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(card: &str, boot_vga: bool) -> Gpu {
        Gpu {
            path: PathBuf::from("/dev/dri").join(card),
            card: card_number(card),
            boot_vga,
        }
    }

    #[test]
    fn card_numbers() {
        assert_eq!(card_number("card0"), Some(0));
        assert_eq!(card_number("card12"), Some(12));
        assert_eq!(card_number("card"), None);
        assert_eq!(card_number("renderD128"), None);
    }

    #[test]
    fn boot_gpu_goes_first() {
        let mut gpus = vec![gpu("card10", false), gpu("card2", false), gpu("card7", true)];
        sort_gpus(&mut gpus);
        let names = gpus
            .iter()
            .map(|gpu| gpu.path.file_name().unwrap().to_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["card7", "card2", "card10"]);
    }

    #[test]
    fn unnumbered_nodes_go_last() {
        let mut gpus = vec![gpu("card-x", false), gpu("card3", false), gpu("card1", false)];
        sort_gpus(&mut gpus);
        assert_eq!(gpus[0].card, Some(1));
        assert_eq!(gpus[1].card, Some(3));
        assert_eq!(gpus[2].card, None);
    }

    #[test]
    fn unknown_seat_has_no_gpus() {
        // enumeration works without any gpu, a seat nobody uses never matches
        if let Ok(gpus) = all_gpus("seat-that-does-not-exist") {
            assert!(gpus.is_empty());
        }
    }
}
