use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use scanout::{
    backend::{
        allocator::{format, Fourcc},
        DisplayDevice,
    },
    context::{CompositorContext, ContextConfig},
    screen::ScreenSurface,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Drm node to open, overrides `SCANOUT_DEVICE`
    #[arg(short, long)]
    device: Option<PathBuf>,
    /// Seat to look for gpus on, overrides `SCANOUT_SEAT`
    #[arg(long)]
    seat: Option<String>,
    /// Only use drm nodes driven by this kernel driver, overrides `SCANOUT_DRIVER`
    #[arg(long)]
    driver: Option<String>,
    /// Number of frames to draw
    #[arg(short, long, default_value_t = 300)]
    frames: u32,
    #[arg(long, default_value_t = 256)]
    width: i32,
    #[arg(long, default_value_t = 256)]
    height: i32,
    /// Pixel format of the overlay
    #[arg(long, default_value = "Argb8888", value_parser = fourcc_from_string)]
    fourcc: Fourcc,
}

fn main() {
    let args = Cli::parse();

    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    let mut config = ContextConfig::from_env();
    if args.device.is_some() {
        config.device_path = args.device.clone();
    }
    if let Some(seat) = args.seat.clone() {
        config.seat = seat;
    }
    if args.driver.is_some() {
        config.driver = args.driver.clone();
    }

    let mut context = match CompositorContext::open(config) {
        Ok(context) => context,
        Err(err) => {
            error!(?err, "Failed to set up the display");
            eprintln!("scanout-demo: {}", report(&err));
            std::process::exit(1);
        }
    };

    let screen = context.screen_size();
    let mut overlay = match context.overlay_screen((args.width, args.height).into(), args.fourcc) {
        Ok(overlay) => Some(overlay),
        Err(err) => {
            warn!("Running without overlay: {}", report(&err));
            None
        }
    };

    for frame in 0..args.frames {
        if let Some(primary) = context.primary_mut() {
            paint(primary, rainbow(frame));
            primary.schedule_flip();
        }

        if let Some(overlay) = overlay.as_mut() {
            let span_x = (screen.w - args.width).max(1);
            let span_y = (screen.h - args.height).max(1);
            let step = frame as i32 * 4;
            overlay.set_position(step % span_x, (step / 2) % span_y);
            if let Err(err) = overlay.set_scale(1.0 + (frame % 60) as f32 / 120.0) {
                warn!(?err, "Invalid overlay scale");
            }
            if let Err(err) = overlay.apply() {
                warn!(?err, "Failed to move overlay");
            }

            paint(overlay, (rainbow(frame + 90) & 0x00ff_ffff) | 0x8000_0000);
            overlay.schedule_flip();
        }

        std::thread::sleep(Duration::from_millis(16));
    }

    if let Some(primary) = context.primary() {
        info!(
            dropped = primary.dropped_flips(),
            completed = primary.completed_flips(),
            "primary flips"
        );
    }
    if let Some(overlay) = overlay.as_ref() {
        info!(
            dropped = overlay.dropped_flips(),
            completed = overlay.completed_flips(),
            "overlay flips"
        );
    }
}

/// Fill the current buffer of `surface` with a solid color, given as `0xAARRGGBB`
fn paint<D: DisplayDevice>(surface: &mut ScreenSurface<D>, color: u32) {
    let Some(info) = format::format_info(surface.format()) else {
        return;
    };
    let bpp = info.bytes_per_pixel() as usize;
    let pixel = encode(surface.format(), color);
    let row = surface.size().w as usize * bpp;
    let pitch = surface.pitch() as usize;

    for line in surface.buffer_mut().chunks_mut(pitch) {
        for px in line[..row.min(line.len())].chunks_exact_mut(bpp) {
            px.copy_from_slice(&pixel[..bpp]);
        }
    }
}

fn encode(format: Fourcc, color: u32) -> [u8; 4] {
    let [b, g, r, a] = color.to_le_bytes();
    match format {
        Fourcc::Rgb565 => {
            let value = ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3);
            let [lo, hi] = value.to_le_bytes();
            [lo, hi, 0, 0]
        }
        Fourcc::Abgr8888 | Fourcc::Xbgr8888 => [r, g, b, a],
        Fourcc::Rgba8888 | Fourcc::Rgbx8888 => [a, b, g, r],
        _ => [b, g, r, a],
    }
}

fn rainbow(frame: u32) -> u32 {
    let hue = (frame % 360) as f32 / 60.0;
    let x = ((1.0 - (hue % 2.0 - 1.0).abs()) * 255.0) as u32;
    let (r, g, b) = match hue as u32 {
        0 => (255, x, 0),
        1 => (x, 255, 0),
        2 => (0, 255, x),
        3 => (0, x, 255),
        4 => (x, 0, 255),
        _ => (255, 0, x),
    };
    0xff00_0000 | (r << 16) | (g << 8) | b
}

fn report(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn fourcc_from_string(name: &str) -> Result<Fourcc, String> {
    format::known_formats()
        .iter()
        .copied()
        .find(|fourcc| format!("{:?}", fourcc).eq_ignore_ascii_case(name))
        .ok_or_else(|| format!("unknown or unsupported format `{}`", name))
}
