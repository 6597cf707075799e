#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # scanout: hardware planes with asynchronous page flips
//!
//! This crate drives the hardware planes of a display controller for a compositor that
//! renders on the CPU. It claims primary and overlay planes, backs each of them with a small
//! ring of mapped buffers and presents those buffers from a worker thread, so drawing never
//! waits for the display.
//!
//! ## Structure of the crate
//!
//! - [`context`] contains the [`CompositorContext`](context::CompositorContext), the owner of
//!   the display device and the entry point of the crate.
//! - [`screen`] contains the [`ScreenSurface`](screen::ScreenSurface) a renderer draws into.
//! - [`plane`] claims hardware planes and manages their buffers.
//! - [`flip`] runs presentation jobs on a dedicated worker thread, dropping stale frames.
//! - [`backend`] abstracts the display controller, with an implementation for KMS devices.
//!
//! ## Ownership
//!
//! There is no global state besides the guard allowing a single open KMS device per process.
//! Every surface owns its flip worker and its plane, every plane keeps the device alive. Dropping
//! a surface stops and joins its worker before the plane is disabled, and the device is closed
//! once the last plane is gone.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```
//!
//! If you do not want to use [`tracing`], refer to [`log compatibility`](tracing#log-compatibility)
//! for how to forward the debug output to other `log` compatible frameworks.

pub mod backend;
pub mod context;
pub mod flip;
pub mod plane;
pub mod screen;
pub mod utils;

pub mod reexports;
