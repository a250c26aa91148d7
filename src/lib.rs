#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like CRTC
#![allow(clippy::upper_case_acronyms)]

//! # drmplane: hardware plane allocation for kms devices
//!
//! This crate assigns the scanout planes a kms device exposes (primary, overlay and cursor planes)
//! to the buffers a compositor wants to present, once per frame and across one or more crtcs.
//! The resulting assignment is committed either through the atomic or through the legacy
//! kernel mode-setting interface.
//!
//! ## Structure of the crate
//!
//! - [`backend::drm`] contains the plane manager, the commit strategies, color management
//!   and the overlay validator.
//! - [`utils`] contains the geometry types shared by the rest of the crate.
//!
//! ### Logging
//!
//! drmplane makes extensive use of [`tracing`] for its internal logging.
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

pub mod backend;
pub mod utils;

pub mod reexports;
