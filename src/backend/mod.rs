//! Backend helpers
//!
//! Collection of helpers to interact with the kernel display stack.
//!
//! Supported backends:
//!
//! - [`drm`]: plane allocation and commits on kernel mode-setting devices

pub mod drm;
