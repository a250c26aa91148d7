use drm::control::{crtc, RawResourceHandle};
use std::{io, path::PathBuf};

/// Errors thrown by the [`PlaneManager`](crate::backend::drm::PlaneManager)
/// and the [`OverlayValidator`](crate::backend::drm::OverlayValidator).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// No free plane compatible with one of the requested overlays was left on the crtc
    #[error("No free plane left for an overlay on crtc `{crtc:?}`")]
    NoFreePlane {
        /// Crtc the overlays were assigned to
        crtc: crtc::Handle,
    },
    /// The kernel rejected a commit
    #[error("Commit rejected by the kernel: {0}")]
    CommitRejected(#[source] AccessError),
    /// The crtc is not managed by this device
    #[error("Unknown crtc `{0:?}`")]
    UnknownCrtc(crtc::Handle),
    /// The plane is not managed by this device
    #[error("Unknown plane `{0}`")]
    UnknownPlane(u32),
    /// The device is missing a required property
    #[error("The device is missing a required property '{name}' for handle ({handle:?})")]
    UnknownProperty {
        /// Object handle
        handle: RawResourceHandle,
        /// Property name
        name: &'static str,
    },
    /// A color management feature has no backing property on the device
    #[error("Property '{name}' is not supported for handle ({handle:?})")]
    PropertyUnsupported {
        /// Object handle
        handle: RawResourceHandle,
        /// Property name
        name: &'static str,
    },
    /// A color transformation matrix needs exactly 9 entries
    #[error("Invalid color matrix with {0} entries")]
    InvalidColorMatrix(usize),
    /// A property blob did not match the expected layout
    #[error("Malformed property blob: {0}")]
    InvalidBlob(&'static str),
    /// The plane cannot express the requested configuration
    #[error("Plane `{0}` does not support the requested configuration")]
    UnsupportedPlaneConfiguration(u32),
}

/// Error returned by a kernel call
#[derive(thiserror::Error, Debug)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}
