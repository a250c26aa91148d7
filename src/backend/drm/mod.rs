//! Drm/Kms plane allocation and commits
//!
//! This module assigns the hardware planes of a kms device to the buffers a compositor
//! wants to scan out and commits the result.
//!
//! The main entry point is the [`PlaneManager`]. It discovers the crtcs and planes of a
//! [`KmsDevice`] once and then, for every frame:
//!
//! - releases the planes of the previous frame with [`PlaneManager::begin_frame`],
//! - assigns one [`OverlayPlane`] list per crtc with [`PlaneManager::assign_overlay_planes`],
//! - and submits everything with [`PlaneManager::commit`].
//!
//! All per-frame state lives in a [`PlaneAssignmentList`] owned by the caller.
//!
//! ### Atomic and legacy devices
//!
//! Depending on the device and the `DRMPLANE_USE_LEGACY` environment variable, the manager
//! either uses atomic commits, which apply every plane change of a frame at once and allow
//! test-only validation, or legacy calls, which update every plane on its own.
//!
//! ### Completion
//!
//! Page flips complete asynchronously. Every assignment carries a weak reference to the
//! [`CrtcController`] owning the crtc, which gets notified through
//! [`CrtcController::on_page_flip`] once the flip happened, if it is still alive by then.
//!
//! ### Overlay promotion
//!
//! The [`OverlayValidator`] runs test-only commits to decide which compositor layers may be
//! scanned out directly.
//!
//! ```rust,no_run
//! # use std::rc::Rc;
//! # use drmplane::backend::drm::{PlaneManager, PlaneAssignmentList, OverlayPlane, CrtcController, KmsDevice};
//! # fn frame<D: KmsDevice>(
//! #     manager: &mut PlaneManager<D>,
//! #     controller: Rc<dyn CrtcController>,
//! #     overlays: Vec<OverlayPlane>,
//! # ) -> Result<(), drmplane::backend::drm::Error> {
//! let mut list = PlaneAssignmentList::default();
//! manager.begin_frame(&mut list);
//! manager.assign_overlay_planes(&mut list, &overlays, controller.crtc(), Rc::downgrade(&controller))?;
//! manager.commit(&mut list, false)?;
//! # Ok(())
//! # }
//! ```

use std::fmt;

use drm::control::crtc;

pub mod color;
pub mod device;
pub(crate) mod error;
mod manager;
mod overlay;
mod plane;
mod validator;

#[cfg(test)]
pub(crate) mod mock;

pub use self::device::{
    AtomicRequest, DrmObject, EventMetadata, KmsDevice, PageFlipCallback, PlaneInfo, Time,
};
#[cfg(feature = "backend_drm")]
pub use self::device::DrmKmsDevice;
pub use self::error::{AccessError, Error};
pub use self::manager::{
    CommitStrategy, CrtcProperties, CrtcProperty, LegacyOverlay, LegacyPageFlip, PlaneAssignmentList, PlaneManager,
};
pub use self::overlay::{OverlayPlane, ScanoutBuffer};
pub use self::plane::{
    format::{FormatBlob, FormatModifier},
    HardwarePlane, PlaneType,
};
pub use self::validator::{
    OverlayCheck, OverlayCheckResult, OverlayStatus, OverlayValidator, ScanoutBufferGenerator,
};

/// The owner of a crtc, notified when a flip submitted on its behalf completed
pub trait CrtcController: fmt::Debug {
    /// The crtc driven by this controller
    fn crtc(&self) -> crtc::Handle;

    /// Called once the frame containing this controller's planes is on screen
    fn on_page_flip(&self, metadata: &EventMetadata);
}
