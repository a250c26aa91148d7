use std::rc::{Rc, Weak};

use drm::{
    control::{crtc, framebuffer, plane, property, RawResourceHandle},
    ClientCapability,
};
use drm_fourcc::{DrmFourcc, DrmModifier};
use indexmap::IndexMap;
use tracing::{debug, error, info, info_span, instrument, trace, warn};

use crate::{
    backend::drm::{
        color::{self, LutEntry},
        device::{force_legacy, map_props, AtomicRequest, DrmObject, KmsDevice, PropertyBlob},
        error::{AccessError, Error},
        overlay::OverlayPlane,
        plane::{HardwarePlane, PlaneType},
        CrtcController,
    },
    utils::{Buffer, Physical, Rectangle, Size},
};

mod atomic;
mod legacy;

use self::atomic::AtomicPlaneManager;
use self::legacy::LegacyPlaneManager;

/// Kernel interface used to apply plane assignments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitStrategy {
    /// Atomic commits, applying every change of a frame at once
    Atomic,
    /// Legacy page flips and plane updates
    Legacy,
}

/// A legacy plane update queued behind the page flip of its crtc
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyOverlay {
    /// Plane to update
    pub plane: plane::Handle,
    /// Framebuffer to show
    pub framebuffer: framebuffer::Handle,
    /// Destination on the crtc
    pub dst: Rectangle<i32, Physical>,
    /// Source rectangle in 16.16 fixed point
    pub src: Rectangle<u32, Buffer>,
}

/// Page flip of one crtc together with its overlay updates
#[derive(Debug, Clone)]
pub struct LegacyPageFlip {
    /// Crtc to flip
    pub crtc: crtc::Handle,
    /// Framebuffer of the primary plane
    pub framebuffer: framebuffer::Handle,
    /// Controller notified once the flip completed
    pub controller: Weak<dyn CrtcController>,
    /// Overlay planes updated along with the flip
    pub overlays: Vec<LegacyOverlay>,
}

/// Per frame plane assignment
///
/// Holds the planes assigned for the frame being built, the planes of the last
/// committed frame and the pending kernel transaction.
#[derive(Debug, Default)]
pub struct PlaneAssignmentList {
    pub(crate) plane_list: Vec<usize>,
    pub(crate) old_plane_list: Vec<usize>,
    pub(crate) atomic_request: AtomicRequest,
    pub(crate) legacy_page_flips: Vec<LegacyPageFlip>,
}

impl PlaneAssignmentList {
    /// Indices (into [`PlaneManager::planes`]) of the planes assigned for the next commit
    pub fn plane_list(&self) -> &[usize] {
        &self.plane_list
    }

    /// Indices (into [`PlaneManager::planes`]) of the planes of the last committed frame
    pub fn old_plane_list(&self) -> &[usize] {
        &self.old_plane_list
    }

    /// Pending atomic transaction
    pub fn atomic_request(&self) -> &AtomicRequest {
        &self.atomic_request
    }

    /// Pending legacy page flips
    pub fn legacy_page_flips(&self) -> &[LegacyPageFlip] {
        &self.legacy_page_flips
    }
}

/// A crtc property and its last written value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcProperty {
    /// Property handle
    pub handle: property::Handle,
    /// Value
    pub value: u64,
}

/// Color management properties of a crtc, each optional
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcProperties {
    crtc: crtc::Handle,
    /// Color transformation matrix
    pub ctm: Option<CrtcProperty>,
    /// Gamma lookup table
    pub gamma_lut: Option<CrtcProperty>,
    /// Number of gamma lookup table entries
    pub gamma_lut_size: Option<CrtcProperty>,
    /// Degamma lookup table
    pub degamma_lut: Option<CrtcProperty>,
    /// Number of degamma lookup table entries
    pub degamma_lut_size: Option<CrtcProperty>,
}

impl CrtcProperties {
    fn new<D: KmsDevice + ?Sized>(dev: &D, crtc: crtc::Handle) -> CrtcProperties {
        let props = match map_props(dev, DrmObject::Crtc(crtc)) {
            Ok(props) => props,
            Err(err) => {
                warn!(?crtc, "Failed to get crtc properties: {}", err);
                Default::default()
            }
        };
        let get = |name: &str| {
            props
                .get(name)
                .map(|(handle, value)| CrtcProperty {
                    handle: *handle,
                    value: *value,
                })
        };

        CrtcProperties {
            crtc,
            ctm: get("CTM"),
            gamma_lut: get("GAMMA_LUT"),
            gamma_lut_size: get("GAMMA_LUT_SIZE"),
            degamma_lut: get("DEGAMMA_LUT"),
            degamma_lut_size: get("DEGAMMA_LUT_SIZE"),
        }
    }

    /// The crtc
    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }
}

#[derive(Debug)]
enum PlaneManagerInternal {
    Atomic(AtomicPlaneManager),
    Legacy(LegacyPlaneManager),
}

/// Allocates the planes of a kms device to overlays and commits the result
#[derive(Debug)]
pub struct PlaneManager<D: KmsDevice> {
    dev: D,
    planes: Vec<HardwarePlane>,
    crtcs: IndexMap<crtc::Handle, CrtcProperties>,
    supported_formats: Vec<u32>,
    internal: PlaneManagerInternal,
    span: tracing::Span,
}

/// Release every plane assigned for the pending frame and drop the pending transaction
pub(super) fn reset_current_plane_list(planes: &mut [HardwarePlane], list: &mut PlaneAssignmentList) {
    for &idx in &list.plane_list {
        planes[idx].release();
    }
    list.plane_list.clear();
    list.legacy_page_flips.clear();
    list.atomic_request.clear();
}

impl<D: KmsDevice> PlaneManager<D> {
    /// Discover the planes of a device
    ///
    /// Atomic commits are used if the device supports them, unless the
    /// `DRMPLANE_USE_LEGACY` environment variable is set.
    pub fn new(dev: D) -> Result<Self, Error> {
        let force_legacy = force_legacy();
        if force_legacy {
            info!("DRMPLANE_USE_LEGACY is set. Forcing legacy commits.");
        }

        let strategy = if !force_legacy && dev.set_client_capability(ClientCapability::Atomic, true).is_ok() {
            CommitStrategy::Atomic
        } else {
            info!("Falling back to legacy commits");
            CommitStrategy::Legacy
        };

        Self::with_strategy(dev, strategy)
    }

    /// Discover the planes of a device, using the given commit strategy
    pub fn with_strategy(dev: D, strategy: CommitStrategy) -> Result<Self, Error> {
        let span = match strategy {
            CommitStrategy::Atomic => info_span!("drm_atomic"),
            CommitStrategy::Legacy => info_span!("drm_legacy"),
        };
        let _guard = span.enter();

        if strategy == CommitStrategy::Atomic {
            dev.set_client_capability(ClientCapability::Atomic, true)
                .map_err(|source| {
                    Error::Access(AccessError {
                        errmsg: "Error enabling atomic modesetting",
                        dev: dev.dev_path(),
                        source,
                    })
                })?;
        }

        let universal_planes = dev
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .is_ok();
        if !universal_planes {
            debug!("Universal planes are not supported");
        }

        let crtcs = dev
            .crtcs()
            .map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Error loading crtcs",
                    dev: dev.dev_path(),
                    source,
                })
            })?
            .into_iter()
            .map(|crtc| (crtc, CrtcProperties::new(&dev, crtc)))
            .collect::<IndexMap<_, _>>();

        let plane_handles = dev.planes().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading planes",
                dev: dev.dev_path(),
                source,
            })
        })?;

        // dummy planes must not reuse an id the kernel handed out, usable or not
        let plane_ids = plane_handles
            .iter()
            .map(|handle| RawResourceHandle::from(*handle).get())
            .collect::<Vec<_>>();

        let atomic = strategy == CommitStrategy::Atomic;
        let mut planes = Vec::with_capacity(plane_handles.len());
        for handle in plane_handles {
            match HardwarePlane::new(&dev, handle, atomic) {
                Ok(plane) => planes.push(plane),
                Err(err) => warn!(?handle, "Skipping plane: {}", err),
            }
        }

        if !universal_planes {
            for (index, crtc) in crtcs.keys().enumerate() {
                let dummy = HardwarePlane::dummy(*crtc, index);
                if !plane_ids.contains(&dummy.id()) {
                    debug!(?crtc, id = dummy.id(), "Adding dummy primary plane");
                    planes.push(dummy);
                }
            }
        }

        planes.sort_by_key(HardwarePlane::id);

        let mut supported_formats = planes
            .iter()
            .flat_map(|plane| plane.formats().iter().copied())
            .collect::<Vec<_>>();
        supported_formats.sort_unstable();
        supported_formats.dedup();

        info!(
            crtcs = crtcs.len(),
            planes = planes.len(),
            formats = supported_formats.len(),
            "Plane manager initialized"
        );

        let internal = match strategy {
            CommitStrategy::Atomic => PlaneManagerInternal::Atomic(AtomicPlaneManager::new(span.clone())),
            CommitStrategy::Legacy => PlaneManagerInternal::Legacy(LegacyPlaneManager::new(span.clone())),
        };

        drop(_guard);
        Ok(PlaneManager {
            dev,
            planes,
            crtcs,
            supported_formats,
            internal,
            span,
        })
    }

    /// The underlying device
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// The commit strategy in use
    pub fn strategy(&self) -> CommitStrategy {
        match self.internal {
            PlaneManagerInternal::Atomic(_) => CommitStrategy::Atomic,
            PlaneManagerInternal::Legacy(_) => CommitStrategy::Legacy,
        }
    }

    /// Returns true if atomic commits are used
    pub fn is_atomic(&self) -> bool {
        self.strategy() == CommitStrategy::Atomic
    }

    /// All planes, sorted by ascending id
    pub fn planes(&self) -> &[HardwarePlane] {
        &self.planes
    }

    /// Crtcs of the device, in kernel order
    pub fn crtcs(&self) -> impl Iterator<Item = crtc::Handle> + '_ {
        self.crtcs.keys().copied()
    }

    /// Color management properties of a crtc
    pub fn crtc_properties(&self, crtc: crtc::Handle) -> Option<&CrtcProperties> {
        self.crtcs.get(&crtc)
    }

    /// Union of the formats of all planes, sorted
    pub fn supported_formats(&self) -> &[u32] {
        &self.supported_formats
    }

    fn crtc_index(&self, crtc: crtc::Handle) -> Result<usize, Error> {
        self.crtcs.get_index_of(&crtc).ok_or_else(|| {
            error!(?crtc, "Unknown crtc");
            Error::UnknownCrtc(crtc)
        })
    }

    /// Modifiers the primary plane of `crtc` supports for `format`
    pub fn format_modifiers(&self, crtc: crtc::Handle, format: DrmFourcc) -> Vec<DrmModifier> {
        let Ok(index) = self.crtc_index(crtc) else {
            return Vec::new();
        };

        self.planes
            .iter()
            .find(|plane| plane.plane_type() == PlaneType::Primary && plane.can_use_for_crtc(index))
            .map(|plane| plane.modifiers_for_format(format as u32))
            .unwrap_or_default()
    }

    /// Checks if a plane at stacking position `z_order` on `crtc` could scan out `format`
    ///
    /// Position 0 is served by the primary plane, every other position by an overlay plane.
    pub fn is_format_supported(&self, format: DrmFourcc, z_order: i32, crtc: crtc::Handle) -> bool {
        let Ok(index) = self.crtc_index(crtc) else {
            return false;
        };

        self.planes.iter().any(|plane| {
            let position_matches = match plane.plane_type() {
                PlaneType::Primary | PlaneType::Dummy => z_order == 0,
                PlaneType::Overlay => z_order > 0,
                PlaneType::Cursor => false,
            };
            position_matches && plane.can_use_for_crtc(index) && plane.is_supported_format(format as u32)
        })
    }

    /// Release the planes of the last committed frame for reassignment
    #[instrument(level = "trace", parent = &self.span, skip(self, list))]
    pub fn begin_frame(&mut self, list: &mut PlaneAssignmentList) {
        for &idx in &list.old_plane_list {
            self.planes[idx].in_use = false;
        }
    }

    fn find_next_unused_plane(
        &self,
        plane_idx: &mut usize,
        crtc_index: usize,
        overlay: &OverlayPlane,
    ) -> Option<usize> {
        let format = overlay.required_format() as u32;
        while *plane_idx < self.planes.len() {
            let idx = *plane_idx;
            *plane_idx += 1;

            let plane = &self.planes[idx];
            if !plane.in_use()
                && plane.plane_type() != PlaneType::Cursor
                && plane.can_use_for_crtc(crtc_index)
                && plane.is_supported_format(format)
            {
                return Some(idx);
            }
        }
        None
    }

    /// Assign a plane to every overlay, in order
    ///
    /// If any overlay cannot be placed, every assignment of the pending frame is released
    /// and the pending transaction is dropped.
    #[profiling::function]
    #[instrument(level = "trace", parent = &self.span, skip(self, list, overlays, controller))]
    pub fn assign_overlay_planes(
        &mut self,
        list: &mut PlaneAssignmentList,
        overlays: &[OverlayPlane],
        crtc: crtc::Handle,
        controller: Weak<dyn CrtcController>,
    ) -> Result<(), Error> {
        let crtc_index = self.crtc_index(crtc)?;

        let mut plane_idx = 0;
        for overlay in overlays {
            let Some(idx) = self.find_next_unused_plane(&mut plane_idx, crtc_index, overlay) else {
                debug!(
                    z_order = overlay.z_order,
                    format = ?overlay.required_format(),
                    "No free plane left for overlay"
                );
                reset_current_plane_list(&mut self.planes, list);
                return Err(Error::NoFreePlane { crtc });
            };

            if let Err(err) = self.set_plane_data(list, idx, overlay, crtc, &controller) {
                debug!("Failed to set plane data: {}", err);
                reset_current_plane_list(&mut self.planes, list);
                return Err(err);
            }

            list.plane_list.push(idx);
            let plane = &mut self.planes[idx];
            plane.in_use = true;
            plane.owning_crtc = Some(crtc);
            trace!(plane = plane.id(), z_order = overlay.z_order, "Assigned plane");
        }

        Ok(())
    }

    /// Queue the state of a single plane in the pending transaction
    pub fn set_plane_data(
        &mut self,
        list: &mut PlaneAssignmentList,
        plane_idx: usize,
        overlay: &OverlayPlane,
        crtc: crtc::Handle,
        controller: &Weak<dyn CrtcController>,
    ) -> Result<(), Error> {
        let plane = self
            .planes
            .get_mut(plane_idx)
            .ok_or(Error::UnknownPlane(plane_idx as u32))?;

        let src = if plane.plane_type() == PlaneType::Dummy {
            Rectangle::zero()
        } else {
            overlay.fixed_src_rect()
        };

        match &self.internal {
            PlaneManagerInternal::Atomic(manager) => {
                manager.set_plane_data(list, plane, overlay, crtc, src, controller)
            }
            PlaneManagerInternal::Legacy(manager) => {
                manager.set_plane_data(list, plane, overlay, crtc, src, controller)
            }
        }
    }

    /// Submit the pending frame
    ///
    /// A `test_only` commit validates the assignment without applying it and releases
    /// every plane of the pending frame afterwards.
    #[profiling::function]
    pub fn commit(&mut self, list: &mut PlaneAssignmentList, test_only: bool) -> Result<(), Error> {
        match &self.internal {
            PlaneManagerInternal::Atomic(manager) => manager.commit(&self.dev, &mut self.planes, list, test_only),
            PlaneManagerInternal::Legacy(manager) => manager.commit(&self.dev, &mut self.planes, list, test_only),
        }
    }

    /// Test commit `overlays` on the crtc of every controller, in place of the frame on screen
    ///
    /// The planes of the last frame committed through `live` count as free for the test and
    /// are restored afterwards, `live` itself is not modified. Planes assigned to the pending
    /// frame of `live` stay taken.
    #[instrument(level = "trace", parent = &self.span, skip_all, fields(overlays = overlays.len()))]
    pub fn test_overlay_planes(
        &mut self,
        live: &PlaneAssignmentList,
        overlays: &[OverlayPlane],
        controllers: &[Rc<dyn CrtcController>],
    ) -> Result<(), Error> {
        let saved = live
            .old_plane_list
            .iter()
            .map(|&idx| {
                let plane = &self.planes[idx];
                (idx, plane.in_use, plane.owning_crtc, plane.controller.clone())
            })
            .collect::<Vec<_>>();

        let mut list = PlaneAssignmentList {
            old_plane_list: live.old_plane_list.clone(),
            ..Default::default()
        };
        self.begin_frame(&mut list);

        let mut res = Ok(());
        for controller in controllers {
            res = self.assign_overlay_planes(&mut list, overlays, controller.crtc(), Rc::downgrade(controller));
            if res.is_err() {
                break;
            }
        }
        if res.is_ok() {
            res = self.commit(&mut list, true);
        }

        for (idx, in_use, owning_crtc, controller) in saved {
            let plane = &mut self.planes[idx];
            plane.in_use = in_use;
            plane.owning_crtc = owning_crtc;
            plane.controller = controller;
        }
        res
    }

    /// Detach every overlay plane of the last committed frame
    pub fn disable_overlay_planes(&mut self, list: &mut PlaneAssignmentList) -> Result<(), Error> {
        match &self.internal {
            PlaneManagerInternal::Atomic(manager) => {
                manager.disable_overlay_planes(&self.dev, &mut self.planes, list)
            }
            PlaneManagerInternal::Legacy(manager) => {
                manager.disable_overlay_planes(&self.dev, &mut self.planes, list)
            }
        }
    }

    /// Checks if `primary` can be scanned out with a mode of `mode_size`
    pub fn validate_primary_size(&self, primary: &OverlayPlane, mode_size: Size<i32, Physical>) -> bool {
        match &self.internal {
            PlaneManagerInternal::Atomic(manager) => manager.validate_primary_size(primary, mode_size),
            PlaneManagerInternal::Legacy(manager) => manager.validate_primary_size(primary, mode_size),
        }
    }

    /// Set a row-major 3x3 color transformation matrix on a crtc
    ///
    /// Falls back to the per plane matrices of every plane of the crtc if the crtc
    /// has no `CTM` property.
    #[instrument(level = "debug", parent = &self.span, skip(self, matrix))]
    pub fn set_color_matrix(&mut self, crtc: crtc::Handle, matrix: &[f32]) -> Result<(), Error> {
        if matrix.is_empty() {
            error!("Color matrix is empty");
            return Err(Error::InvalidColorMatrix(0));
        }

        let index = self.crtc_index(crtc)?;
        let data = color::ctm_blob(matrix)?;

        let props = &mut self.crtcs[index];
        let Some(ctm) = props.ctm.as_mut() else {
            return match &self.internal {
                PlaneManagerInternal::Atomic(manager) => {
                    manager.set_color_correction_on_all_crtc_planes(&self.dev, &self.planes, index, crtc, &data)
                }
                PlaneManagerInternal::Legacy(manager) => {
                    manager.set_color_correction_on_all_crtc_planes(&self.dev, &self.planes, index, crtc, &data)
                }
            };
        };

        let blob = PropertyBlob::new(&self.dev, &data)?;
        ctm.value = blob.id();

        match &self.internal {
            PlaneManagerInternal::Atomic(manager) => manager.commit_color_matrix(&self.dev, props),
            PlaneManagerInternal::Legacy(manager) => manager.commit_color_matrix(&self.dev, props),
        }
    }

    /// Set the degamma and gamma curves of a crtc
    ///
    /// Curves are resampled to the lut sizes of the crtc, an empty curve resets the lut.
    #[instrument(level = "debug", parent = &self.span, skip(self, degamma, gamma))]
    pub fn set_gamma_correction(
        &mut self,
        crtc: crtc::Handle,
        degamma: &[LutEntry],
        gamma: &[LutEntry],
    ) -> Result<(), Error> {
        let index = self.crtc_index(crtc)?;
        let props = &mut self.crtcs[index];

        let degamma_size = match (props.degamma_lut, props.degamma_lut_size) {
            (Some(_), Some(size)) => size.value as usize,
            _ if degamma.is_empty() => 0,
            _ => {
                debug!("Degamma lut is not supported");
                return Err(Error::PropertyUnsupported {
                    handle: crtc.into(),
                    name: "DEGAMMA_LUT",
                });
            }
        };

        let gamma_size = match (props.gamma_lut, props.gamma_lut_size) {
            (Some(_), Some(size)) => size.value as usize,
            _ if gamma.is_empty() => 0,
            // without a gamma lut property, try the legacy gamma ramp
            _ if degamma.is_empty() => {
                debug!("Gamma lut is not supported, setting gamma ramp");
                return self.dev.set_gamma_ramp(crtc, gamma).map_err(|source| {
                    Error::Access(AccessError {
                        errmsg: "Failed to set gamma ramp",
                        dev: self.dev.dev_path(),
                        source,
                    })
                });
            }
            _ => {
                debug!("Gamma lut is not supported");
                return Err(Error::PropertyUnsupported {
                    handle: crtc.into(),
                    name: "GAMMA_LUT",
                });
            }
        };

        let degamma_blob = color::lut_blob(&color::resample_lut(degamma, degamma_size))
            .map(|data| PropertyBlob::new(&self.dev, &data))
            .transpose()?;
        let gamma_blob = color::lut_blob(&color::resample_lut(gamma, gamma_size))
            .map(|data| PropertyBlob::new(&self.dev, &data))
            .transpose()?;

        if let Some(prop) = props.degamma_lut.as_mut() {
            prop.value = degamma_blob.as_ref().map_or(0, PropertyBlob::id);
        }
        if let Some(prop) = props.gamma_lut.as_mut() {
            prop.value = gamma_blob.as_ref().map_or(0, PropertyBlob::id);
        }

        match &self.internal {
            PlaneManagerInternal::Atomic(manager) => manager.commit_gamma_correction(&self.dev, props),
            PlaneManagerInternal::Legacy(manager) => manager.commit_gamma_correction(&self.dev, props),
        }
    }
}
