use std::{io, rc::Weak};

use drm::control::crtc;
use tracing::{debug, error, instrument, trace, warn};

use crate::{
    backend::drm::{
        device::{DrmObject, EventMetadata, KmsDevice},
        error::{AccessError, Error},
        overlay::OverlayPlane,
        plane::{HardwarePlane, PlaneType},
        CrtcController,
    },
    utils::{Buffer, Physical, Rectangle, Size, Transform},
};

use super::{CrtcProperties, LegacyOverlay, LegacyPageFlip, PlaneAssignmentList};

#[derive(Debug)]
pub(super) struct LegacyPlaneManager {
    span: tracing::Span,
}

impl LegacyPlaneManager {
    pub fn new(span: tracing::Span) -> Self {
        LegacyPlaneManager { span }
    }

    pub fn set_plane_data(
        &self,
        list: &mut PlaneAssignmentList,
        plane: &mut HardwarePlane,
        overlay: &OverlayPlane,
        crtc: crtc::Handle,
        src: Rectangle<u32, Buffer>,
        controller: &Weak<dyn CrtcController>,
    ) -> Result<(), Error> {
        // legacy calls can neither rotate nor flip
        if overlay.transform != Transform::Normal {
            return Err(Error::UnsupportedPlaneConfiguration(plane.id()));
        }
        if overlay.fence.is_some() {
            trace!(plane = plane.id(), "Ignoring fence, legacy calls cannot wait for it");
        }

        match list.legacy_page_flips.last_mut() {
            Some(flip) if flip.crtc == crtc => {
                let Some(handle) = plane.handle() else {
                    return Err(Error::UnsupportedPlaneConfiguration(plane.id()));
                };
                flip.overlays.push(LegacyOverlay {
                    plane: handle,
                    framebuffer: overlay.framebuffer(),
                    dst: overlay.display_bounds,
                    src,
                });
            }
            _ => list.legacy_page_flips.push(LegacyPageFlip {
                crtc,
                framebuffer: overlay.buffer.opaque_framebuffer(),
                controller: controller.clone(),
                overlays: Vec::new(),
            }),
        }
        plane.controller = Some(controller.clone());

        Ok(())
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, dev, planes, list))]
    pub fn commit<D: KmsDevice + ?Sized>(
        &self,
        dev: &D,
        planes: &mut [HardwarePlane],
        list: &mut PlaneAssignmentList,
        test_only: bool,
    ) -> Result<(), Error> {
        if test_only {
            // legacy devices cannot validate without applying
            for &idx in &list.plane_list {
                planes[idx].in_use = false;
            }
            list.plane_list.clear();
            list.legacy_page_flips.clear();
            return Ok(());
        }

        if list.plane_list.is_empty() {
            return Ok(());
        }

        // every call is applied on its own, so keep going and report the first failure
        let mut failure: Option<io::Error> = None;
        let mut record = |res: io::Result<()>, what: &str| match res {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to {}: {}", what, err);
                failure.get_or_insert(err);
                false
            }
        };

        let mut overlays = Vec::new();
        let mut failed_flips = Vec::new();
        for flip in list.legacy_page_flips.drain(..) {
            for overlay in &flip.overlays {
                let applied = record(
                    dev.set_plane(
                        overlay.plane,
                        flip.crtc,
                        Some(overlay.framebuffer),
                        overlay.dst,
                        overlay.src,
                    ),
                    "set overlay plane",
                );
                overlays.push((overlay.plane, applied));
            }

            let controller = flip.controller;
            let flipped = record(
                dev.page_flip(
                    flip.crtc,
                    flip.framebuffer,
                    Box::new(move |metadata: EventMetadata| {
                        if let Some(controller) = controller.upgrade() {
                            controller.on_page_flip(&metadata);
                        }
                    }),
                ),
                "page flip",
            );
            if !flipped {
                failed_flips.push(flip.crtc);
            }
        }

        // planes still scanned out after this commit, whether it failed or not
        let mut on_screen = Vec::new();
        for &idx in &list.old_plane_list {
            if list.plane_list.contains(&idx) {
                continue;
            }
            let plane = &mut planes[idx];
            if plane.plane_type() != PlaneType::Overlay {
                continue;
            }
            if let (Some(handle), Some(crtc)) = (plane.handle(), plane.owning_crtc()) {
                trace!(plane = plane.id(), "Disabling released plane");
                let disabled = record(
                    dev.set_plane(handle, crtc, None, Rectangle::zero(), Rectangle::zero()),
                    "disable overlay plane",
                );
                if !disabled {
                    on_screen.push(idx);
                    continue;
                }
            }
            plane.release();
        }

        let Some(source) = failure else {
            std::mem::swap(&mut list.plane_list, &mut list.old_plane_list);
            list.plane_list.clear();
            return Ok(());
        };

        // the calls that went through are not undone, keep tracking their planes
        for &idx in &list.plane_list {
            let plane = &mut planes[idx];
            let applied = match overlays.iter().find(|(handle, _)| plane.handle() == Some(*handle)) {
                Some((_, applied)) => *applied,
                None => plane
                    .owning_crtc()
                    .is_some_and(|crtc| !failed_flips.contains(&crtc)),
            };
            if applied || list.old_plane_list.contains(&idx) {
                on_screen.push(idx);
            } else {
                plane.release();
            }
        }
        for &idx in &on_screen {
            planes[idx].in_use = true;
        }
        debug!(planes = on_screen.len(), "Legacy commit partially applied");

        list.old_plane_list = on_screen;
        list.plane_list.clear();
        Err(Error::CommitRejected(AccessError {
            errmsg: "Legacy commit failed",
            dev: dev.dev_path(),
            source,
        }))
    }

    #[instrument(level = "debug", parent = &self.span, skip(self, dev, planes, list))]
    pub fn disable_overlay_planes<D: KmsDevice + ?Sized>(
        &self,
        dev: &D,
        planes: &mut [HardwarePlane],
        list: &mut PlaneAssignmentList,
    ) -> Result<(), Error> {
        let mut failure = None;
        for &idx in &list.old_plane_list {
            let plane = &mut planes[idx];
            if plane.plane_type() != PlaneType::Overlay {
                continue;
            }
            if let (Some(handle), Some(crtc)) = (plane.handle(), plane.owning_crtc()) {
                if let Err(err) = dev.set_plane(handle, crtc, None, Rectangle::zero(), Rectangle::zero()) {
                    error!(plane = plane.id(), "Failed to disable overlay plane: {}", err);
                    failure.get_or_insert(err);
                }
            }
            plane.release();
        }

        match failure {
            Some(source) => Err(Error::CommitRejected(AccessError {
                errmsg: "Failed to disable overlay planes",
                dev: dev.dev_path(),
                source,
            })),
            None => Ok(()),
        }
    }

    pub fn set_color_correction_on_all_crtc_planes<D: KmsDevice + ?Sized>(
        &self,
        _dev: &D,
        _planes: &[HardwarePlane],
        _crtc_index: usize,
        crtc: crtc::Handle,
        _ctm: &[u8],
    ) -> Result<(), Error> {
        let _guard = self.span.enter();
        debug!(?crtc, "Plane color matrices need atomic commits");
        Err(Error::PropertyUnsupported {
            handle: crtc.into(),
            name: "PLANE_CTM",
        })
    }

    pub fn validate_primary_size(&self, primary: &OverlayPlane, mode_size: Size<i32, Physical>) -> bool {
        // legacy page flips cannot scale the primary plane
        let valid = primary.display_bounds.size == mode_size;
        if !valid {
            let _guard = self.span.enter();
            warn!(
                size = ?primary.display_bounds.size,
                mode = ?mode_size,
                "Primary plane size does not match the mode"
            );
        }
        valid
    }

    pub fn commit_color_matrix<D: KmsDevice + ?Sized>(
        &self,
        dev: &D,
        props: &CrtcProperties,
    ) -> Result<(), Error> {
        let Some(ctm) = props.ctm else {
            return Ok(());
        };
        self.set_crtc_property(dev, props.crtc(), ctm.handle, ctm.value)
    }

    pub fn commit_gamma_correction<D: KmsDevice + ?Sized>(
        &self,
        dev: &D,
        props: &CrtcProperties,
    ) -> Result<(), Error> {
        for prop in [props.degamma_lut, props.gamma_lut].into_iter().flatten() {
            self.set_crtc_property(dev, props.crtc(), prop.handle, prop.value)?;
        }
        Ok(())
    }

    fn set_crtc_property<D: KmsDevice + ?Sized>(
        &self,
        dev: &D,
        crtc: crtc::Handle,
        prop: drm::control::property::Handle,
        value: u64,
    ) -> Result<(), Error> {
        dev.set_object_property(DrmObject::Crtc(crtc), prop, value)
            .map_err(|source| {
                let _guard = self.span.enter();
                error!(?crtc, "Failed to set crtc property: {}", source);
                Error::Access(AccessError {
                    errmsg: "Failed to set crtc property",
                    dev: dev.dev_path(),
                    source,
                })
            })
    }
}
