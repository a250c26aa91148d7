use std::rc::Weak;

use drm::control::{crtc, AtomicCommitFlags};
use smallvec::SmallVec;
use tracing::{debug, error, instrument, trace};

use crate::{
    backend::drm::{
        device::{AtomicRequest, EventMetadata, KmsDevice, PageFlipCallback, PropertyBlob},
        error::{AccessError, Error},
        overlay::OverlayPlane,
        plane::{HardwarePlane, PlaneType},
        CrtcController,
    },
    utils::{Buffer, Physical, Rectangle, Size},
};

use super::{reset_current_plane_list, CrtcProperties, PlaneAssignmentList};

#[derive(Debug)]
pub(super) struct AtomicPlaneManager {
    span: tracing::Span,
}

#[inline]
fn same_controller(a: &Weak<dyn CrtcController>, b: &Weak<dyn CrtcController>) -> bool {
    a.as_ptr() as *const () == b.as_ptr() as *const ()
}

impl AtomicPlaneManager {
    pub fn new(span: tracing::Span) -> Self {
        AtomicPlaneManager { span }
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
        let (Some(handle), Some(props)) = (plane.handle(), plane.properties()) else {
            return Err(Error::UnsupportedPlaneConfiguration(plane.id()));
        };

        props.append_plane_state(
            &mut list.atomic_request,
            handle,
            crtc,
            overlay.framebuffer(),
            overlay.display_bounds,
            src,
            overlay.transform,
            overlay.fence.as_deref(),
        )?;
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
        // every crtc touched by the commit sends a completion event
        let mut crtcs: SmallVec<[crtc::Handle; 2]> = SmallVec::new();
        let mut touch = |crtc: Option<crtc::Handle>| {
            if let Some(crtc) = crtc.filter(|crtc| !crtcs.contains(crtc)) {
                crtcs.push(crtc);
            }
        };

        // detach the planes released since the last commit within the same transaction
        for &idx in &list.old_plane_list {
            if list.plane_list.contains(&idx) {
                continue;
            }
            let plane = &mut planes[idx];
            plane.in_use = false;
            if let (Some(handle), Some(props)) = (plane.handle(), plane.properties()) {
                trace!(plane = plane.id(), "Disabling released plane");
                props.append_reset_plane_state(&mut list.atomic_request, handle);
                touch(plane.owning_crtc());
            }
        }

        let mut controllers: SmallVec<[Weak<dyn CrtcController>; 2]> = SmallVec::new();
        for &idx in &list.plane_list {
            touch(planes[idx].owning_crtc());
            if let Some(controller) = planes[idx].controller.as_ref() {
                if !controllers.iter().any(|known| same_controller(known, controller)) {
                    controllers.push(controller.clone());
                }
            }
        }

        let flags = if test_only {
            for &idx in &list.plane_list {
                planes[idx].in_use = false;
            }
            AtomicCommitFlags::TEST_ONLY
        } else {
            std::mem::swap(&mut list.plane_list, &mut list.old_plane_list);
            AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK
        };

        let callback: Option<PageFlipCallback> = (!test_only).then(|| {
            Box::new(move |metadata: EventMetadata| {
                for controller in controllers.iter().filter_map(Weak::upgrade) {
                    controller.on_page_flip(&metadata);
                }
            }) as PageFlipCallback
        });

        if let Err(source) = dev.commit_properties(&list.atomic_request, flags, &crtcs, callback) {
            if test_only {
                debug!("Test commit failed: {}", source);
            } else {
                error!("Failed to commit properties for page flip: {}", source);
                std::mem::swap(&mut list.plane_list, &mut list.old_plane_list);
            }
            reset_current_plane_list(planes, list);
            return Err(Error::CommitRejected(AccessError {
                errmsg: "Atomic commit failed",
                dev: dev.dev_path(),
                source,
            }));
        }

        list.plane_list.clear();
        list.atomic_request.clear();
        Ok(())
    }

    #[instrument(level = "debug", parent = &self.span, skip(self, dev, planes, list))]
    pub fn disable_overlay_planes<D: KmsDevice + ?Sized>(
        &self,
        dev: &D,
        planes: &mut [HardwarePlane],
        list: &mut PlaneAssignmentList,
    ) -> Result<(), Error> {
        let mut req = AtomicRequest::new();
        for &idx in &list.old_plane_list {
            let plane = &mut planes[idx];
            if plane.plane_type() != PlaneType::Overlay {
                continue;
            }
            plane.release();
            if let (Some(handle), Some(props)) = (plane.handle(), plane.properties()) {
                props.append_reset_plane_state(&mut req, handle);
            }
        }

        let res = dev.commit_properties(&req, AtomicCommitFlags::NONBLOCK, &[], None);
        list.atomic_request.clear();
        res.map_err(|source| {
            error!("Failed to disable overlay planes: {}", source);
            Error::CommitRejected(AccessError {
                errmsg: "Failed to disable overlay planes",
                dev: dev.dev_path(),
                source,
            })
        })
    }

    pub fn set_color_correction_on_all_crtc_planes<D: KmsDevice + ?Sized>(
        &self,
        dev: &D,
        planes: &[HardwarePlane],
        crtc_index: usize,
        crtc: crtc::Handle,
        ctm: &[u8],
    ) -> Result<(), Error> {
        let _guard = self.span.enter();

        let targets = planes
            .iter()
            .filter(|plane| plane.can_use_for_crtc(crtc_index))
            .map(|plane| {
                match (plane.handle(), plane.properties().and_then(|props| props.plane_ctm)) {
                    (Some(handle), Some(prop)) => Ok((handle, prop)),
                    _ => {
                        debug!(plane = plane.id(), "Plane has no PLANE_CTM property");
                        Err(Error::PropertyUnsupported {
                            handle: crtc.into(),
                            name: "PLANE_CTM",
                        })
                    }
                }
            })
            .collect::<Result<Vec<_>, Error>>()?;
        if targets.is_empty() {
            debug!(?crtc, "No plane to set a color matrix on");
            return Err(Error::PropertyUnsupported {
                handle: crtc.into(),
                name: "PLANE_CTM",
            });
        }

        let blob = PropertyBlob::new(dev, ctm)?;
        let mut req = AtomicRequest::new();
        for (handle, prop) in targets {
            req.add_property(handle, prop, blob.id());
        }

        dev.commit_properties(&req, AtomicCommitFlags::NONBLOCK, &[], None)
            .map_err(|source| {
                error!(?crtc, "Failed to set plane color matrix: {}", source);
                Error::CommitRejected(AccessError {
                    errmsg: "Failed to set plane color matrix",
                    dev: dev.dev_path(),
                    source,
                })
            })
    }

    pub fn validate_primary_size(&self, _primary: &OverlayPlane, _mode_size: Size<i32, Physical>) -> bool {
        // scaling is validated by test commits
        true
    }

    pub fn commit_color_matrix<D: KmsDevice + ?Sized>(
        &self,
        dev: &D,
        props: &CrtcProperties,
    ) -> Result<(), Error> {
        let mut req = AtomicRequest::new();
        if let Some(ctm) = props.ctm {
            req.add_property(props.crtc(), ctm.handle, ctm.value);
        }
        self.commit_blocking(dev, &req, "Failed to set color matrix")
    }

    pub fn commit_gamma_correction<D: KmsDevice + ?Sized>(
        &self,
        dev: &D,
        props: &CrtcProperties,
    ) -> Result<(), Error> {
        let mut req = AtomicRequest::new();
        for prop in [props.degamma_lut, props.gamma_lut].into_iter().flatten() {
            req.add_property(props.crtc(), prop.handle, prop.value);
        }
        self.commit_blocking(dev, &req, "Failed to set gamma correction")
    }

    // color properties are applied right away, not with the next page flip
    fn commit_blocking<D: KmsDevice + ?Sized>(
        &self,
        dev: &D,
        req: &AtomicRequest,
        errmsg: &'static str,
    ) -> Result<(), Error> {
        let _guard = self.span.enter();
        dev.commit_properties(req, AtomicCommitFlags::empty(), &[], None)
            .map_err(|source| {
                error!("{}: {}", errmsg, source);
                Error::CommitRejected(AccessError {
                    errmsg,
                    dev: dev.dev_path(),
                    source,
                })
            })
    }
}
