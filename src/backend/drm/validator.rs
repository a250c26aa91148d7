//! Overlay promotion
//!
//! Decides, through test-only commits, which compositor layers can be scanned out
//! directly by a hardware plane instead of being composited.

use std::{
    fmt,
    rc::{Rc, Weak},
};

use drm_fourcc::DrmFourcc;
use tracing::{debug, info_span, instrument, trace, warn};

use crate::{
    backend::drm::{
        device::KmsDevice,
        manager::{PlaneAssignmentList, PlaneManager},
        overlay::{OverlayPlane, ScanoutBuffer},
        CrtcController,
    },
    utils::{Buffer, Physical, Rectangle, Size, Transform},
};

/// Allocates buffers for test commits
pub trait ScanoutBufferGenerator {
    /// Error returned if an allocation fails
    type Error: std::error::Error;

    /// Allocate a buffer of `size` in `format`, registered as framebuffer
    fn create(&mut self, size: Size<i32, Buffer>, format: DrmFourcc) -> Result<Rc<dyn ScanoutBuffer>, Self::Error>;
}

/// Whether a layer can be promoted to a hardware plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayStatus {
    /// The layer can be scanned out directly
    Able,
    /// The layer has to be composited
    NotAble,
}

/// A compositor layer considered for promotion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayCheck {
    /// Size of the layer's buffer
    pub buffer_size: Size<i32, Buffer>,
    /// Format of the layer's buffer
    pub format: DrmFourcc,
    /// Destination on the crtc
    pub display_rect: Rectangle<i32, Physical>,
    /// Source rectangle, normalized to the buffer size
    pub crop_rect: Rectangle<f64, Buffer>,
    /// Stacking position, 0 is the primary plane
    pub z_order: i32,
    /// Transform applied by the plane
    pub transform: Transform,
    /// Layers that are no candidate are never promoted
    pub is_overlay_candidate: bool,
}

impl OverlayCheck {
    /// Candidate showing the whole buffer untransformed in `display_rect`
    pub fn new(
        buffer_size: impl Into<Size<i32, Buffer>>,
        format: DrmFourcc,
        display_rect: Rectangle<i32, Physical>,
        z_order: i32,
    ) -> Self {
        OverlayCheck {
            buffer_size: buffer_size.into(),
            format,
            display_rect,
            crop_rect: Rectangle::from_size((1.0, 1.0)),
            z_order,
            transform: Transform::Normal,
            is_overlay_candidate: true,
        }
    }

    fn is_full_frame(&self) -> bool {
        self.crop_rect == Rectangle::from_size((1.0, 1.0))
            && self.display_rect.size.w == self.buffer_size.w
            && self.display_rect.size.h == self.buffer_size.h
    }
}

/// Verdict for one [`OverlayCheck`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayCheckResult {
    /// Whether the layer can be promoted
    pub status: OverlayStatus,
    /// Format the layer should be scanned out with
    pub format: DrmFourcc,
}

fn is_yuv(format: DrmFourcc) -> bool {
    matches!(
        format,
        DrmFourcc::Uyvy | DrmFourcc::Yuyv | DrmFourcc::Nv12 | DrmFourcc::Yvu420
    )
}

fn opaque_format(format: DrmFourcc) -> DrmFourcc {
    match format {
        DrmFourcc::Argb8888 => DrmFourcc::Xrgb8888,
        DrmFourcc::Abgr8888 => DrmFourcc::Xbgr8888,
        format => format,
    }
}

/// Runs test commits for the crtcs a window is shown on
pub struct OverlayValidator<G: ScanoutBufferGenerator> {
    controllers: Vec<Weak<dyn CrtcController>>,
    generator: G,
    span: tracing::Span,
}

impl<G: ScanoutBufferGenerator> fmt::Debug for OverlayValidator<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayValidator")
            .field("controllers", &self.controllers.len())
            .finish_non_exhaustive()
    }
}

impl<G: ScanoutBufferGenerator> OverlayValidator<G> {
    /// Create a validator without any controller
    pub fn new(generator: G) -> Self {
        OverlayValidator {
            controllers: Vec::new(),
            generator,
            span: info_span!("drm_overlay_validator"),
        }
    }

    /// Add a crtc showing the window, mirrored crtcs are tested together
    pub fn add_controller(&mut self, controller: Weak<dyn CrtcController>) {
        self.controllers.push(controller);
    }

    /// Access the buffer generator
    pub fn generator_mut(&mut self) -> &mut G {
        &mut self.generator
    }

    /// Test which `candidates` can be promoted, in order
    ///
    /// Every promoted candidate stays part of the tested configuration, so later candidates
    /// are only promoted if they fit next to the earlier ones. The tests replace the frame
    /// currently on screen, so the planes committed through `live` are available to them.
    /// Buffers of `reusable` with a matching size and format are used before allocating new ones.
    #[instrument(level = "debug", parent = &self.span, skip_all, fields(candidates = candidates.len()))]
    pub fn test_page_flip<D: KmsDevice>(
        &mut self,
        manager: &mut PlaneManager<D>,
        live: &PlaneAssignmentList,
        candidates: &[OverlayCheck],
        reusable: &[OverlayPlane],
    ) -> Vec<OverlayCheckResult> {
        let controllers = self
            .controllers
            .iter()
            .filter_map(Weak::upgrade)
            .collect::<Vec<_>>();

        if controllers.is_empty() {
            debug!("No display controller, nothing can be promoted");
            return candidates
                .iter()
                .map(|candidate| OverlayCheckResult {
                    status: OverlayStatus::NotAble,
                    format: candidate.format,
                })
                .collect();
        }

        let mut taken = vec![false; reusable.len()];
        let mut test_list: Vec<OverlayPlane> = Vec::with_capacity(candidates.len());
        let mut results = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let format = Self::optimal_format(manager, candidate, &controllers);
            let mut result = OverlayCheckResult {
                status: OverlayStatus::NotAble,
                format,
            };

            if !candidate.is_overlay_candidate {
                results.push(result);
                continue;
            }

            let reused = reusable.iter().enumerate().find(|(idx, plane)| {
                !taken[*idx] && plane.buffer.size() == candidate.buffer_size && plane.buffer.format() == format
            });
            let buffer = match reused {
                Some((idx, plane)) => {
                    taken[idx] = true;
                    plane.buffer.clone()
                }
                None => match self.generator.create(candidate.buffer_size, format) {
                    Ok(buffer) => buffer,
                    Err(err) => {
                        warn!(?format, size = ?candidate.buffer_size, "Failed to allocate test buffer: {}", err);
                        results.push(result);
                        continue;
                    }
                },
            };

            test_list.push(OverlayPlane {
                buffer,
                z_order: candidate.z_order,
                transform: candidate.transform,
                display_bounds: candidate.display_rect,
                crop_rect: candidate.crop_rect,
                enable_blend: true,
                fence: None,
            });

            if Self::test_commit(manager, live, &test_list, &controllers) {
                result.status = OverlayStatus::Able;
            } else {
                trace!(z_order = candidate.z_order, "Candidate rejected");
                test_list.pop();
            }
            results.push(result);
        }

        results
    }

    fn test_commit<D: KmsDevice>(
        manager: &mut PlaneManager<D>,
        live: &PlaneAssignmentList,
        planes: &[OverlayPlane],
        controllers: &[Rc<dyn CrtcController>],
    ) -> bool {
        match manager.test_overlay_planes(live, planes, controllers) {
            Ok(()) => true,
            Err(err) => {
                trace!("Test commit failed: {}", err);
                false
            }
        }
    }

    fn optimal_format<D: KmsDevice>(
        manager: &PlaneManager<D>,
        candidate: &OverlayCheck,
        controllers: &[Rc<dyn CrtcController>],
    ) -> DrmFourcc {
        if is_yuv(candidate.format) {
            return candidate.format;
        }

        // scaled layers are cheaper to scan out in a packed format
        if !candidate.is_full_frame()
            && controllers.iter().all(|controller| {
                manager.is_format_supported(DrmFourcc::Uyvy, candidate.z_order, controller.crtc())
            })
        {
            return DrmFourcc::Uyvy;
        }

        opaque_format(candidate.format)
    }
}
