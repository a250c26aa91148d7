use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt, io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd},
    path::PathBuf,
};

use drm::{
    control::{
        atomic::AtomicModeReq, crtc, framebuffer, plane, property, AtomicCommitFlags, Device as ControlDevice,
        Event, PageFlipFlags,
    },
    ClientCapability, Device as BasicDevice,
};
use tracing::{debug, info, trace, warn};

use super::{AtomicRequest, DrmObject, EventMetadata, KmsDevice, PageFlipCallback, PlaneInfo, Time};
use crate::{
    backend::drm::color::{resample_lut, LutEntry},
    utils::{Buffer, Physical, Rectangle},
};

struct Fd<A: AsFd>(A);

impl<A: AsFd> AsFd for Fd<A> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}
impl<A: AsFd> BasicDevice for Fd<A> {}
impl<A: AsFd> ControlDevice for Fd<A> {}

struct PendingFlip {
    crtcs: Vec<crtc::Handle>,
    callback: PageFlipCallback,
}

/// Callbacks waiting for the completion events of their crtcs, oldest first
#[derive(Default)]
struct PendingFlips(VecDeque<PendingFlip>);

impl PendingFlips {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn push(&mut self, crtcs: &[crtc::Handle], callback: PageFlipCallback) {
        self.0.push_back(PendingFlip {
            crtcs: crtcs.to_vec(),
            callback,
        });
    }

    /// Account the completion event of `crtc`
    ///
    /// The event belongs to the oldest flip still waiting on that crtc. Returns its callback
    /// once every crtc of the flip completed.
    fn complete(&mut self, crtc: crtc::Handle) -> Option<PageFlipCallback> {
        let Some(idx) = self.0.iter().position(|flip| flip.crtcs.contains(&crtc)) else {
            warn!(?crtc, "Page-flip event without pending flip");
            return None;
        };

        let flip = &mut self.0[idx];
        flip.crtcs.retain(|pending| *pending != crtc);
        if flip.crtcs.is_empty() {
            self.0.remove(idx).map(|flip| flip.callback)
        } else {
            None
        }
    }
}

/// [`KmsDevice`] backed by an open drm device node
///
/// Completion events have to be read with [`DrmKmsDevice::dispatch_events`] once the
/// file descriptor becomes readable.
pub struct DrmKmsDevice<A: AsFd> {
    fd: Fd<A>,
    dev_path: Option<PathBuf>,
    pending: RefCell<PendingFlips>,
    sync_flips: Cell<bool>,
}

impl<A: AsFd> fmt::Debug for DrmKmsDevice<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmKmsDevice")
            .field("dev_path", &self.dev_path)
            .field("pending", &self.pending.borrow().len())
            .field("sync_flips", &self.sync_flips.get())
            .finish_non_exhaustive()
    }
}

impl<A: AsFd> AsFd for DrmKmsDevice<A> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl<A: AsFd> DrmKmsDevice<A> {
    /// Wrap an open drm device node
    pub fn new(fd: A) -> Self {
        let fd = Fd(fd);
        let dev_path = std::fs::read_link(format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd())).ok();
        info!(path = ?dev_path, "Opened kms device");
        DrmKmsDevice {
            fd,
            dev_path,
            pending: RefCell::new(PendingFlips::default()),
            sync_flips: Cell::new(false),
        }
    }

    /// Fire completion callbacks right away instead of waiting for kernel events
    pub fn set_sync_flips(&self, sync: bool) {
        self.sync_flips.set(sync);
    }

    /// Read pending page flip events and fire the callbacks whose flips completed
    ///
    /// Returns the number of events read.
    pub fn dispatch_events(&self) -> io::Result<usize> {
        let mut count = 0;
        for event in self.fd.receive_events()? {
            let Event::PageFlip(event) = event else {
                continue;
            };
            count += 1;
            trace!(crtc = ?event.crtc, frame = event.frame, "Got a page-flip event");

            let completed = self.pending.borrow_mut().complete(event.crtc);
            if let Some(callback) = completed {
                callback(EventMetadata {
                    time: Time::Monotonic(event.duration),
                    sequence: event.frame,
                });
            }
        }
        Ok(count)
    }

    fn queue(&self, crtcs: &[crtc::Handle], callback: PageFlipCallback) {
        if self.sync_flips.get() || crtcs.is_empty() {
            callback(EventMetadata {
                time: Time::Monotonic(Default::default()),
                sequence: 0,
            });
            return;
        }
        self.pending.borrow_mut().push(crtcs, callback);
    }
}

impl<A: AsFd> KmsDevice for DrmKmsDevice<A> {
    fn dev_path(&self) -> Option<PathBuf> {
        self.dev_path.clone()
    }

    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()> {
        self.fd.set_client_capability(cap, enable)
    }

    fn crtcs(&self) -> io::Result<Vec<crtc::Handle>> {
        Ok(self.fd.resource_handles()?.crtcs().to_vec())
    }

    fn planes(&self) -> io::Result<Vec<plane::Handle>> {
        self.fd.plane_handles()
    }

    fn plane_info(&self, handle: plane::Handle) -> io::Result<PlaneInfo> {
        let resources = self.fd.resource_handles()?;
        let info = self.fd.get_plane(handle)?;

        // the plane reports its crtcs as bitmask, keep the raw bits
        let crtcs = resources.filter_crtcs(info.possible_crtcs());
        let possible_crtcs = resources
            .crtcs()
            .iter()
            .enumerate()
            .filter(|(_, crtc)| crtcs.contains(crtc))
            .fold(0u32, |mask, (index, _)| mask | (1 << index));

        Ok(PlaneInfo {
            possible_crtcs,
            formats: info.formats().to_vec(),
        })
    }

    fn object_properties(&self, object: DrmObject) -> io::Result<Vec<(property::Handle, u64)>> {
        let props = match object {
            DrmObject::Crtc(crtc) => self.fd.get_properties(crtc)?,
            DrmObject::Plane(plane) => self.fd.get_properties(plane)?,
        };
        let (handles, values) = props.as_props_and_values();
        Ok(handles.iter().copied().zip(values.iter().copied()).collect())
    }

    fn property_name(&self, prop: property::Handle) -> io::Result<String> {
        let info = self.fd.get_property(prop)?;
        Ok(info.name().to_string_lossy().into_owned())
    }

    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        self.fd.get_property_blob(blob)
    }

    fn create_property_blob(&self, data: &[u8]) -> io::Result<u64> {
        let mut data = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.fd.as_fd(), &mut data)?;
        Ok(u64::from(blob.blob_id))
    }

    fn destroy_property_blob(&self, blob: u64) -> io::Result<()> {
        self.fd.destroy_property_blob(blob)
    }

    fn page_flip(
        &self,
        crtc: crtc::Handle,
        framebuffer: framebuffer::Handle,
        callback: PageFlipCallback,
    ) -> io::Result<()> {
        self.fd.page_flip(crtc, framebuffer, PageFlipFlags::EVENT, None)?;
        self.queue(&[crtc], callback);
        Ok(())
    }

    fn set_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        dst: Rectangle<i32, Physical>,
        src: Rectangle<u32, Buffer>,
    ) -> io::Result<()> {
        self.fd.set_plane(
            plane,
            crtc,
            framebuffer,
            0,
            (dst.loc.x, dst.loc.y, dst.size.w as u32, dst.size.h as u32),
            (src.loc.x, src.loc.y, src.size.w, src.size.h),
        )
    }

    fn set_object_property(&self, object: DrmObject, prop: property::Handle, value: u64) -> io::Result<()> {
        match object {
            DrmObject::Crtc(crtc) => self.fd.set_property(crtc, prop, value),
            DrmObject::Plane(plane) => self.fd.set_property(plane, prop, value),
        }
    }

    fn set_gamma_ramp(&self, crtc: crtc::Handle, lut: &[LutEntry]) -> io::Result<()> {
        let size = self.fd.get_crtc(crtc)?.gamma_length() as usize;
        if size == 0 {
            debug!(?crtc, "Crtc has no gamma ramp");
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        }

        let lut = resample_lut(lut, size);
        let red = lut.iter().map(|entry| entry.r).collect::<Vec<_>>();
        let green = lut.iter().map(|entry| entry.g).collect::<Vec<_>>();
        let blue = lut.iter().map(|entry| entry.b).collect::<Vec<_>>();
        self.fd.set_gamma(crtc, &red, &green, &blue)
    }

    fn commit_properties(
        &self,
        request: &AtomicRequest,
        flags: AtomicCommitFlags,
        crtcs: &[crtc::Handle],
        callback: Option<PageFlipCallback>,
    ) -> io::Result<()> {
        let mut req = AtomicModeReq::new();
        for &(object, prop, value) in request.properties() {
            req.add_raw_property(object, prop, value);
        }

        // the kernel rejects events for commits without crtcs
        let flags = if crtcs.is_empty() {
            flags - AtomicCommitFlags::PAGE_FLIP_EVENT
        } else {
            flags
        };
        self.fd.atomic_commit(flags, req)?;

        if let Some(callback) = callback {
            if !flags.contains(AtomicCommitFlags::TEST_ONLY) {
                self.queue(crtcs, callback);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use drm::control::{crtc, from_u32};

    use super::PendingFlips;
    use crate::backend::drm::device::{EventMetadata, PageFlipCallback, Time};

    fn crtc(id: u32) -> crtc::Handle {
        from_u32(id).unwrap()
    }

    fn recorder(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str) -> PageFlipCallback {
        let log = log.clone();
        Box::new(move |_| log.borrow_mut().push(name))
    }

    fn fire(pending: &mut PendingFlips, id: u32) {
        if let Some(callback) = pending.complete(crtc(id)) {
            callback(EventMetadata {
                time: Time::Monotonic(Default::default()),
                sequence: 0,
            });
        }
    }

    #[test]
    fn events_are_matched_by_crtc() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pending = PendingFlips::default();
        pending.push(&[crtc(100)], recorder(&log, "first"));
        pending.push(&[crtc(101)], recorder(&log, "second"));

        // the later flip completes first
        fire(&mut pending, 101);
        assert_eq!(*log.borrow(), vec!["second"]);
        fire(&mut pending, 100);
        assert_eq!(*log.borrow(), vec!["second", "first"]);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn callback_waits_for_every_crtc() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pending = PendingFlips::default();
        pending.push(&[crtc(100), crtc(101)], recorder(&log, "mirrored"));

        fire(&mut pending, 101);
        assert!(log.borrow().is_empty());
        // unknown crtcs do not count
        fire(&mut pending, 102);
        assert!(log.borrow().is_empty());
        fire(&mut pending, 100);
        assert_eq!(*log.borrow(), vec!["mirrored"]);
    }

    #[test]
    fn oldest_flip_of_a_crtc_completes_first() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pending = PendingFlips::default();
        pending.push(&[crtc(100)], recorder(&log, "first"));
        pending.push(&[crtc(100)], recorder(&log, "second"));

        fire(&mut pending, 100);
        assert_eq!(*log.borrow(), vec!["first"]);
        assert_eq!(pending.len(), 1);
    }
}
