//! The remote memory stack: stage locally, commit remotely, bump forward.
//!
//! Payload bytes are written into a local staging buffer first and committed
//! into the target in one operation, so a thread already running past the
//! hijack point can never observe a half-written payload. Commits land at a
//! monotonically advancing high-water mark inside a single per-session
//! reservation, which keeps the remote footprint small, deterministic, and
//! reclaimable in one release at teardown.

use crate::{Error, Result};

/// Allocation granularity used for the remote high-water mark.
pub(crate) const PAGE_SIZE: usize = 0x1000;

/// Rounds `value` up to the next multiple of `align` (a power of two).
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// One payload's worth of staged bytes, plus its committed remote span once
/// pushed.
///
/// Created per payload, never reused across sessions. Dropping a region only
/// frees the local buffer; forgetting [`delete`](RemoteRegion::delete) after
/// a push leaks the committed span in the target until session teardown, and
/// is treated as a caller error.
#[derive(Debug)]
pub struct RemoteRegion {
    local: Vec<u8>,
    size: usize,
    remote: Option<RemoteSpan>,
}

/// A committed span inside the session's remote reservation.
#[derive(Debug, Clone, Copy)]
struct RemoteSpan {
    addr: usize,
    len: usize,
}

impl RemoteRegion {
    /// Reserves a zeroed local staging buffer of `size` bytes plus one
    /// trailing terminator byte.
    ///
    /// The terminator stays zero unless the caller overwrites it, so staged
    /// text is NUL-terminated by construction.
    pub fn create(size: usize) -> Result<Self> {
        let total = size.checked_add(1).ok_or(Error::AllocationFailed)?;
        let mut local = Vec::new();
        local
            .try_reserve_exact(total)
            .map_err(|_| Error::AllocationFailed)?;
        local.resize(total, 0);
        Ok(Self {
            local,
            size,
            remote: None,
        })
    }

    /// The caller-writable bytes, excluding the reserved terminator.
    pub fn local_mut(&mut self) -> &mut [u8] {
        &mut self.local[..self.size]
    }

    /// Remote address of the committed span, if this region was pushed.
    pub fn remote_addr(&self) -> Option<usize> {
        self.remote.map(|span| span.addr)
    }

    /// Commits the staged bytes (terminator included) into the target at the
    /// session's current high-water mark and returns the remote address.
    ///
    /// On failure the mark is left unchanged and the region stays unpushed.
    #[cfg(windows)]
    pub fn push(&mut self, session: &mut crate::session::Session) -> Result<usize> {
        if self.remote.is_some() {
            return Err(Error::Execution("region already pushed".into()));
        }

        let (process, stack) = match session.stack_parts() {
            Ok(parts) => parts,
            // A torn-down or failed session must reject the push as a state
            // error, not a commit error.
            Err(err @ Error::Execution(_)) => return Err(err),
            Err(err) => {
                crate::warn!(%err, "remote stack unavailable");
                return Err(Error::CommitFailed);
            }
        };
        let addr = stack.commit(process, &self.local).map_err(|err| {
            crate::warn!(%err, "remote commit failed");
            Error::CommitFailed
        })?;

        self.remote = Some(RemoteSpan {
            addr,
            len: self.local.len(),
        });
        crate::debug!(addr, len = self.local.len(), "payload committed");
        Ok(addr)
    }

    /// Releases the committed remote span (if any) and frees the local
    /// buffer. On a region that was never pushed this only frees the local
    /// buffer.
    #[cfg(windows)]
    pub fn delete(self, session: &mut crate::session::Session) {
        if let Some(span) = self.remote {
            if let Ok((process, stack)) = session.stack_parts() {
                stack.decommit(process, span.addr, span.len);
            }
        }
        // Local buffer drops here.
    }
}

#[cfg(windows)]
pub(crate) use windows_impl::RemoteStack;

#[cfg(windows)]
mod windows_impl {
    use windows_sys::Win32::System::Memory::PAGE_EXECUTE_READ;

    use super::{align_up, PAGE_SIZE};
    use crate::os::ProcessHandle;
    use crate::{debug, warn, Result};

    /// Two-byte `jmp $` used as the universal call's halt point.
    const HALT_GADGET: [u8; 2] = [0xEB, 0xFE];

    /// Per-session remote reservation with a bump watermark.
    ///
    /// Offset 0 holds one executable page with the halt gadget; payload
    /// commits start at the next page and only ever move upward.
    pub(crate) struct RemoteStack {
        base: usize,
        reserved: usize,
        watermark: usize,
    }

    impl RemoteStack {
        /// Reserves the slab and installs the halt gadget page.
        pub(crate) fn reserve(process: &ProcessHandle, size: usize) -> Result<Self> {
            let reserved = align_up(size.max(2 * PAGE_SIZE), PAGE_SIZE);
            let base = process.reserve(reserved)?;

            process.commit(base, PAGE_SIZE)?;
            process.write(base, &HALT_GADGET)?;
            process.protect(base, PAGE_SIZE, PAGE_EXECUTE_READ)?;

            debug!(base, reserved, "remote stack reserved");
            Ok(Self {
                base,
                reserved,
                watermark: PAGE_SIZE,
            })
        }

        /// Address the hijacked thread parks on after the requested call.
        pub(crate) fn halt_addr(&self) -> usize {
            self.base
        }

        /// Commits `bytes` at the watermark and advances it one page-aligned
        /// span. The watermark moves only on success.
        pub(crate) fn commit(&mut self, process: &ProcessHandle, bytes: &[u8]) -> Result<usize> {
            let span = align_up(bytes.len().max(1), PAGE_SIZE);
            let addr = self.base + self.watermark;
            if self.watermark + span > self.reserved {
                return Err(crate::Error::AllocationFailed);
            }

            process.commit(addr, bytes.len())?;
            process.write(addr, bytes)?;

            self.watermark += span;
            Ok(addr)
        }

        /// Returns a committed span's pages to the OS. The watermark is not
        /// rewound; the address space stays reserved until release.
        pub(crate) fn decommit(&mut self, process: &ProcessHandle, addr: usize, len: usize) {
            if let Err(err) = process.decommit(addr, len) {
                warn!(%err, addr, "remote decommit failed");
            }
        }

        /// Releases the whole reservation, gadget page included.
        pub(crate) fn release(self, process: &ProcessHandle) -> Result<()> {
            process.release(self.base)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_reserves_a_terminator_byte() {
        let mut region = RemoteRegion::create(5).unwrap();
        assert_eq!(region.local_mut().len(), 5);
        region.local_mut().copy_from_slice(b"abcde");
        // The staged buffer carries the terminator beyond the writable window.
        assert_eq!(region.local.len(), 6);
        assert_eq!(region.local[5], 0);
    }

    #[test]
    fn fresh_region_has_no_remote_address() {
        let region = RemoteRegion::create(8).unwrap();
        assert_eq!(region.remote_addr(), None);
    }

    #[test]
    fn create_rejects_overflowing_sizes() {
        let err = RemoteRegion::create(usize::MAX).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed));
    }

    #[test]
    fn align_up_is_monotone_and_page_granular() {
        assert_eq!(align_up(0, PAGE_SIZE), 0);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE + 1, PAGE_SIZE), 2 * PAGE_SIZE);
        assert_eq!(align_up(13, 16), 16);
    }
}
