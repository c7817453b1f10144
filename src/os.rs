//! Thin owned wrappers over the raw Win32 handle surface.
//!
//! Every native handle acquired by the engine lives in exactly one of these
//! types, whose `Drop` performs the corresponding release exactly once.
//! Higher layers never see a raw `HANDLE`.

use std::ffi::c_void;
use std::mem::size_of;
use std::ptr::{null, null_mut};

#[cfg(target_arch = "x86_64")]
use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_FULL_AMD64 as CONTEXT_FULL;
#[cfg(target_arch = "x86")]
use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_FULL_X86 as CONTEXT_FULL;

use windows_sys::Win32::{
    Foundation::{
        CloseHandle, GetLastError, ERROR_NOT_ALL_ASSIGNED, FALSE, HANDLE, INVALID_HANDLE_VALUE,
        LUID,
    },
    Security::{
        AdjustTokenPrivileges, LookupPrivilegeValueW, SE_DEBUG_NAME, SE_PRIVILEGE_ENABLED,
        TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
    },
    System::{
        Diagnostics::Debug::{GetThreadContext, SetThreadContext, WriteProcessMemory, CONTEXT},
        Memory::{
            VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE,
            MEM_RESERVE, PAGE_PROTECTION_FLAGS, PAGE_READWRITE, VIRTUAL_ALLOCATION_TYPE,
        },
        Threading::{
            GetCurrentProcess, OpenProcess, OpenProcessToken, OpenThread, ResumeThread,
            SuspendThread, PROCESS_ACCESS_RIGHTS, THREAD_ACCESS_RIGHTS,
        },
    },
};

use crate::{warn, Error, Result};

/// Wrapper to ensure handles are closed when they go out of scope.
pub(crate) struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub(crate) fn new(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(self.0) };
        }
    }
}

/// An open handle to the target process, scoped to memory operations.
pub(crate) struct ProcessHandle {
    handle: OwnedHandle,
    pid: u32,
}

impl ProcessHandle {
    pub(crate) fn open(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> Result<Self> {
        let handle = unsafe { OpenProcess(access, FALSE, pid) };
        if handle.is_null() {
            Err(Error::Win32("OpenProcess", unsafe { GetLastError() }))
        } else {
            Ok(Self {
                handle: OwnedHandle::new(handle),
                pid,
            })
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Reserves (without committing) `size` bytes of address space in the
    /// target, letting the OS pick the base address.
    pub(crate) fn reserve(&self, size: usize) -> Result<usize> {
        let addr =
            unsafe { VirtualAllocEx(self.handle.raw(), null(), size, MEM_RESERVE, PAGE_READWRITE) };
        if addr.is_null() {
            Err(Error::Win32("VirtualAllocEx", unsafe { GetLastError() }))
        } else {
            Ok(addr as usize)
        }
    }

    /// Commits `size` bytes at the fixed address `addr` inside an existing
    /// reservation.
    pub(crate) fn commit(&self, addr: usize, size: usize) -> Result<usize> {
        self.alloc_at(addr, size, MEM_COMMIT, PAGE_READWRITE)
    }

    fn alloc_at(
        &self,
        addr: usize,
        size: usize,
        kind: VIRTUAL_ALLOCATION_TYPE,
        protect: PAGE_PROTECTION_FLAGS,
    ) -> Result<usize> {
        let out = unsafe {
            VirtualAllocEx(
                self.handle.raw(),
                addr as *const c_void,
                size,
                kind,
                protect,
            )
        };
        if out.is_null() {
            Err(Error::Win32("VirtualAllocEx", unsafe { GetLastError() }))
        } else {
            Ok(out as usize)
        }
    }

    pub(crate) fn protect(
        &self,
        addr: usize,
        size: usize,
        protect: PAGE_PROTECTION_FLAGS,
    ) -> Result<()> {
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        let ok = unsafe {
            VirtualProtectEx(self.handle.raw(), addr as *const c_void, size, protect, &mut old)
        };
        if ok == 0 {
            Err(Error::Win32("VirtualProtectEx", unsafe { GetLastError() }))
        } else {
            Ok(())
        }
    }

    pub(crate) fn decommit(&self, addr: usize, size: usize) -> Result<()> {
        let ok =
            unsafe { VirtualFreeEx(self.handle.raw(), addr as *mut c_void, size, MEM_DECOMMIT) };
        if ok == 0 {
            Err(Error::Win32("VirtualFreeEx", unsafe { GetLastError() }))
        } else {
            Ok(())
        }
    }

    pub(crate) fn release(&self, base: usize) -> Result<()> {
        let ok = unsafe { VirtualFreeEx(self.handle.raw(), base as *mut c_void, 0, MEM_RELEASE) };
        if ok == 0 {
            Err(Error::Win32("VirtualFreeEx", unsafe { GetLastError() }))
        } else {
            Ok(())
        }
    }

    pub(crate) fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        let mut written: usize = 0;
        let ok = unsafe {
            WriteProcessMemory(
                self.handle.raw(),
                addr as *const c_void,
                data.as_ptr().cast(),
                data.len(),
                &mut written,
            )
        };
        if ok == 0 || written != data.len() {
            Err(Error::Win32("WriteProcessMemory", unsafe { GetLastError() }))
        } else {
            Ok(())
        }
    }
}

/// An open handle to the hijacked thread, scoped to suspend/context work.
pub(crate) struct ThreadHandle {
    handle: OwnedHandle,
    tid: u32,
}

impl ThreadHandle {
    pub(crate) fn open(tid: u32, access: THREAD_ACCESS_RIGHTS) -> Result<Self> {
        let handle = unsafe { OpenThread(access, FALSE, tid) };
        if handle.is_null() {
            Err(Error::Win32("OpenThread", unsafe { GetLastError() }))
        } else {
            Ok(Self {
                handle: OwnedHandle::new(handle),
                tid,
            })
        }
    }

    pub(crate) fn tid(&self) -> u32 {
        self.tid
    }

    /// Suspends the thread, returning the previous suspend count.
    pub(crate) fn suspend(&self) -> Result<u32> {
        let count = unsafe { SuspendThread(self.handle.raw()) };
        if count == u32::MAX {
            Err(Error::Win32("SuspendThread", unsafe { GetLastError() }))
        } else {
            Ok(count)
        }
    }

    /// Resumes the thread, returning the previous suspend count.
    pub(crate) fn resume(&self) -> Result<u32> {
        let count = unsafe { ResumeThread(self.handle.raw()) };
        if count == u32::MAX {
            Err(Error::Win32("ResumeThread", unsafe { GetLastError() }))
        } else {
            Ok(count)
        }
    }

    /// Captures the full register context. The thread must be suspended.
    pub(crate) fn context(&self) -> Result<CONTEXT> {
        let mut context: CONTEXT = unsafe { std::mem::zeroed() };
        context.ContextFlags = CONTEXT_FULL;

        let ok = unsafe { GetThreadContext(self.handle.raw(), &mut context) };
        if ok == 0 {
            Err(Error::Win32("GetThreadContext", unsafe { GetLastError() }))
        } else {
            Ok(context)
        }
    }

    /// Installs a full register context. The thread must be suspended.
    pub(crate) fn set_context(&self, context: &CONTEXT) -> Result<()> {
        let ok = unsafe { SetThreadContext(self.handle.raw(), context) };
        if ok == 0 {
            Err(Error::Win32("SetThreadContext", unsafe { GetLastError() }))
        } else {
            Ok(())
        }
    }
}

/// Enables `SeDebugPrivilege` on the current process token so that threads of
/// arbitrary processes can be opened.
///
/// Called once per attach. Failure is reported to the caller, who treats it
/// as non-fatal: directly accessible targets need no elevation.
pub(crate) fn enable_debug_privilege() -> Result<()> {
    unsafe {
        let mut token: HANDLE = null_mut();
        if OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        ) == 0
        {
            return Err(Error::Win32("OpenProcessToken", GetLastError()));
        }
        let token = OwnedHandle::new(token);

        let mut luid: LUID = std::mem::zeroed();
        if LookupPrivilegeValueW(null(), SE_DEBUG_NAME, &mut luid) == 0 {
            return Err(Error::Win32("LookupPrivilegeValueW", GetLastError()));
        }

        let mut privileges: TOKEN_PRIVILEGES = std::mem::zeroed();
        privileges.PrivilegeCount = 1;
        privileges.Privileges[0].Luid = luid;
        privileges.Privileges[0].Attributes = SE_PRIVILEGE_ENABLED;

        if AdjustTokenPrivileges(
            token.raw(),
            FALSE,
            &privileges,
            size_of::<TOKEN_PRIVILEGES>() as u32,
            null_mut(),
            null_mut(),
        ) == 0
        {
            return Err(Error::Win32("AdjustTokenPrivileges", GetLastError()));
        }

        // AdjustTokenPrivileges succeeds even when the privilege was not
        // actually granted; the real answer is in the last error.
        if GetLastError() == ERROR_NOT_ALL_ASSIGNED {
            warn!("SeDebugPrivilege not held; protected targets will be inaccessible");
            return Err(Error::Win32("AdjustTokenPrivileges", ERROR_NOT_ALL_ASSIGNED));
        }

        Ok(())
    }
}
