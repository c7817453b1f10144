//! Enumeration collaborator consumed by the resolver and the upgrade protocol.
//!
//! The engine never walks OS process tables itself; it consumes the
//! [`SystemView`] trait, which keeps the core testable against a mock and
//! keeps the Toolhelp32 plumbing in one place.

use crate::Result;

/// A live process, as reported by the enumeration snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Operating System process id.
    pub pid: u32,
    /// Executable image name (no path).
    pub name: String,
}

/// A live thread, as reported by the enumeration snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Operating System thread id.
    pub tid: u32,
    /// Process id of the owning process.
    pub owner: u32,
    /// Scheduler base priority at snapshot time.
    pub base_priority: i32,
}

/// Read-only view of the processes and threads currently alive on the system.
///
/// Implementations must not mutate OS state; every method is a pure query
/// over a point-in-time snapshot.
pub trait SystemView {
    /// All live processes, in stable enumeration order.
    fn processes(&self) -> Result<Vec<ProcessInfo>>;

    /// All threads owned by `pid`, in stable enumeration order.
    fn threads_of(&self, pid: u32) -> Result<Vec<ThreadInfo>>;

    /// The owning process of `tid`, or `None` if no such thread is alive.
    fn owner_of(&self, tid: u32) -> Result<Option<u32>>;
}

#[cfg(windows)]
pub use windows_impl::Snapshot;

#[cfg(windows)]
mod windows_impl {
    use std::mem::size_of;

    use windows_sys::Win32::Foundation::{GetLastError, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, Thread32First, Thread32Next,
        PROCESSENTRY32W, TH32CS_SNAPPROCESS, TH32CS_SNAPTHREAD, THREADENTRY32,
    };

    use super::{ProcessInfo, SystemView, ThreadInfo};
    use crate::os::OwnedHandle;
    use crate::{Error, Result};

    /// [`SystemView`] implementation over Toolhelp32 snapshots.
    ///
    /// Stateless: each query takes a fresh snapshot, so results always
    /// reflect the system at call time.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Snapshot;

    impl Snapshot {
        fn thread_entries(&self) -> Result<Vec<ThreadInfo>> {
            let raw = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
            if raw == INVALID_HANDLE_VALUE {
                return Err(Error::Win32("CreateToolhelp32Snapshot", unsafe {
                    GetLastError()
                }));
            }
            let snapshot = OwnedHandle::new(raw);

            let mut entry = THREADENTRY32 {
                dwSize: size_of::<THREADENTRY32>() as u32,
                ..unsafe { std::mem::zeroed() }
            };

            let mut threads = Vec::new();
            if unsafe { Thread32First(snapshot.raw(), &mut entry) } == 0 {
                return Err(Error::Win32("Thread32First", unsafe { GetLastError() }));
            }
            loop {
                threads.push(ThreadInfo {
                    tid: entry.th32ThreadID,
                    owner: entry.th32OwnerProcessID,
                    base_priority: entry.tpBasePri,
                });
                if unsafe { Thread32Next(snapshot.raw(), &mut entry) } == 0 {
                    break;
                }
            }
            Ok(threads)
        }
    }

    impl SystemView for Snapshot {
        fn processes(&self) -> Result<Vec<ProcessInfo>> {
            let raw = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
            if raw == INVALID_HANDLE_VALUE {
                return Err(Error::Win32("CreateToolhelp32Snapshot", unsafe {
                    GetLastError()
                }));
            }
            let snapshot = OwnedHandle::new(raw);

            let mut entry = PROCESSENTRY32W {
                dwSize: size_of::<PROCESSENTRY32W>() as u32,
                ..unsafe { std::mem::zeroed() }
            };

            let mut processes = Vec::new();
            if unsafe { Process32FirstW(snapshot.raw(), &mut entry) } == 0 {
                return Err(Error::Win32("Process32FirstW", unsafe { GetLastError() }));
            }
            loop {
                let len = entry
                    .szExeFile
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(entry.szExeFile.len());
                processes.push(ProcessInfo {
                    pid: entry.th32ProcessID,
                    name: String::from_utf16_lossy(&entry.szExeFile[..len]),
                });
                if unsafe { Process32NextW(snapshot.raw(), &mut entry) } == 0 {
                    break;
                }
            }
            Ok(processes)
        }

        fn threads_of(&self, pid: u32) -> Result<Vec<ThreadInfo>> {
            Ok(self
                .thread_entries()?
                .into_iter()
                .filter(|t| t.owner == pid)
                .collect())
        }

        fn owner_of(&self, tid: u32) -> Result<Option<u32>> {
            Ok(self
                .thread_entries()?
                .into_iter()
                .find(|t| t.tid == tid)
                .map(|t| t.owner))
        }
    }
}
