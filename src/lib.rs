//! # Threadjack
//!
//! **Threadjack** loads a DLL into a running process by hijacking the execution
//! context of one of its existing threads, instead of calling the far more
//! visible `CreateRemoteThread` primitive.
//!
//! ## Core Architecture
//!
//! The engine is a pipeline of small, single-owner components:
//!
//! **Resolver** $\to$ **Attachment Session** $\to$ (per payload) **Remote
//! Memory Stack** $\to$ **Universal Call** $\to$ **Teardown**.
//!
//! - The *resolver* classifies a caller-supplied numeric id as a process id or
//!   a thread id and locates the owning process.
//! - The *session* opens and suspends a hijackable thread, falling back to an
//!   upgrade protocol that scans the process for a suitable candidate.
//! - The *remote memory stack* stages bytes locally and commits them into the
//!   target at a monotonically advancing high-water mark.
//! - The *universal call* makes the suspended thread execute one function with
//!   one argument, collects the return value, and restores the thread's saved
//!   context verbatim so it resumes its original work untouched.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! # #[cfg(windows)]
//! # fn run() -> Result<(), threadjack::Error> {
//! use threadjack::{CallDescriptor, Engine, EngineConfig, RemoteRegion};
//!
//! let engine = Engine::open(EngineConfig::default());
//!
//! // 1. Attach to an existing thread (or any thread of a process).
//! let mut session = engine.attach(4321)?;
//!
//! // 2. Stage the DLL path and commit it into the target.
//! let path = br"C:\temp\payload.dll";
//! let mut region = RemoteRegion::create(path.len())?;
//! region.local_mut()[..path.len()].copy_from_slice(path);
//! let remote = region.push(&mut session)?;
//!
//! // 3. Run LoadLibraryA(remote) on the hijacked thread.
//! let load_library = threadjack::resolve_export("kernel32.dll", "LoadLibraryA")?;
//! let handle = session.invoke(&CallDescriptor::new(load_library, remote))?;
//! assert_ne!(handle, 0);
//!
//! // 4. Release everything; the thread resumes where it left off.
//! region.delete(&mut session);
//! session.detach()?;
//! engine.close();
//! # Ok(())
//! # }
//! ```

/// The universal call engine: one-argument remote calls on a hijacked thread.
pub mod call;
/// Engine handle, configuration, and lifecycle.
pub mod engine;
/// Error types for resolution, attachment, and remote execution failures.
pub mod error;
/// Resolution of well-known exports in the target's loaded system modules.
#[cfg(windows)]
pub mod exports;
/// The remote memory stack: local staging plus bump-committed target memory.
pub mod memory;
/// Low-level owned handle wrappers over the Win32 surface.
#[cfg(windows)]
pub(crate) mod os;
/// Classification of caller-supplied ids into process/thread targets.
pub mod resolve;
/// The attachment session state machine and thread-selection policy.
pub mod session;
/// Enumeration collaborator: processes, threads, and thread ownership.
pub mod system;

// Re-exports (Public API)
pub use call::CallDescriptor;
pub use engine::{Engine, EngineConfig};
pub use error::{Error, Result};
#[cfg(windows)]
pub use exports::resolve_export;
pub use memory::RemoteRegion;
pub use resolve::{Resolved, TargetId};
pub use session::SelectionPolicy;
#[cfg(windows)]
pub use session::Session;
pub use system::{ProcessInfo, SystemView, ThreadInfo};

// Re-export log macros for internal use across modules.
// This allows engine files to use `crate::debug!` regardless of the logging backend.
#[cfg(feature = "tracing")]
#[allow(unused_imports)]
pub(crate) use tracing::{debug, error, info, warn};

#[cfg(not(feature = "tracing"))]
mod stealth {
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }
}

#[cfg(not(feature = "tracing"))]
pub(crate) use stealth::*;
