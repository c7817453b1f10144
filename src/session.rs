//! The attachment session: owning a suspended target thread.
//!
//! Attachment runs a two-branch protocol. The *direct* branch opens and
//! suspends the thread named by the caller's id; it covers the case where the
//! id already is a thread id. When that fails (the id was a process, or the
//! thread cannot be suspended), the *upgrade* branch enumerates the resolved
//! process's threads, ranks them with a [`SelectionPolicy`], and takes the
//! first candidate that can be opened and suspended. Both branches end in the
//! same `Attached` state, so callers never learn which path won.
//!
//! A session moves `Attached -> Executing -> Attached` once per universal
//! call, and ends in `Detached` via [`Session::detach`], which is idempotent
//! and reached from every exit path, including `Failed`.

use crate::system::ThreadInfo;

/// Policy for picking a victim thread during the upgrade protocol.
///
/// The exact suitability heuristic is deliberately configurable rather than
/// hard-coded. The defaults are conservative: deterministic ascending
/// thread-id order, the primary thread demoted to last resort, and threads
/// running at time-critical priority excluded since they are the most likely
/// to sit inside scheduler-sensitive work.
#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    /// Demote the lowest thread id (in practice the primary thread) to the
    /// end of the candidate list instead of hijacking it first.
    pub avoid_primary: bool,
    /// Exclude threads whose snapshot base priority is at or above
    /// time-critical (15).
    pub skip_time_critical: bool,
    /// Upper bound on candidates attempted before giving up.
    pub max_candidates: usize,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            avoid_primary: true,
            skip_time_critical: true,
            max_candidates: 16,
        }
    }
}

/// Base priority of `THREAD_PRIORITY_TIME_CRITICAL` threads in a
/// normal-priority process.
const TIME_CRITICAL_PRIORITY: i32 = 15;

impl SelectionPolicy {
    /// Ranks candidate threads into deterministic attempt order.
    ///
    /// `exclude` removes a thread that was already tried (the failed direct
    /// branch); ordering is ascending thread id, which both stabilises the
    /// outcome across runs and acts as the documented tie-break.
    pub fn rank(&self, threads: &[ThreadInfo], exclude: Option<u32>) -> Vec<u32> {
        let mut candidates: Vec<u32> = threads
            .iter()
            .filter(|t| Some(t.tid) != exclude)
            .filter(|t| !self.skip_time_critical || t.base_priority < TIME_CRITICAL_PRIORITY)
            .map(|t| t.tid)
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        if self.avoid_primary && candidates.len() > 1 {
            candidates.rotate_left(1);
        }
        candidates.truncate(self.max_candidates);
        candidates
    }
}

#[cfg(windows)]
pub use windows_impl::Session;
#[cfg(windows)]
pub(crate) use windows_impl::State;

#[cfg(windows)]
mod windows_impl {
    use windows_sys::Win32::System::Threading::{
        PROCESS_VM_OPERATION, PROCESS_VM_WRITE, THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION,
        THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
    };

    use crate::engine::EngineConfig;
    use crate::memory::RemoteStack;
    use crate::os::{enable_debug_privilege, ProcessHandle, ThreadHandle};
    use crate::resolve::{resolve, Resolved, TargetId};
    use crate::system::SystemView;
    use crate::{debug, info, warn, Error, Result};

    /// Lifecycle of a [`Session`], enforced at runtime.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum State {
        Attached,
        Executing,
        Failed,
        Detached,
    }

    /// An exclusive attachment to one suspended thread of one target process.
    ///
    /// Owns every handle it wraps; dropping the session tears it down, but
    /// callers that care about teardown errors should call
    /// [`detach`](Session::detach) explicitly.
    pub struct Session {
        process: ProcessHandle,
        thread: ThreadHandle,
        pub(crate) state: State,
        pub(crate) stack: Option<RemoteStack>,
        pub(crate) config: EngineConfig,
        torn_down: bool,
    }

    impl Session {
        /// Attaches to the target named by `id`: direct branch first, then
        /// the upgrade protocol.
        pub(crate) fn attach(
            config: &EngineConfig,
            id: TargetId,
            view: &dyn SystemView,
        ) -> Result<Self> {
            let resolved = resolve(view, id)?;

            // One-shot elevation; not retried, and not fatal on its own:
            // directly accessible targets need no extra rights.
            if let Err(err) = enable_debug_privilege() {
                warn!(%err, "privilege acquisition failed, continuing");
            }

            let direct_tid = id.get();
            let thread = match Self::open_and_suspend(direct_tid) {
                Ok(thread) => {
                    info!(tid = direct_tid, "direct attach succeeded");
                    thread
                }
                Err(err) => {
                    debug!(%err, "direct attach failed, running upgrade");
                    Self::upgrade(config, &resolved, direct_tid, view)?
                }
            };

            let process = match ProcessHandle::open(
                resolved.owner_pid(),
                PROCESS_VM_OPERATION | PROCESS_VM_WRITE,
            ) {
                Ok(process) => process,
                Err(err) => {
                    warn!(%err, "target process could not be opened");
                    // Undo the suspension before the thread handle drops.
                    let _ = thread.resume();
                    return Err(Error::AttachFailed);
                }
            };

            info!(
                pid = process.pid(),
                tid = thread.tid(),
                "attached to suspended thread"
            );

            Ok(Self {
                process,
                thread,
                state: State::Attached,
                stack: None,
                config: config.clone(),
                torn_down: false,
            })
        }

        /// The upgrade protocol: enumerate the owner's threads, rank them,
        /// and take the first that can be opened and suspended.
        fn upgrade(
            config: &EngineConfig,
            resolved: &Resolved,
            already_tried: u32,
            view: &dyn SystemView,
        ) -> Result<ThreadHandle> {
            let pid = resolved.owner_pid();
            let threads = view.threads_of(pid).map_err(|err| {
                warn!(%err, pid, "thread enumeration failed");
                Error::UpgradeFailed
            })?;

            let candidates = config.selection.rank(&threads, Some(already_tried));
            debug!(pid, candidates = candidates.len(), "upgrade candidates ranked");

            for tid in candidates {
                match Self::open_and_suspend(tid) {
                    Ok(thread) => {
                        info!(tid, "upgrade selected thread");
                        return Ok(thread);
                    }
                    Err(err) => debug!(tid, %err, "candidate rejected"),
                }
            }

            Err(Error::AttachFailed)
        }

        fn open_and_suspend(tid: u32) -> Result<ThreadHandle> {
            let thread = ThreadHandle::open(
                tid,
                THREAD_SUSPEND_RESUME
                    | THREAD_GET_CONTEXT
                    | THREAD_SET_CONTEXT
                    | THREAD_QUERY_INFORMATION,
            )?;
            thread.suspend()?;
            Ok(thread)
        }

        /// Process id of the attached target.
        pub fn process_id(&self) -> u32 {
            self.process.pid()
        }

        /// Thread id of the hijacked thread.
        pub fn thread_id(&self) -> u32 {
            self.thread.tid()
        }

        pub(crate) fn process(&self) -> &ProcessHandle {
            &self.process
        }

        pub(crate) fn thread(&self) -> &ThreadHandle {
            &self.thread
        }

        /// Splits the session into the process handle and the lazily created
        /// remote stack, reserving the slab on first use.
        ///
        /// A `Failed` or `Detached` session has no teardown left to release a
        /// fresh reservation; remote memory work is refused outright.
        pub(crate) fn stack_parts(&mut self) -> Result<(&ProcessHandle, &mut RemoteStack)> {
            if !matches!(self.state, State::Attached | State::Executing) {
                return Err(Error::Execution("session is not attached".into()));
            }
            if self.stack.is_none() {
                self.stack = Some(RemoteStack::reserve(
                    &self.process,
                    self.config.remote_reserve,
                )?);
            }
            // Field-level split borrow: process is read-only here.
            Ok((&self.process, self.stack.as_mut().unwrap()))
        }

        pub(crate) fn mark_failed(&mut self) {
            self.state = State::Failed;
        }

        /// Tears the session down: releases outstanding remote memory, resumes
        /// the thread to its original scheduling state, and closes handles.
        ///
        /// Idempotent; reached from every exit path. Errors are reported but
        /// never mask the failure that triggered teardown.
        pub fn detach(&mut self) -> Result<()> {
            if self.torn_down {
                return Ok(());
            }
            self.torn_down = true;
            let parting_state = self.state;
            self.state = State::Detached;

            let mut first_err = None;

            if let Some(stack) = self.stack.take() {
                if let Err(err) = stack.release(&self.process) {
                    warn!(%err, "remote stack release failed during teardown");
                    first_err.get_or_insert(err);
                }
            }

            match self.thread.resume() {
                Ok(count) => debug!(
                    tid = self.thread.tid(),
                    previous_suspend_count = count,
                    "thread resumed"
                ),
                Err(err) => {
                    warn!(%err, "thread resume failed during teardown");
                    first_err.get_or_insert(err);
                }
            }

            debug!(?parting_state, "session detached");
            match first_err {
                None => Ok(()),
                Some(err) => Err(err),
            }
        }
    }

    impl Drop for Session {
        fn drop(&mut self) {
            if let Err(err) = self.detach() {
                warn!(%err, "teardown error discarded in drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(tid: u32, base_priority: i32) -> ThreadInfo {
        ThreadInfo {
            tid,
            owner: 100,
            base_priority,
        }
    }

    #[test]
    fn ranking_is_deterministic_and_ascending() {
        let policy = SelectionPolicy {
            avoid_primary: false,
            ..Default::default()
        };
        let threads = [thread(9, 8), thread(3, 8), thread(7, 8)];
        assert_eq!(policy.rank(&threads, None), vec![3, 7, 9]);
    }

    #[test]
    fn primary_thread_is_demoted_to_last_resort() {
        let policy = SelectionPolicy::default();
        let threads = [thread(3, 8), thread(7, 8), thread(9, 8)];
        assert_eq!(policy.rank(&threads, None), vec![7, 9, 3]);
    }

    #[test]
    fn already_tried_thread_is_excluded() {
        let policy = SelectionPolicy::default();
        let threads = [thread(3, 8), thread(7, 8)];
        assert_eq!(policy.rank(&threads, Some(7)), vec![3]);
    }

    #[test]
    fn time_critical_threads_are_skipped() {
        let policy = SelectionPolicy::default();
        let threads = [thread(3, 8), thread(7, 15), thread(9, 31)];
        assert_eq!(policy.rank(&threads, None), vec![3]);
    }

    #[test]
    fn candidate_count_is_bounded() {
        let policy = SelectionPolicy {
            avoid_primary: false,
            max_candidates: 2,
            ..Default::default()
        };
        let threads = [thread(1, 8), thread(2, 8), thread(3, 8)];
        assert_eq!(policy.rank(&threads, None), vec![1, 2]);
    }

    #[test]
    fn single_thread_is_still_a_candidate() {
        // With one thread there is nothing to prefer over it.
        let policy = SelectionPolicy::default();
        let threads = [thread(3, 8)];
        assert_eq!(policy.rank(&threads, None), vec![3]);
    }
}

#[cfg(all(test, windows))]
pub(crate) mod live_tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    use windows_sys::Win32::System::Threading::GetCurrentThreadId;

    use crate::memory::RemoteRegion;
    use crate::{Engine, EngineConfig, Error};

    /// A thread of this process that idles until told to finish, so the
    /// attachment path can be exercised against a real suspendable target.
    pub(crate) struct Victim {
        stop: Arc<AtomicBool>,
        handle: Option<std::thread::JoinHandle<()>>,
        pub(crate) tid: u32,
    }

    impl Victim {
        pub(crate) fn spawn() -> Self {
            let stop = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&stop);
            let (tx, rx) = mpsc::channel();
            let handle = std::thread::spawn(move || {
                tx.send(unsafe { GetCurrentThreadId() }).unwrap();
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(5));
                }
            });
            let tid = rx.recv().unwrap();
            Self {
                stop,
                handle: Some(handle),
                tid,
            }
        }

        /// The victim only joins if its original context was restored and the
        /// suspensions were balanced, so a clean finish doubles as a check on
        /// the teardown path.
        pub(crate) fn finish(mut self) {
            self.stop.store(true, Ordering::Relaxed);
            self.handle.take().unwrap().join().unwrap();
        }
    }

    #[test]
    fn detach_is_idempotent_and_resumes_once() {
        let victim = Victim::spawn();
        let engine = Engine::open(EngineConfig::default());
        let mut session = engine.attach(victim.tid).unwrap();
        assert_eq!(session.thread_id(), victim.tid);

        assert!(session.detach().is_ok());
        assert!(session.detach().is_ok());
        drop(session);

        victim.finish();
    }

    #[test]
    fn remote_staging_is_refused_after_teardown() {
        let victim = Victim::spawn();
        let engine = Engine::open(EngineConfig::default());
        let mut session = engine.attach(victim.tid).unwrap();
        session.detach().unwrap();

        let mut region = RemoteRegion::create(4).unwrap();
        region.local_mut().copy_from_slice(&[1, 2, 3, 4]);
        let err = region.push(&mut session).unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        // No fresh reservation may appear on a session with no teardown left.
        assert!(session.stack.is_none());

        victim.finish();
    }
}
