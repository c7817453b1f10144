//! Classification of caller-supplied ids into concrete injection targets.
//!
//! The operator hands over one 32-bit number that is *either* a process id or
//! a thread id; which one is determined here, not declared by the caller.
//! Process ids win ties: if the number matches a live process, it is treated
//! as a process id and thread selection is deferred to the attachment
//! session's upgrade path.

use crate::system::SystemView;
use crate::{debug, Error, Result};

/// A validated, nonzero target identifier.
///
/// Zero is rejected at construction, before any OS call is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetId(u32);

impl TargetId {
    /// Wraps a raw id, rejecting zero with [`Error::InvalidInput`].
    pub fn new(raw: u32) -> Result<Self> {
        if raw == 0 {
            Err(Error::InvalidInput)
        } else {
            Ok(Self(raw))
        }
    }

    /// The raw numeric value.
    pub fn get(self) -> u32 {
        self.0
    }
}

/// The outcome of resolving a [`TargetId`] against the live system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// The id names a process; a concrete thread is still to be chosen.
    Process {
        /// The resolved process id.
        pid: u32,
    },
    /// The id names a thread owned by `owner`.
    Thread {
        /// The resolved thread id.
        tid: u32,
        /// Process id of the thread's owner.
        owner: u32,
    },
}

impl Resolved {
    /// The process that attachment will ultimately operate on.
    pub fn owner_pid(&self) -> u32 {
        match *self {
            Resolved::Process { pid } => pid,
            Resolved::Thread { owner, .. } => owner,
        }
    }
}

/// Determines whether `id` names a live process or a live thread.
///
/// Queries the enumeration collaborator only; mutates nothing. Fails with
/// [`Error::NotFound`] when the id matches neither.
pub fn resolve(view: &dyn SystemView, id: TargetId) -> Result<Resolved> {
    let raw = id.get();

    if view.processes()?.iter().any(|p| p.pid == raw) {
        debug!(pid = raw, "id resolved as process");
        return Ok(Resolved::Process { pid: raw });
    }

    if let Some(owner) = view.owner_of(raw)? {
        debug!(tid = raw, owner, "id resolved as thread");
        return Ok(Resolved::Thread { tid: raw, owner });
    }

    Err(Error::NotFound)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::system::{ProcessInfo, ThreadInfo};

    struct MockView {
        processes: Vec<ProcessInfo>,
        threads: Vec<ThreadInfo>,
        queries: Cell<u32>,
    }

    impl MockView {
        fn new(processes: Vec<(u32, &str)>, threads: Vec<(u32, u32)>) -> Self {
            Self {
                processes: processes
                    .into_iter()
                    .map(|(pid, name)| ProcessInfo {
                        pid,
                        name: name.into(),
                    })
                    .collect(),
                threads: threads
                    .into_iter()
                    .map(|(tid, owner)| ThreadInfo {
                        tid,
                        owner,
                        base_priority: 8,
                    })
                    .collect(),
                queries: Cell::new(0),
            }
        }
    }

    impl SystemView for MockView {
        fn processes(&self) -> Result<Vec<ProcessInfo>> {
            self.queries.set(self.queries.get() + 1);
            Ok(self.processes.clone())
        }

        fn threads_of(&self, pid: u32) -> Result<Vec<ThreadInfo>> {
            self.queries.set(self.queries.get() + 1);
            Ok(self.threads.iter().copied().filter(|t| t.owner == pid).collect())
        }

        fn owner_of(&self, tid: u32) -> Result<Option<u32>> {
            self.queries.set(self.queries.get() + 1);
            Ok(self.threads.iter().find(|t| t.tid == tid).map(|t| t.owner))
        }
    }

    #[test]
    fn zero_is_rejected_before_any_query() {
        let view = MockView::new(vec![(100, "worker.exe")], vec![(2004, 100)]);
        let err = TargetId::new(0).unwrap_err();
        assert!(matches!(err, Error::InvalidInput));
        assert_eq!(view.queries.get(), 0, "no enumeration may happen for id 0");
    }

    #[test]
    fn process_id_wins_over_thread_lookup() {
        let view = MockView::new(vec![(100, "worker.exe")], vec![(100, 7)]);
        let resolved = resolve(&view, TargetId::new(100).unwrap()).unwrap();
        assert_eq!(resolved, Resolved::Process { pid: 100 });
    }

    #[test]
    fn thread_id_resolves_to_its_owner() {
        let view = MockView::new(vec![(100, "worker.exe")], vec![(2004, 100)]);
        let resolved = resolve(&view, TargetId::new(2004).unwrap()).unwrap();
        assert_eq!(
            resolved,
            Resolved::Thread {
                tid: 2004,
                owner: 100
            }
        );
        assert_eq!(resolved.owner_pid(), 100);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let view = MockView::new(vec![(100, "worker.exe")], vec![(2004, 100)]);
        let err = resolve(&view, TargetId::new(31337).unwrap()).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }
}
