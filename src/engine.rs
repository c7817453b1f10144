//! The engine handle: explicit lifecycle, no ambient globals.
//!
//! Everything that would otherwise be process-wide setup lives on an
//! [`Engine`] value, created with [`Engine::open`] and passed by reference to
//! the components it spawns. Closing the engine is explicit to mirror the
//! attach/detach pairing of the sessions it creates.

use std::time::Duration;

use crate::session::SelectionPolicy;

/// Tunables for attachment and remote execution.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ceiling on a single universal call; exceeding it fails the session
    /// with a timeout rather than hanging indefinitely.
    pub call_timeout: Duration,
    /// Granularity of the halt-point polling loop.
    pub poll_interval: Duration,
    /// Size of the per-session remote address-space reservation.
    pub remote_reserve: usize,
    /// Victim-thread selection policy for the upgrade protocol.
    pub selection: SelectionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            remote_reserve: 1 << 20,
            selection: SelectionPolicy::default(),
        }
    }
}

/// The top-level handle from which attachment sessions are created.
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    /// Opens an engine with the given configuration.
    pub fn open(config: EngineConfig) -> Self {
        Self { config }
    }

    /// The configuration sessions will inherit.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Attaches to the process or thread named by `raw_id`, resolving the id
    /// against a fresh system snapshot.
    ///
    /// Fails with [`Error::InvalidInput`](crate::Error::InvalidInput) for a
    /// zero id before any OS call is made.
    #[cfg(windows)]
    pub fn attach(&self, raw_id: u32) -> crate::Result<crate::Session> {
        let id = crate::resolve::TargetId::new(raw_id)?;
        self.attach_with_view(id, &crate::system::Snapshot)
    }

    /// Attaches using a caller-supplied enumeration view.
    #[cfg(windows)]
    pub fn attach_with_view(
        &self,
        id: crate::resolve::TargetId,
        view: &dyn crate::system::SystemView,
    ) -> crate::Result<crate::Session> {
        crate::Session::attach(&self.config, id, view)
    }

    /// Closes the engine. Sessions created from it keep working; this only
    /// consumes the handle.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_bounded() {
        let config = EngineConfig::default();
        assert!(config.call_timeout > Duration::ZERO);
        assert!(config.poll_interval > Duration::ZERO);
        assert!(config.poll_interval < config.call_timeout);
        assert!(config.remote_reserve >= 2 * 0x1000);
    }

    #[test]
    fn engine_open_close_roundtrip() {
        let engine = Engine::open(EngineConfig::default());
        assert_eq!(
            engine.config().remote_reserve,
            EngineConfig::default().remote_reserve
        );
        engine.close();
    }
}
