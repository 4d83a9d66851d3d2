//! Lifecycle controller: reload and graceful shutdown. Runs on the
//! single event-loop thread, so there is no need for the atomics/locks a
//! multi-threaded coordinator would require -- shutdown is just another
//! state transition the loop checks each iteration.

use crate::config::ServerConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Stopped,
}

pub struct Lifecycle {
    state: LifecycleState,
    config_path: PathBuf,
    shutdown_timeout: Duration,
}

impl Lifecycle {
    pub fn new(config_path: PathBuf, shutdown_timeout: Duration) -> Self {
        Self {
            state: LifecycleState::Running,
            config_path,
            shutdown_timeout,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// `SIGHUP`: re-read configuration. A parse/validation failure here is
    /// not fatal -- the caller keeps running on the previous config and
    /// just logs.
    pub fn reload(&self) -> Option<ServerConfig> {
        match ServerConfig::load(&self.config_path) {
            Ok(cfg) => {
                tracing::info!(path = %self.config_path.display(), "configuration reloaded");
                Some(cfg)
            }
            Err(e) => {
                tracing::warn!(path = %self.config_path.display(), error = %e, "reload failed, keeping previous configuration");
                None
            }
        }
    }

    /// `SIGINT`/`SIGTERM`: begin draining. Returns the deadline the event
    /// loop should arm as `SHUTDOWN_TIMEO` if connections remain after the
    /// initial sweep.
    pub fn begin_shutdown(&mut self) -> Duration {
        self.state = LifecycleState::Draining;
        self.shutdown_timeout
    }

    pub fn mark_stopped(&mut self) {
        self.state = LifecycleState::Stopped;
    }

    pub fn is_draining(&self) -> bool {
        self.state == LifecycleState::Draining
    }
}
