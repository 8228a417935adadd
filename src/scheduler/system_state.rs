//! Shared system state.
//!
//! Two writers touch the state: the control poller (operator commands) and the
//! scheduler (IDLE/BUSY bookkeeping). Every change is a read-modify-write under
//! one lock that also covers the store write, so a PAUSE or SHUTDOWN that lands
//! between the scheduler's read and write is never overwritten.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::control::ControlCommand;
use crate::error::SdlResult;
use crate::store::Store;

/// Lifecycle state of the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    Startup,
    Idle,
    Busy,
    /// Operator hold, honoured at the next checkpoint
    Pause,
    /// Operator released a hold
    Resume,
    Error,
    /// Operator asked the loop to stop
    Shutdown,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Startup => "startup",
            SystemState::Idle => "idle",
            SystemState::Busy => "busy",
            SystemState::Pause => "pause",
            SystemState::Resume => "resume",
            SystemState::Error => "error",
            SystemState::Shutdown => "shutdown",
        }
    }

    /// States written by the operator that the scheduler must not clobber.
    pub fn is_pending_signal(&self) -> bool {
        matches!(self, SystemState::Pause | SystemState::Shutdown)
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "startup" => Ok(SystemState::Startup),
            "idle" => Ok(SystemState::Idle),
            "busy" => Ok(SystemState::Busy),
            "pause" | "paused" => Ok(SystemState::Pause),
            "resume" => Ok(SystemState::Resume),
            "error" => Ok(SystemState::Error),
            "shutdown" => Ok(SystemState::Shutdown),
            other => Err(format!("unknown system state '{other}'")),
        }
    }
}

/// Cloneable handle to the persisted system state.
#[derive(Clone)]
pub struct SharedSystemState {
    inner: Arc<Mutex<SystemState>>,
    store: Arc<dyn Store>,
}

impl SharedSystemState {
    /// Restore from the store.
    ///
    /// A persisted PAUSE survives a restart; anything else starts fresh.
    pub fn restore(store: Arc<dyn Store>) -> SdlResult<Self> {
        let persisted = store.system_state()?;
        let initial = match persisted {
            Some(SystemState::Pause) => SystemState::Pause,
            Some(SystemState::Busy) => {
                tracing::warn!("Previous run ended while busy; starting fresh");
                SystemState::Startup
            }
            _ => SystemState::Startup,
        };
        store.set_system_state(initial, "restored at startup")?;
        tracing::info!(state = %initial, previous = ?persisted, "System state restored");
        Ok(Self {
            inner: Arc::new(Mutex::new(initial)),
            store,
        })
    }

    pub fn get(&self) -> SystemState {
        *self.inner.lock()
    }

    /// Unconditional write.
    pub fn set(&self, state: SystemState, note: &str) -> SdlResult<()> {
        let mut guard = self.inner.lock();
        self.store.set_system_state(state, note)?;
        let previous = *guard;
        if previous != state {
            tracing::info!(from = %previous, to = %state, note, "System state changed");
        }
        *guard = state;
        Ok(())
    }

    /// Scheduler bookkeeping write that yields to pending operator signals.
    ///
    /// Returns `false` when a PAUSE or SHUTDOWN is pending and nothing was written.
    pub fn set_activity(&self, state: SystemState, note: &str) -> SdlResult<bool> {
        let mut guard = self.inner.lock();
        if guard.is_pending_signal() {
            return Ok(false);
        }
        let previous = *guard;
        if previous != state {
            self.store.set_system_state(state, note)?;
            tracing::debug!(from = %previous, to = %state, "System activity changed");
            *guard = state;
        }
        Ok(true)
    }

    /// Apply an operator command, returning the resulting state.
    ///
    /// SHUTDOWN always wins and is never undone; RESUME only releases a PAUSE.
    pub fn apply(&self, command: ControlCommand) -> SdlResult<SystemState> {
        let mut guard = self.inner.lock();
        let previous = *guard;
        let next = match (command, previous) {
            (_, SystemState::Shutdown) => SystemState::Shutdown,
            (ControlCommand::Shutdown, _) => SystemState::Shutdown,
            (ControlCommand::Pause, _) => SystemState::Pause,
            (ControlCommand::Resume, SystemState::Pause) => SystemState::Resume,
            (ControlCommand::Resume, current) => current,
        };
        if next != previous {
            self.store
                .set_system_state(next, &format!("operator {command}"))?;
            tracing::info!(from = %previous, to = %next, %command, "Operator command applied");
            *guard = next;
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn shared() -> (Arc<SqliteStore>, SharedSystemState) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let state = SharedSystemState::restore(store.clone()).unwrap();
        (store, state)
    }

    #[test]
    fn test_fresh_start() {
        let (store, state) = shared();
        assert_eq!(state.get(), SystemState::Startup);
        assert_eq!(store.system_state().unwrap(), Some(SystemState::Startup));
    }

    #[test]
    fn test_activity_does_not_clobber_pause() {
        let (store, state) = shared();
        assert!(state.set_activity(SystemState::Busy, "run").unwrap());
        state.apply(ControlCommand::Pause).unwrap();
        assert!(!state.set_activity(SystemState::Idle, "done").unwrap());
        assert_eq!(state.get(), SystemState::Pause);
        assert_eq!(store.system_state().unwrap(), Some(SystemState::Pause));
    }

    #[test]
    fn test_resume_only_releases_pause() {
        let (_store, state) = shared();
        state.set(SystemState::Idle, "test").unwrap();
        assert_eq!(state.apply(ControlCommand::Resume).unwrap(), SystemState::Idle);
        state.apply(ControlCommand::Pause).unwrap();
        assert_eq!(
            state.apply(ControlCommand::Resume).unwrap(),
            SystemState::Resume
        );
    }

    #[test]
    fn test_shutdown_is_sticky() {
        let (_store, state) = shared();
        state.apply(ControlCommand::Shutdown).unwrap();
        assert_eq!(
            state.apply(ControlCommand::Resume).unwrap(),
            SystemState::Shutdown
        );
        assert_eq!(
            state.apply(ControlCommand::Pause).unwrap(),
            SystemState::Shutdown
        );
    }

    #[test]
    fn test_pause_survives_restart() {
        let (store, state) = shared();
        state.apply(ControlCommand::Pause).unwrap();
        let restored = SharedSystemState::restore(store).unwrap();
        assert_eq!(restored.get(), SystemState::Pause);
    }

    #[test]
    fn test_concurrent_commands_are_not_lost() {
        let (_store, state) = shared();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                std::thread::spawn(move || {
                    if i == 5 {
                        state.apply(ControlCommand::Shutdown).unwrap();
                    } else {
                        let _ = state.set_activity(SystemState::Busy, "worker").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(state.get(), SystemState::Shutdown);
    }
}
