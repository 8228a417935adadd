//! Operator control surface.
//!
//! A background task polls the alert channel for `pause`, `resume` and
//! `shutdown` and applies them to the [`SharedSystemState`]. It never touches
//! vessels or experiments.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::system_state::SharedSystemState;
use crate::hardware::AlertPort;

/// Command an operator can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    Pause,
    Resume,
    Shutdown,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlCommand::Pause => "pause",
            ControlCommand::Resume => "resume",
            ControlCommand::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pause" => Ok(ControlCommand::Pause),
            "resume" => Ok(ControlCommand::Resume),
            "shutdown" | "stop" => Ok(ControlCommand::Shutdown),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

/// Drain pending commands once and apply them in arrival order.
///
/// Unknown text is logged and ignored. Returns how many commands were applied.
pub async fn poll_once(alerts: &dyn AlertPort, state: &SharedSystemState) -> usize {
    let messages = match alerts.poll_commands().await {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to poll operator commands");
            return 0;
        }
    };
    let mut applied = 0;
    for message in messages {
        match message.parse::<ControlCommand>() {
            Ok(command) => match state.apply(command) {
                Ok(_) => applied += 1,
                Err(e) => tracing::error!(%command, error = %e, "Failed to apply operator command"),
            },
            Err(reason) => tracing::debug!(%reason, "Ignoring operator message"),
        }
    }
    applied
}

/// Spawn the control poller. It runs until `stop` flips to `true` or its
/// sender is dropped.
pub fn spawn_control_poller(
    alerts: Arc<dyn AlertPort>,
    state: SharedSystemState,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!(interval_ms = interval.as_millis() as u64, "Control poller started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    poll_once(alerts.as_ref(), &state).await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Control poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockAlerts;
    use crate::scheduler::system_state::SystemState;
    use crate::store::SqliteStore;

    fn state() -> SharedSystemState {
        SharedSystemState::restore(Arc::new(SqliteStore::open_in_memory().unwrap())).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(" Pause ".parse::<ControlCommand>(), Ok(ControlCommand::Pause));
        assert_eq!("stop".parse::<ControlCommand>(), Ok(ControlCommand::Shutdown));
        assert!("hello".parse::<ControlCommand>().is_err());
    }

    #[tokio::test]
    async fn test_poll_once_applies_in_order() {
        let alerts = MockAlerts::new();
        let state = state();
        alerts.push_command("pause");
        alerts.push_command("what is the status");
        alerts.push_command("resume");
        assert_eq!(poll_once(&alerts, &state).await, 2);
        assert_eq!(state.get(), SystemState::Resume);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_picks_up_shutdown() {
        let alerts = Arc::new(MockAlerts::new());
        let state = state();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_control_poller(
            alerts.clone(),
            state.clone(),
            Duration::from_millis(100),
            stop_rx,
        );

        alerts.push_command("shutdown");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(state.get(), SystemState::Shutdown);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
