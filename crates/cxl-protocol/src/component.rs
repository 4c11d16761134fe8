//! Runnable-component lifecycle shared by every actor in the fabric.
//!
//! A component moves `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! `run()` must be entered from `Stopped` and `stop()` from `Running`;
//! violations are configuration errors that leave the fabric untouched.
//! Components embed a [`ComponentState`] and drive it from their own
//! `run`/`stop` methods; `wait_for_ready` lets a parent sequence start-up.

use thiserror::Error;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("cannot run when it is not stopped")]
    NotStopped,
    #[error("cannot stop when it is not running")]
    NotRunning,
}

#[derive(Debug)]
pub struct ComponentState {
    tx: watch::Sender<ComponentStatus>,
}

impl ComponentState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ComponentStatus::Stopped);
        ComponentState { tx }
    }

    pub fn status(&self) -> ComponentStatus {
        *self.tx.borrow()
    }

    /// `Stopped -> Starting`, the entry gate of `run()`.
    pub fn begin_run(&self) -> Result<(), ComponentError> {
        let mut result = Ok(());
        self.tx.send_modify(|status| {
            if *status == ComponentStatus::Stopped {
                *status = ComponentStatus::Starting;
            } else {
                result = Err(ComponentError::NotStopped);
            }
        });
        result
    }

    /// `Running -> Stopping`, the entry gate of `stop()`.
    pub fn begin_stop(&self) -> Result<(), ComponentError> {
        let mut result = Ok(());
        self.tx.send_modify(|status| {
            if *status == ComponentStatus::Running {
                *status = ComponentStatus::Stopping;
            } else {
                result = Err(ComponentError::NotRunning);
            }
        });
        result
    }

    pub fn set_running(&self) {
        let _ = self.tx.send(ComponentStatus::Running);
    }

    /// Terminal transition. Must succeed regardless of how `run()` ended.
    pub fn set_stopped(&self) {
        let _ = self.tx.send(ComponentStatus::Stopped);
    }

    pub async fn wait_for(&self, target: ComponentStatus) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() == target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Awaits the `Running` state.
    pub async fn wait_for_ready(&self) {
        self.wait_for(ComponentStatus::Running).await;
    }

    /// Awaits the terminal `Stopped` state.
    pub async fn wait_for_stopped(&self) {
        self.wait_for(ComponentStatus::Stopped).await;
    }
}

impl Default for ComponentState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_transitions() {
        let state = ComponentState::new();
        assert_eq!(state.status(), ComponentStatus::Stopped);
        assert!(state.begin_stop().is_err());

        state.begin_run().unwrap();
        assert!(state.begin_run().is_err());
        state.set_running();

        let waiter = {
            let state = &state;
            async move { state.wait_for_ready().await }
        };
        waiter.await;

        state.begin_stop().unwrap();
        state.set_stopped();
        assert_eq!(state.status(), ComponentStatus::Stopped);
    }
}
