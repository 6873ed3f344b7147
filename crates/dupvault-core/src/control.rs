use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dupvault_types::error::{DupError, Result};

/// Requested run state shared by every pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Run,
    /// Suspend at the next checkpoint until resumed.
    Pause,
    /// Finish accepted work, then exit.
    Stop,
    /// Exit at the next checkpoint.
    Terminate,
}

/// What a stage should do after a checkpoint returns. Never `Pause`:
/// [`TaskControl::checkpoint`] blocks until the pause is lifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Run,
    Stop,
    Terminate,
}

/// Cooperative four-state run control.
pub struct TaskControl {
    state: Mutex<ControlState>,
    changed: Condvar,
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControlState::Run),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, f: impl FnOnce(ControlState) -> ControlState) {
        let mut st = self.lock();
        *st = f(*st);
        self.changed.notify_all();
    }

    pub fn state(&self) -> ControlState {
        *self.lock()
    }

    pub fn pause(&self) {
        self.transition(|s| match s {
            ControlState::Run => ControlState::Pause,
            other => other,
        });
    }

    pub fn resume(&self) {
        self.transition(|s| match s {
            ControlState::Pause => ControlState::Run,
            other => other,
        });
    }

    /// Graceful stop. Overrides a pause; never downgrades a terminate.
    pub fn stop(&self) {
        self.transition(|s| match s {
            ControlState::Terminate => ControlState::Terminate,
            _ => ControlState::Stop,
        });
    }

    pub fn terminate(&self) {
        self.transition(|_| ControlState::Terminate);
    }

    /// Block while paused, then report the current flow.
    pub fn checkpoint(&self) -> Flow {
        let mut st = self.lock();
        loop {
            match *st {
                ControlState::Run => return Flow::Run,
                ControlState::Stop => return Flow::Stop,
                ControlState::Terminate => return Flow::Terminate,
                ControlState::Pause => {
                    st = self
                        .changed
                        .wait(st)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Checkpoint for stages that must not start new work after a stop.
    pub fn ensure_running(&self) -> Result<()> {
        match self.checkpoint() {
            Flow::Run => Ok(()),
            Flow::Stop | Flow::Terminate => Err(DupError::Canceled),
        }
    }

    /// Checkpoint for stages that finish accepted work on a bare stop.
    pub fn ensure_not_terminated(&self) -> Result<()> {
        match self.checkpoint() {
            Flow::Run | Flow::Stop => Ok(()),
            Flow::Terminate => Err(DupError::Canceled),
        }
    }

    /// Sleep for `dur`, waking early on terminate. Returns `Err(Canceled)` if
    /// terminated.
    pub fn sleep(&self, dur: Duration) -> Result<()> {
        let st = self.lock();
        let (st, _) = self
            .changed
            .wait_timeout_while(st, dur, |s| *s != ControlState::Terminate)
            .unwrap_or_else(PoisonError::into_inner);
        if *st == ControlState::Terminate {
            return Err(DupError::Canceled);
        }
        Ok(())
    }
}
