/// Session state and event notification
///
/// This module tracks the debugger state machine and fans state changes,
/// stop notifications and resume signals out to registered callbacks.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use serde::{Serialize, Deserialize};
use tokio::sync::watch;

use crate::packet::Packet;
use crate::types::StopReply;

/// Current state of the debugging session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebuggerState {
    /// No connection to a stub
    Disconnected,
    /// The target is executing
    Running,
    /// The target is stopped and accepts inspection commands
    Halted,
    /// A connect/resume/break transition is in progress
    Busy,
}

impl std::fmt::Display for DebuggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DebuggerState::Disconnected => "disconnected",
            DebuggerState::Running => "running",
            DebuggerState::Halted => "halted",
            DebuggerState::Busy => "busy",
        };
        write!(f, "{}", s)
    }
}

/// A stop notification as handed to callbacks
#[derive(Debug, Clone)]
pub struct StopEvent {
    pub packet: Packet,
    /// `None` when the payload could not be parsed
    pub reply: Option<StopReply>,
}

type StopCallback = Arc<dyn Fn(&StopEvent) + Send + Sync>;
type ResumedCallback = Arc<dyn Fn() + Send + Sync>;
type StateCallback = Arc<dyn Fn(DebuggerState) + Send + Sync>;

/// State cell plus callback registry shared by a session and its tasks
pub struct SessionEvents {
    state: watch::Sender<DebuggerState>,
    stop_callbacks: Mutex<Vec<StopCallback>>,
    resumed_callbacks: Mutex<Vec<ResumedCallback>>,
    state_change_callbacks: Mutex<Vec<StateCallback>>,
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEvents {
    pub fn new() -> Self {
        let (state, _) = watch::channel(DebuggerState::Disconnected);
        Self {
            state,
            stop_callbacks: Mutex::new(Vec::new()),
            resumed_callbacks: Mutex::new(Vec::new()),
            state_change_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> DebuggerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DebuggerState> {
        self.state.subscribe()
    }

    /// Add stop notification callback
    pub fn on_stop<F>(&self, callback: F)
    where
        F: Fn(&StopEvent) + Send + Sync + 'static,
    {
        self.stop_callbacks.lock().unwrap().push(Arc::new(callback));
    }

    /// Add resume callback
    pub fn on_resumed<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.resumed_callbacks.lock().unwrap().push(Arc::new(callback));
    }

    /// Add state change callback
    pub fn on_state_changed<F>(&self, callback: F)
    where
        F: Fn(DebuggerState) + Send + Sync + 'static,
    {
        self.state_change_callbacks.lock().unwrap().push(Arc::new(callback));
    }

    /// Move to `state`, notifying observers if it differs from the current one
    pub fn set_state(&self, state: DebuggerState) {
        let mut previous = state;
        let changed = self.state.send_if_modified(|current| {
            previous = *current;
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });

        if changed {
            log::debug!("STATE: {} -> {}", previous, state);
            self.notify_state_changed(state);
        }
    }

    /// Move to `state` only if the current state is `expected`
    pub fn compare_and_set(&self, expected: DebuggerState, state: DebuggerState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == expected && expected != state {
                *current = state;
                true
            } else {
                false
            }
        });

        if changed {
            log::debug!("STATE: {} -> {}", expected, state);
            self.notify_state_changed(state);
        }
        changed
    }

    /// Wait until the state equals `target`, giving up after `timeout`
    pub async fn wait_for(&self, target: DebuggerState, timeout: Duration) -> bool {
        let mut receiver = self.subscribe();
        tokio::time::timeout(timeout, receiver.wait_for(|state| *state == target))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    pub fn notify_stop(&self, event: &StopEvent) {
        let callbacks = self.stop_callbacks.lock().unwrap().clone();
        for callback in &callbacks {
            callback(event);
        }
    }

    pub fn notify_resumed(&self) {
        let callbacks = self.resumed_callbacks.lock().unwrap().clone();
        for callback in &callbacks {
            callback();
        }
    }

    fn notify_state_changed(&self, state: DebuggerState) {
        let callbacks = self.state_change_callbacks.lock().unwrap().clone();
        for callback in &callbacks {
            callback(state);
        }
    }
}
