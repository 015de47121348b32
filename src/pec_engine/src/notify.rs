/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! One-shot notifications.
//!
//! Each interface keeps one [`Notification`] slot per direction: "command
//! ring has space" and "results are available". A slot is `Idle` or `Armed`
//! with a callback and a threshold. Firing takes the callback out and returns
//! the slot to `Idle` in one locked step; the callback itself runs after the
//! lock is dropped, so it may arm the slot again.
//!
//! A request whose condition already holds never arms the slot: the callback
//! is handed straight back to be run. Arming an armed slot replaces the
//! pending callback.

use alloc::boxed::Box;

use spin::Mutex;

/// Callback run when a notification fires.
pub type NotifyCallback = Box<dyn FnOnce() + Send>;

enum State {
    Idle,
    Armed {
        callback: NotifyCallback,
        threshold: usize,
    },
}

/// What [`Notification::request`] did with the callback.
pub(crate) enum Requested {
    /// The condition already holds. Run this callback now.
    Ready(NotifyCallback),
    /// The slot is armed.
    Armed,
}

pub(crate) struct Notification {
    state: Mutex<State>,
}

impl core::fmt::Debug for Notification {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Notification")
            .field("threshold", &self.threshold())
            .finish()
    }
}

impl Notification {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(State::Idle),
        }
    }

    /// Register `callback` for when the level reaches `threshold`.
    ///
    /// `level` is the current level, read by the caller just before.
    pub(crate) fn request(
        &self,
        callback: NotifyCallback,
        threshold: usize,
        level: usize,
    ) -> Requested {
        let (next, outcome) = if level >= threshold {
            (State::Idle, Requested::Ready(callback))
        } else {
            (
                State::Armed {
                    callback,
                    threshold,
                },
                Requested::Armed,
            )
        };

        // the newest request replaces any pending one, even when it fires now
        let previous = core::mem::replace(&mut *self.state.lock(), next);
        if let State::Armed { .. } = previous {
            log::debug!("pending notification replaced");
        }
        outcome
    }

    /// Disarm and return the callback if the slot is armed and `level` meets
    /// its threshold.
    pub(crate) fn take_if_ready(&self, level: usize) -> Option<NotifyCallback> {
        let mut state = self.state.lock();
        let ready = matches!(&*state, State::Armed { threshold, .. } if level >= *threshold);
        if !ready {
            return None;
        }

        match core::mem::replace(&mut *state, State::Idle) {
            State::Armed { callback, .. } => Some(callback),
            State::Idle => None,
        }
    }

    /// Threshold of the pending registration, if armed.
    pub(crate) fn threshold(&self) -> Option<usize> {
        match &*self.state.lock() {
            State::Armed { threshold, .. } => Some(*threshold),
            State::Idle => None,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.threshold().is_some()
    }

    /// Drop any pending registration without running it.
    pub(crate) fn clear(&self) {
        *self.state.lock() = State::Idle;
    }
}
