//! Single-shot rendezvous cell between a requester and the reader task.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{Error, Result};

enum State<T> {
    Empty,
    Filled(T),
    Closed(Error),
}

/// One-shot hand-off cell.
///
/// A single waiter parks in [`get`](Slot::get); the reader task
/// deposits with [`put`](Slot::put). [`close`](Slot::close) and
/// [`kill`](Slot::kill) release the waiter with an error and make the
/// cell permanently refuse deposits; a consumed cell is terminal too.
pub struct Slot<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Slot {
            state: Mutex::new(State::Empty),
            notify: Notify::new(),
        }
    }

    /// Deposits `value` for the waiter. Returns false when the slot no
    /// longer accepts deposits (closed by a timeout or teardown, or
    /// already filled) and the value was dropped.
    pub fn put(&self, value: T) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Empty => {
                *state = State::Filled(value);
                drop(state);
                self.notify.notify_waiters();
                true
            }
            State::Filled(_) | State::Closed(_) => false,
        }
    }

    /// Waits for a deposit. Fails if the slot is closed before or while
    /// waiting.
    pub async fn get(&self) -> Result<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state so a deposit
            // racing this check cannot be missed.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                match &*state {
                    State::Empty => {}
                    State::Closed(e) => return Err(e.clone()),
                    State::Filled(_) => {
                        let prev = std::mem::replace(
                            &mut *state,
                            State::Closed(Error::Internal("slot consumed".into())),
                        );
                        match prev {
                            State::Filled(v) => return Ok(v),
                            _ => unreachable!(),
                        }
                    }
                }
            }
            notified.await;
        }
    }

    /// Closes the slot with `err`: the pending and all future `get`s
    /// fail, subsequent `put`s are refused. Returns a deposited value
    /// that was never consumed, if any.
    pub fn close(&self, err: Error) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, State::Closed(_)) {
            return None;
        }
        let prev = std::mem::replace(&mut *state, State::Closed(err));
        drop(state);
        self.notify.notify_waiters();
        match prev {
            State::Filled(v) => Some(v),
            _ => None,
        }
    }

    /// Aborts the current waiter with `err`. Terminal like `close`; the
    /// distinct name marks call sites that time out one request rather
    /// than tear down the connection.
    pub fn kill(&self, err: Error) -> Option<T> {
        self.close(err)
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot::new()
    }
}
