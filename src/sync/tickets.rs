//! Bounded allocator of per-connection stream identifiers.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

use crate::error::{Error, Result};

/// Pool of free stream ids `0..n`.
///
/// `acquire` parks callers on a semaphore whose permit count always
/// equals the length of the free list (ids are pushed before permits
/// are added), so a granted permit is backed by an id. The semaphore's
/// FIFO queue keeps waiters from being starved under steady demand.
pub struct TicketPool {
    sem: Semaphore,
    free: Mutex<VecDeque<i16>>,
    closed: Mutex<Option<Error>>,
}

impl TicketPool {
    pub fn new(n: usize) -> Self {
        TicketPool {
            sem: Semaphore::new(n),
            free: Mutex::new((0..n as i16).collect()),
            closed: Mutex::new(None),
        }
    }

    /// Number of ids not currently lent out.
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Takes a free id, waiting until one is returned if all are lent
    /// out. Fails once the pool is closed.
    pub async fn acquire(&self) -> Result<i16> {
        match self.sem.acquire().await {
            Ok(permit) => {
                permit.forget();
                let id = self
                    .free
                    .lock()
                    .unwrap()
                    .pop_front()
                    .expect("semaphore permit without a free id");
                Ok(id)
            }
            Err(_) => Err(self.close_error()),
        }
    }

    /// Returns an id to the free set, waking one waiter.
    pub fn release(&self, id: i16) {
        if self.closed.lock().unwrap().is_some() {
            return;
        }
        self.free.lock().unwrap().push_back(id);
        self.sem.add_permits(1);
    }

    /// Closes the pool: blocked and future `acquire` calls fail with
    /// `err`.
    pub fn close(&self, err: Error) {
        let mut closed = self.closed.lock().unwrap();
        if closed.is_none() {
            *closed = Some(err);
            self.sem.close();
        }
    }

    fn close_error(&self) -> Error {
        self.closed
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Error::Internal("ticket pool closed".into()))
    }
}
