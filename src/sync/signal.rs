//! Multi-subscriber broadcast for server push events.

use std::sync::RwLock;

type Handler<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Append-only list of subscribers invoked synchronously by the
/// emitter, in subscription order. Handlers must not block; anything
/// slow belongs on a spawned task inside the handler.
pub struct Signal<T> {
    handlers: RwLock<Vec<Handler<T>>>,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Signal {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes `handler`. Duplicate subscriptions are allowed and
    /// each receives every emission.
    pub fn connect<F>(&self, handler: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.handlers.write().unwrap().push(Box::new(handler));
    }

    /// Delivers `event` to every subscriber.
    pub fn emit(&self, event: &T) {
        for handler in self.handlers.read().unwrap().iter() {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().unwrap().len()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Signal::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn every_subscriber_sees_every_emission() {
        let signal = Signal::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            signal.connect(move |n: &usize| {
                seen.fetch_add(*n, Ordering::SeqCst);
            });
        }
        signal.emit(&2);
        signal.emit(&5);
        assert_eq!(seen.load(Ordering::SeqCst), 3 * (2 + 5));
        assert_eq!(signal.subscriber_count(), 3);
    }

    #[test]
    fn duplicate_handlers_are_kept() {
        let signal: Signal<()> = Signal::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let handler = {
            let seen = seen.clone();
            move |_: &()| {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        };
        signal.connect(handler.clone());
        signal.connect(handler);
        signal.emit(&());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
