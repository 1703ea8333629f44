//! Concurrency primitives underpinning the frame multiplexer.

pub mod signal;
pub mod slot;
pub mod tickets;

pub use signal::Signal;
pub use slot::Slot;
pub use tickets::TicketPool;
