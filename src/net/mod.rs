//! Async transport surface: the [`Socket`] abstraction, async connect, and
//! the serializing write queue.

mod socket;
mod write_queue;

pub use socket::{connect_async, Flush, Read, Shutdown, Socket, SocketIntoBox, WithSocket, Write};
pub use write_queue::WriteQueue;
