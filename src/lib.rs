//! multio is a multi-reactor ("one event loop per thread") TCP server
//! runtime.
//!
//! The base loop owns the acceptor; accepted sockets are handed round-robin
//! to a fixed pool of worker loops, and every operation on a connection
//! (reads, buffered writes, state transitions, teardown) is serialized on
//! the worker loop that owns it. Cross-thread interaction is limited to the
//! loops' task queues, so the runtime stays lock-light at tens of thousands
//! of concurrent connections.
//!
//! ```no_run
//! use multio::{EventLoop, ServerOption, TcpServer};
//!
//! let base_loop = EventLoop::new().unwrap();
//! let server = TcpServer::new(
//!     &base_loop,
//!     "0.0.0.0:7000".parse().unwrap(),
//!     "echo",
//!     ServerOption::NoReusePort,
//! )
//! .unwrap();
//! server.set_thread_num(3);
//! server.set_message_callback(|conn, buf, _receive_time| {
//!     let bytes = buf.retrieve_all_as_bytes();
//!     conn.send(&bytes);
//! });
//! server.start();
//! base_loop.run();
//! ```

mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod loop_thread;
pub mod metrics;
mod poller;
pub mod server;
mod socket;
pub mod thread;

pub use buffer::Buffer;
pub use connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle};
pub use loop_thread::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use server::{ServerOption, TcpServer};
