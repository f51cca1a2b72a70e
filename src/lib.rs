//! Stackful coroutines multiplexed onto a small pool of worker threads,
//! with an epoll reactor and deadline timers, so network code reads as
//! straight-line blocking calls while thousands of operations stay in
//! flight.
//!
//! The crate is built from four layers:
//!
//! - [Fibers](fiber): user-space coroutines with owned stacks and
//!   explicit, cooperative switching.
//! - [Scheduler](scheduler): an M:N dispatcher pulling fibers and
//!   closures off a shared FIFO, with optional pinning to one worker.
//! - [Timers](timer): a deadline heap with recurring and
//!   condition-guarded timers.
//! - [Reactor](io) plus the [blocking-call layer](hook) and
//!   [TCP primitives](net): descriptor readiness and timeouts turned
//!   into fiber parks.
//!
//! A minimal echo server:
//!
//! ```no_run
//! use std::io::{Read, Write};
//!
//! use filament::io::IoManager;
//! use filament::net::TcpListener;
//!
//! let io = IoManager::new(2, false, "echo").unwrap();
//! io.spawn(|| {
//!     let listener = TcpListener::bind("127.0.0.1:8020").unwrap();
//!     let (mut client, peer) = listener.accept().unwrap();
//!     log::info!("client from {}", peer);
//!     let mut buf = [0u8; 512];
//!     loop {
//!         match client.read(&mut buf) {
//!             Ok(0) | Err(_) => break,
//!             Ok(n) => {
//!                 if client.write_all(&buf[..n]).is_err() {
//!                     break;
//!                 }
//!             }
//!         }
//!     }
//! });
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod fd_state;
pub mod fiber;
pub mod hook;
pub mod io;
pub mod net;
pub mod scheduler;
pub mod timer;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
