#![forbid(unsafe_code)]
//! Asynchronous 9P2000.L client library for Rust.
//!
//! This crate provides a tokio-based client for the 9P2000.L protocol: it
//! negotiates a session with a remote server, multiplexes many outstanding
//! file handles (fids) over one connection, and maps POSIX-style operations
//! (stat, chown, chmod, extended attributes, remove, recursive remove)
//! onto protocol transactions.
//!
//! # Overview
//!
//! The 9P protocol was originally developed for the Plan 9 distributed
//! operating system. 9P2000.L is an extended variant that adds
//! Linux-specific features like numeric ownership, extended attributes and
//! other POSIX semantics; it is spoken by servers such as diod and by the
//! Linux kernel's v9fs client.
//!
//! # Getting Started
//!
//! 1. Establish a [`Session`] with [`connect`] (or [`Session::handshake`]
//!    over a transport you opened yourself)
//! 2. Obtain fid handles with [`Session::open`] or [`Session::walk`]
//! 3. Drive operations on the handles; release them with
//!    [`Fid::clunk`] or [`Fid::unlink`]
//!
//! # Example
//!
//! ```no_run
//! use c9p::{connect, Mode, OpenFlags, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> c9p::Result<()> {
//!     let mut session = connect("tcp!127.0.0.1!5640", SessionOptions::default()).await?;
//!
//!     let mut fid = session
//!         .open(
//!             "tmp/report",
//!             OpenFlags::RDWR | OpenFlags::CREATE,
//!             Mode::from_bits_truncate(0o644),
//!         )
//!         .await?;
//!     fid.chown(1000, 100).await?;
//!     fid.chmod(Mode::from_bits_truncate(0o640)).await?;
//!     fid.clunk().await?;
//!
//!     session.rmrf("tmp/scratch").await.map_err(|e| e.first)?;
//!     session.close().await
//! }
//! ```
//!
//! # Session Flow
//!
//! 1. **Version Negotiation**: the client sends `Tversion`, the server
//!    answers `Rversion` with the negotiated message size; an
//!    unrecognized version is fatal
//! 2. **Attach**: `Tattach` yields the root fid of the remote tree
//! 3. **Operations**: walks mint fids, each operation is a tagged
//!    transaction, replies may arrive in any order
//! 4. **Cleanup**: fids are clunked; closing the session clunks whatever
//!    is still live, best-effort
//!
//! # Concurrency
//!
//! One session owns one ordered byte stream; a single dispatcher task reads
//! it and resolves each tagged reply to its waiting caller. Distinct fid
//! handles may be driven concurrently; a single handle takes `&mut self`
//! because the protocol permits one in-flight transaction per fid.
//!
//! # Error Handling
//!
//! Server failures surface as [`Error::No`] with the Linux errno from the
//! `Rlerror` reply; see [`error::Error`] for the client-side taxonomy
//! (malformed messages, protocol violations, connection loss, closed
//! handles).
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`) and relies on
//! Rust's type system for memory safety.
pub mod client;
pub mod error;
pub mod fcall;
pub mod fid;
pub mod fsops;
pub mod serialize;
#[macro_use]
pub mod utils;

pub use crate::client::{Session, SessionOptions, connect};
pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::fcall::*;
pub use crate::fid::Fid;
pub use crate::fsops::RmrfError;
pub use crate::utils::Result;
