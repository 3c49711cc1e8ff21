//! # molt-ecdysis
//!
//! Generation manager for molt, following the
//! [Cloudflare Ecdysis pattern](https://blog.cloudflare.com/ecdysis-rust-graceful-restarts/)
//! with one difference: the old process keeps running until its successor
//! declares itself ready, so the successor can pull live state from it.
//!
//! ## Overview
//!
//! 1. Listeners and live connections are registered with an [`Upgrader`]
//! 2. [`Upgrader::upgrade`] spawns the current binary with every registered fd
//!    duplicated into the range `3..N`
//! 3. The successor adopts them with [`Upgrader::from_env`] and, once it has
//!    restored what it needs, calls [`Upgrader::ready`]
//! 4. The readiness byte fires the old generation's exit token
//!
//! ## Environment Variables
//!
//! - `LISTEN_FDS`: Number of inherited file descriptors (starting at fd 3)
//! - `MOLT_FD_NAMES`: JSON array naming each inherited fd
//! - `MOLT_READY_FD`: Write end of the readiness pipe back to the parent
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt-ecdysis requires a Unix platform (Linux or macOS)");

mod error;
mod fds;
mod net;
mod spawn;
mod upgrader;

pub use error::UpgradeError;
pub use fds::{FdName, InheritedFds};
pub use net::{Listener, Network, Stream};
pub use upgrader::{Options, Upgrader};
