//! Transfer control service.
//!
//! A loopback HTTP plane through which a starting generation finds the one
//! it replaces and collects its servers' state:
//!
//! ```text
//! POST /hello    {"Generation": g} -> 200 {"Version": 1, "Generation": h}
//! POST /transfer {"Generation": g} -> 200 {"ServersTransferData": {..}, "Generation": h}
//!                                  -> 409 when g == h
//! ```

mod client;
mod server;
pub mod wire;

pub use client::ControlClient;
pub use server::ControlServer;
