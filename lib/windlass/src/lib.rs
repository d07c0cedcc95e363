//! Single-file transfer over TCP: a framed, checksummed request/acknowledge
//! protocol between a blocking client and a readiness-driven server.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod client;
pub mod net;
pub mod pool;
pub mod server;

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 7071;

/// Consecutive protocol-level retries either peer tolerates before giving up
/// on a transfer.
pub const RETRY_BUDGET: u32 = 10;
