//! Hmdfs Core - Shared types, kernel wire protocol, and configuration
//!
//! This crate contains the foundational types used across the hmdfs daemon.
//! It has no dependencies on networking or kernel I/O code.

pub mod config;
pub mod error;
pub mod mount_args;
pub mod protocol;
pub mod types;

pub use config::{Config, KernelConfig, NetworkConfig, PeerEntry, TrustConfig, UserConfig};
pub use error::*;
pub use mount_args::{MountArgument, MountArgumentDescriptors};
pub use protocol::*;
pub use types::*;

/// Fixed size of a peer cid field in the kernel ABI
pub const CID_MAX_LEN: usize = 64;

/// Fixed size of a session master key in the kernel ABI
pub const KEY_MAX_LEN: usize = 32;

/// Fixed size of the hashed account field in the kernel ABI
pub const ACCOUNT_HASH_MAX_LEN: usize = 21;

/// Filesystem type passed to mount(2)
pub const HMDFS_FS_TYPE: &str = "hmdfs";

/// Default retry budget for outbound connection attempts
pub const MAX_RETRY_COUNT: u32 = 7;

/// Kernel control file poll tick in milliseconds
pub const POLL_TIMEOUT_MS: i32 = 200;
