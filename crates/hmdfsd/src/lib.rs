//! Hmdfs Daemon - peer session management and kernel bridge
//!
//! This crate provides:
//! - Device lifecycle coordination against the platform device manager
//! - Per-link-type network agents with session admission control
//! - The binary control-channel bridge to the in-kernel hmdfs driver
//! - Mount lifecycle management for hmdfs instances
//!
//! # Architecture
//!
//! The key challenge is bridging the kernel's sync notification channel with
//! the async command processing of the agents:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Kernel poll thread (sync, one per mount)           │
//! │  poll(2) on the hmdfs control file, 200 ms tick             │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ actor command senders
//!                               │ (non-blocking post)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Tokio Runtime (async)                      │
//! │  - one actor task per network agent (FIFO commands)         │
//! │  - connect attempts offloaded to blocking tasks             │
//! │  - device manager fan-out                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Platform device callbacks post commands the same way, so all session
//! bookkeeping for one agent happens on that agent's own task.

pub mod actor;
pub mod device_manager;
pub mod devsl;
pub mod kernel_talker;
pub mod mount_manager;
pub mod mount_point;
pub mod network_agent;
pub mod platform;
pub mod session;
pub mod session_pool;
pub mod tcp_link;

pub use actor::{ActorHandle, Command};
pub use device_manager::{DeviceManagerAgent, DeviceManagerConfig};
pub use devsl::{DevslDispatcher, SECURITY_LEVEL_S1, SECURITY_LEVEL_S4};
pub use kernel_talker::KernelTalker;
pub use mount_manager::{GroupNotifier, MountManager};
pub use mount_point::{HmdfsMounter, MountInterface, MountPoint};
pub use network_agent::{AgentCmd, LinkProvider, NetworkAgent, NetworkAgentOps};
pub use session::Session;
pub use session_pool::SessionPool;
pub use tcp_link::{TcpLinkProvider, TcpSession};

/// Delay between retries of a failed actor command
pub const CMD_RETRY_DELAY_MS: u64 = 100;

/// A device's fuse-docs mount count at which the next unmount is real
pub const MOUNT_DFS_COUNT_ONE: u32 = 1;
