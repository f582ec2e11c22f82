//! Error types for the hmdfs daemon

use thiserror::Error;

/// Errors from the kernel control-channel protocol layer
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("cid of {len} bytes does not fit the {max}-byte kernel field")]
    CopyOverflow { len: usize, max: usize },

    #[error("short read from control file: {got} of {want} bytes")]
    ShortRead { got: usize, want: usize },

    #[error("control file error: {0}")]
    ControlFile(String),

    #[error("unknown notify code {0}")]
    UnknownNotify(i32),
}

/// Errors from session admission and release
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("no trusted device found for cid {0}")]
    UnknownDevice(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors from the mount/unmount lifecycle
#[derive(Error, Debug)]
pub enum MountError {
    #[error("mount an empty/existent mountpoint {0}")]
    AlreadyMounted(String),

    #[error("umount an empty/non-existent mountpoint {0}")]
    NotMounted(String),

    #[error("no mountpoint for auth group {0}")]
    UnknownGroup(String),

    #[error("{syscall} failed on {path}: {source}")]
    Syscall {
        syscall: &'static str,
        path: String,
        source: std::io::Error,
    },
}

/// Errors from network agents and the device manager
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to open session to {cid}: {reason}")]
    OpenSession { cid: String, reason: String },

    #[error("link domain error: {0}")]
    Domain(String),

    #[error("mountpoint already joined a group: {0}")]
    GroupExists(String),

    #[error("mountpoint never joined a group: {0}")]
    GroupMissing(String),

    #[error("listener already registered for token {0}")]
    ListenerExists(u32),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Errors surfaced by platform collaborator SDKs
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("device manager call {call} failed with code {code}")]
    DeviceManager { call: &'static str, code: i32 },

    #[error("device profile unavailable for {0}")]
    ProfileUnavailable(String),

    #[error("storage manager call {call} failed with code {code}")]
    StorageManager { call: &'static str, code: i32 },

    #[error("security level query failed with code {0}")]
    SecurityLevel(i32),
}

/// Errors reading DeviceInfo fields before they are known
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceInfoError {
    #[error("cid has not been initialized")]
    CidNotInitialized,

    #[error("iid has not been initialized")]
    IidNotInitialized,
}
