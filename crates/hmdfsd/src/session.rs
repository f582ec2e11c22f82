//! Session capability
//!
//! A session is one established transport link to a peer. The pool owns a
//! session from `hold_session` until release; the kernel talker only reads
//! its fd, key and cid when handing the socket to the kernel.

use std::os::unix::io::RawFd;

use hmdfsd_core::{LinkType, KEY_MAX_LEN};

pub trait Session: Send + Sync {
    /// True if the peer initiated this session
    fn is_from_server(&self) -> bool;

    /// Peer cid this session is bound to
    fn cid(&self) -> &str;

    /// Raw socket fd, suitable for handing to the kernel
    fn handle(&self) -> RawFd;

    /// Transport-level session id
    fn session_id(&self) -> i32;

    /// Session master key shared with the peer
    fn key(&self) -> &[u8; KEY_MAX_LEN];

    /// Link this session rides on
    fn link_type(&self) -> LinkType;

    /// Tear the transport link down
    fn release(&self);

    /// Stop delivering transport callbacks; the kernel owns the socket now
    fn disable_listener(&self);
}

impl std::fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cid", &self.cid())
            .field("fd", &self.handle())
            .field("id", &self.session_id())
            .field("link", &self.link_type())
            .field("from_server", &self.is_from_server())
            .finish()
    }
}
