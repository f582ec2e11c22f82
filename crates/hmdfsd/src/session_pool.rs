//! Session admission control and reference counting
//!
//! The pool decides whether a freshly opened or offered session is kept,
//! and tracks how many kernel-visible links exist per (device, link-type)
//! pair so duplicate sockets are never sunk for the same pair and the
//! kernel-side offline notice is only sent when the last link goes away.
//!
//! All mutation happens on the owning agent's actor task (kernel poll
//! callbacks post commands instead of calling in), so a single plain mutex
//! suffices.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use hmdfsd_core::{LinkType, SessionError};

use crate::kernel_talker::KernelTalker;
use crate::platform::DeviceManagerSdk;
use crate::session::Session;

fn device_key(device_id: &str, link_type: LinkType) -> String {
    format!("{}_{}", device_id, link_type as u8)
}

#[derive(Default)]
struct PoolState {
    /// Live user-space sessions not yet released
    usr_space_session_pool: Vec<Arc<dyn Session>>,
    /// Kernel-occupied session slots
    occupy_session: HashMap<i32, LinkType>,
    /// (device, link) -> number of concurrently sunk sessions
    device_connect_count: HashMap<String, u32>,
    /// cid -> stable device id cache
    device_id_by_cid: HashMap<String, String>,
}

pub struct SessionPool {
    talker: Arc<KernelTalker>,
    device_sdk: Arc<dyn DeviceManagerSdk>,
    state: Mutex<PoolState>,
}

impl SessionPool {
    pub fn new(talker: Arc<KernelTalker>, device_sdk: Arc<dyn DeviceManagerSdk>) -> Self {
        Self {
            talker,
            device_sdk,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Record a session id the kernel reported as occupied, without taking
    /// ownership of a session object
    pub fn occupy_session(&self, session_id: i32, link_type: LinkType) {
        self.state.lock().occupy_session.insert(session_id, link_type);
    }

    pub fn find_session(&self, session_id: i32) -> bool {
        self.state.lock().occupy_session.contains_key(&session_id)
    }

    /// Admit a session: count the (device, link) reference, keep the session
    /// unless an equivalent link is already live, and hand the socket to the
    /// kernel either way.
    pub fn hold_session(
        &self,
        session: Arc<dyn Session>,
        back_stage: bool,
    ) -> Result<(), SessionError> {
        let cid = session.cid().to_string();
        let link_type = session.link_type();

        // Resolve outside the lock: the directory query is a platform call.
        let cached = self.state.lock().device_id_by_cid.get(&cid).cloned();
        let device_id = match cached {
            Some(id) => id,
            None => self.resolve_device_id(&cid),
        };

        let duplicate = {
            let mut state = self.state.lock();
            state.device_id_by_cid.insert(cid.clone(), device_id.clone());

            let duplicate = Self::device_connect_count_only(&mut state, &device_id, link_type);
            if duplicate {
                // A link to this device is already pooled; keeping a second
                // live session would leak it once the kernel adopts one fd.
                info!("duplicate {link_type} link to {device_id}, not pooling session");
            } else {
                state.usr_space_session_pool.push(Arc::clone(&session));
            }
            state
                .occupy_session
                .insert(session.session_id(), link_type);
            duplicate
        };

        debug!(
            "hold session cid {cid} device {device_id} link {link_type} duplicate {duplicate}"
        );
        self.talker.sink_session_to_kernel(session.as_ref(), back_stage)?;
        Ok(())
    }

    /// Release the pooled session owning `fd`. Returns the link type it was
    /// riding on, or `None` (with no state change) if no session matched.
    pub fn release_session(&self, fd: RawFd) -> Option<LinkType> {
        let mut state = self.state.lock();
        let idx = state
            .usr_space_session_pool
            .iter()
            .position(|s| s.handle() == fd)?;
        let session = state.usr_space_session_pool.remove(idx);
        let link_type = session.link_type();
        let cid = session.cid().to_string();

        state.occupy_session.remove(&session.session_id());
        Self::device_disconnect_count_only(&mut state, &cid, link_type, false);

        debug!("released session fd {fd} cid {cid} link {link_type}");
        Some(link_type)
    }

    /// Release every pooled session for `cid` on `link_type`; driven by
    /// device-offline events rather than a raw socket close. Returns the
    /// removed sessions (for the caller to close at the transport) and
    /// whether the last link is gone — only then should the kernel be told
    /// the peer is offline.
    pub fn release_session_by_cid(
        &self,
        cid: &str,
        link_type: LinkType,
        force_clear: bool,
    ) -> (Vec<Arc<dyn Session>>, bool) {
        let mut state = self.state.lock();

        let mut removed = Vec::new();
        state.usr_space_session_pool.retain(|s| {
            if s.cid() == cid && s.link_type() == link_type {
                removed.push(Arc::clone(s));
                false
            } else {
                true
            }
        });
        for session in &removed {
            state.occupy_session.remove(&session.session_id());
        }

        let last = Self::device_disconnect_count_only(&mut state, cid, link_type, force_clear);
        debug!(
            "released {} session(s) for cid {cid} link {link_type}, last {last}",
            removed.len()
        );
        (removed, last)
    }

    /// Empty the pool and the occupancy map. Does not notify the kernel;
    /// that stays the caller's call.
    pub fn release_all_session(&self) {
        let mut state = self.state.lock();
        let n = state.usr_space_session_pool.len();
        state.usr_space_session_pool.clear();
        state.occupy_session.clear();
        state.device_connect_count.clear();
        info!("released all {n} session(s)");
    }

    /// Current number of pooled user-space sessions
    pub fn session_count(&self) -> usize {
        self.state.lock().usr_space_session_pool.len()
    }

    /// Current (device, link) reference count
    pub fn device_connect_count(&self, device_id: &str, link_type: LinkType) -> u32 {
        self.state
            .lock()
            .device_connect_count
            .get(&device_key(device_id, link_type))
            .copied()
            .unwrap_or(0)
    }

    fn resolve_device_id(&self, cid: &str) -> String {
        match self.device_sdk.get_trusted_device_list() {
            Ok(devices) => {
                for device in devices {
                    if device.cid().map(|c| c == cid).unwrap_or(false) {
                        if let Some(udid) = device.udid() {
                            return udid.to_string();
                        }
                    }
                }
                warn!("cid {cid} not in the trusted device list, keying by cid");
                cid.to_string()
            }
            Err(e) => {
                warn!("trusted device list unavailable ({e}), keying by cid");
                cid.to_string()
            }
        }
    }

    /// Count one more link to (device, link). Returns true when a link was
    /// already live before this one — the caller must then skip pooling.
    fn device_connect_count_only(
        state: &mut PoolState,
        device_id: &str,
        link_type: LinkType,
    ) -> bool {
        let key = device_key(device_id, link_type);
        let count = state.device_connect_count.entry(key).or_insert(0);
        let duplicate = *count >= 1;
        *count += 1;
        duplicate
    }

    /// Count one link down. Returns true iff the count reaches zero (or
    /// `force_clear` is set), meaning the kernel-side offline notice should
    /// now actually be sent; the counter and the cid cache entry are erased
    /// then.
    fn device_disconnect_count_only(
        state: &mut PoolState,
        cid: &str,
        link_type: LinkType,
        force_clear: bool,
    ) -> bool {
        let device_id = state
            .device_id_by_cid
            .get(cid)
            .cloned()
            .unwrap_or_else(|| cid.to_string());
        let key = device_key(&device_id, link_type);

        let Some(count) = state.device_connect_count.get_mut(&key) else {
            return force_clear;
        };
        if force_clear || *count <= 1 {
            state.device_connect_count.remove(&key);
            state.device_id_by_cid.remove(cid);
            true
        } else {
            *count -= 1;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::RwLock;

    use hmdfsd_core::{
        config::PeerEntry, DeviceInfo, MountArgumentDescriptors, CID_MAX_LEN, KEY_MAX_LEN,
    };

    use crate::mount_point::MountPoint;
    use crate::platform::StaticPlatform;

    struct FakeSession {
        cid: String,
        fd: RawFd,
        id: i32,
        link: LinkType,
    }

    impl FakeSession {
        fn new(cid: &str, fd: RawFd, id: i32, link: LinkType) -> Arc<Self> {
            Arc::new(Self {
                cid: cid.into(),
                fd,
                id,
                link,
            })
        }
    }

    impl Session for FakeSession {
        fn is_from_server(&self) -> bool {
            false
        }
        fn cid(&self) -> &str {
            &self.cid
        }
        fn handle(&self) -> RawFd {
            self.fd
        }
        fn session_id(&self) -> i32 {
            self.id
        }
        fn key(&self) -> &[u8; KEY_MAX_LEN] {
            &[7u8; KEY_MAX_LEN]
        }
        fn link_type(&self) -> LinkType {
            self.link
        }
        fn release(&self) {}
        fn disable_listener(&self) {}
    }

    fn pool_fixture() -> (SessionPool, tempfile::NamedTempFile, Arc<MountPoint>) {
        let ctrl = tempfile::NamedTempFile::new().unwrap();
        let mut arg = MountArgumentDescriptors::alpha(100, "account");
        arg.ctrl_path_override = Some(ctrl.path().to_path_buf());
        let mp = Arc::new(MountPoint::new(arg));

        let talker = KernelTalker::new(
            Arc::downgrade(&mp),
            Arc::new(RwLock::new(DeviceInfo::new())),
            50,
            Box::new(|_| {}),
            Box::new(|_| {}),
        );

        let platform = Arc::new(StaticPlatform::new(
            "local",
            1,
            vec![PeerEntry {
                cid: "X".into(),
                device_id: "dev-x".into(),
                address: "127.0.0.1:1".into(),
                ..Default::default()
            }],
        ));

        (SessionPool::new(talker, platform), ctrl, mp)
    }

    #[test]
    fn test_duplicate_admission_keeps_one_session() {
        // Scenario: two sessions for the same cid, device and link
        let (pool, _ctrl, _mp) = pool_fixture();

        let a = FakeSession::new("X", 10, 1, LinkType::Ap);
        let b = FakeSession::new("X", 11, 2, LinkType::Ap);

        pool.hold_session(a, false).unwrap();
        pool.hold_session(b, false).unwrap();

        assert_eq!(pool.session_count(), 1);
        assert_eq!(pool.device_connect_count("dev-x", LinkType::Ap), 2);
        // both ids are kernel-occupied regardless of pooling
        assert!(pool.find_session(1));
        assert!(pool.find_session(2));
    }

    #[test]
    fn test_distinct_links_are_both_pooled() {
        let (pool, _ctrl, _mp) = pool_fixture();

        pool.hold_session(FakeSession::new("X", 10, 1, LinkType::Ap), false)
            .unwrap();
        pool.hold_session(FakeSession::new("X", 11, 2, LinkType::P2p), false)
            .unwrap();

        assert_eq!(pool.session_count(), 2);
        assert_eq!(pool.device_connect_count("dev-x", LinkType::Ap), 1);
        assert_eq!(pool.device_connect_count("dev-x", LinkType::P2p), 1);
    }

    #[test]
    fn test_release_unknown_fd_is_a_no_op() {
        let (pool, _ctrl, _mp) = pool_fixture();
        pool.hold_session(FakeSession::new("X", 10, 1, LinkType::Ap), false)
            .unwrap();

        assert_eq!(pool.release_session(999), None);
        assert_eq!(pool.session_count(), 1);
        assert_eq!(pool.device_connect_count("dev-x", LinkType::Ap), 1);
    }

    #[test]
    fn test_release_by_fd_balances_the_count() {
        let (pool, _ctrl, _mp) = pool_fixture();
        pool.hold_session(FakeSession::new("X", 10, 1, LinkType::Ap), false)
            .unwrap();

        assert_eq!(pool.release_session(10), Some(LinkType::Ap));
        assert_eq!(pool.session_count(), 0);
        assert_eq!(pool.device_connect_count("dev-x", LinkType::Ap), 0);
        assert!(!pool.find_session(1));
    }

    #[test]
    fn test_last_link_detection() {
        let (pool, _ctrl, _mp) = pool_fixture();
        pool.hold_session(FakeSession::new("X", 10, 1, LinkType::Ap), false)
            .unwrap();
        pool.hold_session(FakeSession::new("X", 11, 2, LinkType::Ap), false)
            .unwrap();

        // two counted links: a plain decrement is not the last one
        let (removed, last) = pool.release_session_by_cid("X", LinkType::Ap, false);
        assert_eq!(removed.len(), 1);
        assert!(!last);
        assert_eq!(pool.device_connect_count("dev-x", LinkType::Ap), 1);

        // the second decrement is
        let (_, last) = pool.release_session_by_cid("X", LinkType::Ap, false);
        assert!(last);
        assert_eq!(pool.device_connect_count("dev-x", LinkType::Ap), 0);
    }

    #[test]
    fn test_force_clear_short_circuits_the_count() {
        let (pool, _ctrl, _mp) = pool_fixture();
        pool.hold_session(FakeSession::new("X", 10, 1, LinkType::Ap), false)
            .unwrap();
        pool.hold_session(FakeSession::new("X", 11, 2, LinkType::Ap), false)
            .unwrap();

        let (removed, last) = pool.release_session_by_cid("X", LinkType::Ap, true);
        assert_eq!(removed.len(), 1);
        assert!(last);
        assert_eq!(pool.device_connect_count("dev-x", LinkType::Ap), 0);
        assert_eq!(pool.session_count(), 0);
    }

    #[test]
    fn test_release_all_sessions() {
        let (pool, _ctrl, _mp) = pool_fixture();
        pool.hold_session(FakeSession::new("X", 10, 1, LinkType::Ap), false)
            .unwrap();
        pool.hold_session(FakeSession::new("X", 11, 2, LinkType::P2p), false)
            .unwrap();
        pool.occupy_session(33, LinkType::Ap);

        pool.release_all_session();
        assert_eq!(pool.session_count(), 0);
        assert!(!pool.find_session(33));
        assert_eq!(pool.device_connect_count("dev-x", LinkType::Ap), 0);
    }

    #[test]
    fn test_unknown_cid_is_keyed_by_itself() {
        let (pool, _ctrl, _mp) = pool_fixture();
        pool.hold_session(FakeSession::new("stranger", 10, 1, LinkType::Ap), false)
            .unwrap();
        assert_eq!(pool.device_connect_count("stranger", LinkType::Ap), 1);
    }

    #[test]
    fn test_oversized_cid_surfaces_a_protocol_error() {
        let (pool, _ctrl, _mp) = pool_fixture();
        let big = "z".repeat(CID_MAX_LEN);
        let err = pool
            .hold_session(FakeSession::new(&big, 10, 1, LinkType::Ap), false)
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }
}
