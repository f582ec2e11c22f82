//! Device security level resolution and gating
//!
//! A peer's devsl decides whether local paths may be exposed across the
//! trust boundary. Levels are cached per networkId; resolution failures are
//! treated as "not permitted" — the gate fails closed. The async variant
//! registers interested kernel talkers and sinks the resolved level to each
//! of them once the platform answers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::kernel_talker::KernelTalker;
use crate::platform::{DeviceManagerSdk, SecurityLabelStore, SecurityLevelSdk};

pub const SECURITY_LEVEL_S1: i32 = 1;
pub const SECURITY_LEVEL_S2: i32 = 2;
pub const SECURITY_LEVEL_S3: i32 = 3;
pub const SECURITY_LEVEL_S4: i32 = 4;

const LEVEL_UNKNOWN: i32 = -1;

pub struct DevslDispatcher {
    sec_sdk: Arc<dyn SecurityLevelSdk>,
    device_sdk: Arc<dyn DeviceManagerSdk>,
    label_store: Arc<dyn SecurityLabelStore>,
    /// networkId -> resolved devsl
    devsl_map: DashMap<String, i32>,
    /// udid -> networkId, for the async callback path
    id_map: Mutex<HashMap<String, String>>,
    /// udid -> talkers waiting for that device's level
    talkers_map: Mutex<HashMap<String, Vec<Weak<KernelTalker>>>>,
    weak_self: Weak<Self>,
}

impl DevslDispatcher {
    pub fn new(
        sec_sdk: Arc<dyn SecurityLevelSdk>,
        device_sdk: Arc<dyn DeviceManagerSdk>,
        label_store: Arc<dyn SecurityLabelStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sec_sdk,
            device_sdk,
            label_store,
            devsl_map: DashMap::new(),
            id_map: Mutex::new(HashMap::new()),
            talkers_map: Mutex::new(HashMap::new()),
            weak_self: weak.clone(),
        })
    }

    pub fn start(&self) -> Result<(), hmdfsd_core::PlatformError> {
        self.sec_sdk.on_start()
    }

    pub fn stop(&self) {
        self.sec_sdk.on_stop();
    }

    /// Security level of a local path from its label, `-1` when unlabeled
    /// or unknown
    pub fn get_security_label(&self, path: &str) -> i32 {
        if path.is_empty() {
            warn!("empty path has no security label");
            return LEVEL_UNKNOWN;
        }
        match self.label_store.security_label(path).as_deref() {
            Some("s1") => SECURITY_LEVEL_S1,
            Some("s2") => SECURITY_LEVEL_S2,
            Some("s3") => SECURITY_LEVEL_S3,
            Some("s4") => SECURITY_LEVEL_S4,
            Some(other) => {
                warn!("unrecognized security label {other} on {path}");
                LEVEL_UNKNOWN
            }
            None => LEVEL_UNKNOWN,
        }
    }

    /// Resolve a peer's devsl, cache-first; `-1` on any failure
    pub fn get_device_devsl(&self, network_id: &str) -> i32 {
        if network_id.is_empty() {
            warn!("empty networkId has no devsl");
            return LEVEL_UNKNOWN;
        }
        if let Some(level) = self.devsl_map.get(network_id) {
            debug!("devsl for {network_id} cached: {}", *level);
            return *level;
        }

        let udid = match self.device_sdk.get_udid_by_network_id(network_id) {
            Ok(udid) => udid,
            Err(e) => {
                warn!("udid lookup for {network_id} failed: {e}");
                return LEVEL_UNKNOWN;
            }
        };
        match self.sec_sdk.get_highest_sec_level(&udid) {
            Ok(level) => {
                let level = level as i32;
                self.devsl_map.insert(network_id.to_string(), level);
                level
            }
            Err(e) => {
                warn!("devsl query for {network_id} failed: {e}");
                LEVEL_UNKNOWN
            }
        }
    }

    /// May `paths` be exposed to `peer_network_id`? True only when the
    /// peer's devsl is at or above every path's label; any failure along
    /// the way denies.
    pub fn compare_devsl_with_local(&self, peer_network_id: &str, paths: &[String]) -> bool {
        if paths.is_empty() {
            return false;
        }
        let remote = self.get_device_devsl(peer_network_id);
        if remote < 0 {
            error!("devsl for {peer_network_id} unresolved, denying");
            return false;
        }
        for path in paths {
            let label = self.get_security_label(path);
            if label < 0 {
                error!("no label for {path}, denying");
                return false;
            }
            if remote < label {
                error!("devsl {remote} below label {label} for {path}, denying");
                return false;
            }
        }
        true
    }

    /// Register a talker to receive the peer's level once resolved
    /// off-thread; the level is sunk to every registered talker and the
    /// registration dropped.
    pub fn devsl_get_register(&self, cid: &str, talker: Weak<KernelTalker>) {
        let udid = match self.device_sdk.get_udid_by_network_id(cid) {
            Ok(udid) => udid,
            Err(e) => {
                warn!("udid lookup for {cid} failed, not registering: {e}");
                return;
            }
        };

        {
            let mut id_map = self.id_map.lock();
            let mut talkers = self.talkers_map.lock();
            id_map.insert(udid.clone(), cid.to_string());
            talkers.entry(udid.clone()).or_default().push(talker);
        }

        let weak = self.weak_self.clone();
        let result = self.sec_sdk.get_highest_sec_level_async(
            &udid,
            Box::new(move |udid, result| {
                let Some(dispatcher) = weak.upgrade() else {
                    return;
                };
                let level = match result {
                    Ok(level) => level,
                    Err(e) => {
                        error!("async devsl query failed ({e}), defaulting to S1");
                        SECURITY_LEVEL_S1 as u32
                    }
                };
                // hop off the service's callback context before touching
                // the talkers
                std::thread::spawn(move || dispatcher.devsl_gotton_callback_async(&udid, level));
            }),
        );
        if let Err(e) = result {
            warn!("async devsl registration for {cid} failed: {e}");
        }
    }

    fn devsl_gotton_callback_async(&self, udid: &str, devsl: u32) {
        info!("devsl for {udid} resolved: {devsl}");
        // id_map before talkers_map, the same order the register path uses
        let cid = self.id_map.lock().get(udid).cloned();
        let Some(talkers) = self.talkers_map.lock().remove(udid) else {
            error!("devsl callback with no registered talker");
            return;
        };
        let Some(cid) = cid else {
            error!("devsl callback with no cid mapping for {udid}");
            return;
        };

        self.devsl_map.insert(cid.clone(), devsl as i32);
        for talker in talkers {
            if let Some(talker) = talker.upgrade() {
                talker.sink_devsl_to_kernel(&cid, devsl);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parking_lot::RwLock;

    use hmdfsd_core::config::PeerEntry;
    use hmdfsd_core::{DeviceInfo, KernelCmd, MountArgumentDescriptors, UPDATE_DEVSL_PARAM_SIZE};

    use crate::mount_point::MountPoint;
    use crate::platform::StaticPlatform;

    struct FixedLabels(&'static str);

    impl SecurityLabelStore for FixedLabels {
        fn security_label(&self, _path: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn dispatcher(devsl: i32, label: &'static str) -> Arc<DevslDispatcher> {
        let platform = Arc::new(StaticPlatform::new(
            "local",
            1,
            vec![PeerEntry {
                cid: "c1".into(),
                device_id: "d1".into(),
                address: "127.0.0.1:1".into(),
                devsl,
                ..Default::default()
            }],
        ));
        DevslDispatcher::new(platform.clone(), platform, Arc::new(FixedLabels(label)))
    }

    #[test]
    fn test_gate_passes_only_at_or_above_label() {
        let paths = vec!["/mnt/hmdfs/100/file".to_string()];

        // S4 peer, s4 paths: allowed
        assert!(dispatcher(4, "s4").compare_devsl_with_local("c1", &paths));
        // S3 peer, s4 paths: denied
        assert!(!dispatcher(3, "s4").compare_devsl_with_local("c1", &paths));
        // S3 peer, s2 paths: allowed
        assert!(dispatcher(3, "s2").compare_devsl_with_local("c1", &paths));
    }

    #[test]
    fn test_gate_fails_closed() {
        let d = dispatcher(4, "s4");
        // unknown peer: resolution fails → denied
        assert!(!d.compare_devsl_with_local("stranger", &["/x".to_string()]));
        // no paths → denied
        assert!(!d.compare_devsl_with_local("c1", &[]));
        // empty networkId → denied
        assert!(!d.compare_devsl_with_local("", &["/x".to_string()]));
    }

    #[test]
    fn test_unlabeled_path_denies() {
        struct NoLabels;
        impl SecurityLabelStore for NoLabels {
            fn security_label(&self, _path: &str) -> Option<String> {
                None
            }
        }
        let platform = Arc::new(StaticPlatform::new(
            "local",
            1,
            vec![PeerEntry {
                cid: "c1".into(),
                device_id: "d1".into(),
                address: "127.0.0.1:1".into(),
                devsl: 4,
                ..Default::default()
            }],
        ));
        let d = DevslDispatcher::new(platform.clone(), platform, Arc::new(NoLabels));
        assert!(!d.compare_devsl_with_local("c1", &["/x".to_string()]));
    }

    #[test]
    fn test_devsl_is_cached() {
        let d = dispatcher(3, "s4");
        assert_eq!(d.get_device_devsl("c1"), 3);
        // second read is served from the cache
        assert_eq!(d.get_device_devsl("c1"), 3);
        assert_eq!(d.devsl_map.get("c1").map(|v| *v), Some(3));
    }

    #[test]
    fn test_async_register_sinks_to_talker() {
        let d = dispatcher(4, "s4");

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

        d.devsl_get_register("c1", Arc::downgrade(&talker));

        // the resolution hops across two threads; wait for the sink
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let written = loop {
            let data = std::fs::read(ctrl.path()).unwrap();
            if !data.is_empty() || std::time::Instant::now() > deadline {
                break data;
            }
            std::thread::sleep(Duration::from_millis(10));
        };

        assert_eq!(written.len(), UPDATE_DEVSL_PARAM_SIZE);
        assert_eq!(
            i32::from_ne_bytes(written[0..4].try_into().unwrap()),
            KernelCmd::UpdateDevsl as i32
        );
        assert_eq!(u32::from_ne_bytes(written[4..8].try_into().unwrap()), 4);
        assert_eq!(&written[8..10], b"c1");
        // the registration is consumed
        assert!(d.talkers_map.lock().is_empty());
    }
}
