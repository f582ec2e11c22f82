//! Platform collaborator seams
//!
//! The daemon talks to several platform services it does not own: the
//! device-presence manager, the device-profile/trust-group store, the
//! storage manager's docs-mount RPC, and the data-security-level service.
//! Each is a trait here so the shipping binary can wire the real services
//! while tests (and standalone deployments) inject static ones.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use hmdfsd_core::{
    config::PeerEntry, DeviceInfo, DfsStatus, NetworkType, PlatformError, GroupInfo,
    IDENTICAL_ACCOUNT_GROUP, PEER_TO_PEER_GROUP,
};

/// Device-state callbacks delivered by the platform device manager.
///
/// Ready/offline/changed arrive on platform callback threads; implementors
/// must only post work, not block.
pub trait DeviceStateCallback: Send + Sync {
    fn on_device_ready(&self, info: DeviceInfo);
    fn on_device_offline(&self, info: DeviceInfo);
    fn on_device_changed(&self, info: DeviceInfo);
    fn on_remote_died(&self);
}

/// The platform device-manager SDK surface the daemon consumes
pub trait DeviceManagerSdk: Send + Sync {
    fn init_device_manager(&self) -> Result<(), PlatformError>;
    fn register_dev_state_callback(
        &self,
        callback: Arc<dyn DeviceStateCallback>,
    ) -> Result<(), PlatformError>;
    fn unregister_dev_state_callback(&self) -> Result<(), PlatformError>;
    fn get_local_device_info(&self) -> Result<DeviceInfo, PlatformError>;
    fn get_trusted_device_list(&self) -> Result<Vec<DeviceInfo>, PlatformError>;
    fn get_network_type_by_network_id(&self, network_id: &str)
        -> Result<NetworkType, PlatformError>;
    fn get_udid_by_network_id(&self, network_id: &str) -> Result<String, PlatformError>;
}

/// Device-profile / trust-group SDK surface
pub trait DeviceProfileSdk: Send + Sync {
    /// os_type from the peer's profile
    fn get_os_type(&self, udid: &str) -> Result<i32, PlatformError>;
    /// JSON group list, as the group-management SDK returns it
    fn get_related_groups(&self, udid: &str) -> Result<String, PlatformError>;
}

/// Storage manager docs-mount RPC
pub trait StorageManagerRpc: Send + Sync {
    fn mount_dfs_docs(
        &self,
        user_id: i32,
        relative_path: &str,
        network_id: &str,
        device_id: &str,
    ) -> Result<(), PlatformError>;

    fn umount_dfs_docs(
        &self,
        user_id: i32,
        relative_path: &str,
        network_id: &str,
        device_id: &str,
    ) -> Result<(), PlatformError>;
}

/// Remote listener registered by an app for cross-device status pushes
pub trait FileDfsListener: Send + Sync {
    fn on_status(&self, network_id: &str, status: DfsStatus);
}

/// Callback for the async security-level query
pub type SecLevelCallback = Box<dyn FnOnce(String, Result<u32, PlatformError>) + Send>;

/// Data-security-level service surface
pub trait SecurityLevelSdk: Send + Sync {
    fn on_start(&self) -> Result<(), PlatformError>;
    fn on_stop(&self);
    fn get_highest_sec_level(&self, udid: &str) -> Result<u32, PlatformError>;
    fn get_highest_sec_level_async(
        &self,
        udid: &str,
        callback: SecLevelCallback,
    ) -> Result<(), PlatformError>;
}

/// Path → security label ("s1".."s4") lookup
pub trait SecurityLabelStore: Send + Sync {
    fn security_label(&self, path: &str) -> Option<String>;
}

// === Static implementations for standalone deployments and tests ===

/// Device directory backed by the `[[peers]]` table of the config file.
///
/// Stands in for the platform device manager on deployments that have no
/// live one; device state callbacks are driven by the caller.
pub struct StaticPlatform {
    local: RwLock<DeviceInfo>,
    peers: Vec<PeerEntry>,
    callback: RwLock<Option<Arc<dyn DeviceStateCallback>>>,
}

impl StaticPlatform {
    pub fn new(local_cid: impl Into<String>, local_iid: u64, peers: Vec<PeerEntry>) -> Self {
        let mut local = DeviceInfo::new();
        local.set_cid(local_cid);
        local.set_iid(local_iid);
        Self {
            local: RwLock::new(local),
            peers,
            callback: RwLock::new(None),
        }
    }

    pub fn peer(&self, cid: &str) -> Option<&PeerEntry> {
        self.peers.iter().find(|p| p.cid == cid)
    }

    /// Deliver a ready event for every configured peer, as the platform
    /// would after registration
    pub fn announce_peers(&self) {
        let callback = self.callback.read().clone();
        if let Some(cb) = callback {
            for peer in &self.peers {
                let mut info = DeviceInfo::from_cid(peer.cid.clone());
                info.set_udid(peer.device_id.clone());
                cb.on_device_ready(info);
            }
        }
    }
}

impl DeviceManagerSdk for StaticPlatform {
    fn init_device_manager(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn register_dev_state_callback(
        &self,
        callback: Arc<dyn DeviceStateCallback>,
    ) -> Result<(), PlatformError> {
        *self.callback.write() = Some(callback);
        Ok(())
    }

    fn unregister_dev_state_callback(&self) -> Result<(), PlatformError> {
        *self.callback.write() = None;
        Ok(())
    }

    fn get_local_device_info(&self) -> Result<DeviceInfo, PlatformError> {
        Ok(self.local.read().clone())
    }

    fn get_trusted_device_list(&self) -> Result<Vec<DeviceInfo>, PlatformError> {
        Ok(self
            .peers
            .iter()
            .map(|p| {
                let mut info = DeviceInfo::from_cid(p.cid.clone());
                info.set_udid(p.device_id.clone());
                info
            })
            .collect())
    }

    fn get_network_type_by_network_id(
        &self,
        network_id: &str,
    ) -> Result<NetworkType, PlatformError> {
        self.peer(network_id)
            .map(|p| NetworkType(p.network_type))
            .ok_or(PlatformError::DeviceManager {
                call: "GetNetworkTypeByNetworkId",
                code: -1,
            })
    }

    fn get_udid_by_network_id(&self, network_id: &str) -> Result<String, PlatformError> {
        self.peer(network_id)
            .map(|p| p.device_id.clone())
            .ok_or(PlatformError::DeviceManager {
                call: "GetUdidByNetworkId",
                code: -1,
            })
    }
}

impl DeviceProfileSdk for StaticPlatform {
    fn get_os_type(&self, udid: &str) -> Result<i32, PlatformError> {
        self.peers
            .iter()
            .find(|p| p.device_id == udid)
            .map(|p| p.os_type)
            .ok_or_else(|| PlatformError::ProfileUnavailable(udid.to_string()))
    }

    fn get_related_groups(&self, udid: &str) -> Result<String, PlatformError> {
        // One same-account and one point-to-point group per known peer,
        // enough for classification to have something to chew on
        if self.peers.iter().any(|p| p.device_id == udid) {
            let groups = vec![
                GroupInfo {
                    group_name: "same_account".into(),
                    group_id: format!("ga_{udid}"),
                    group_owner: "ohos.storage".into(),
                    group_type: IDENTICAL_ACCOUNT_GROUP,
                },
                GroupInfo {
                    group_name: "p2p".into(),
                    group_id: format!("gp_{udid}"),
                    group_owner: "ohos.storage".into(),
                    group_type: PEER_TO_PEER_GROUP,
                },
            ];
            serde_json::to_string(&groups)
                .map_err(|_| PlatformError::ProfileUnavailable(udid.to_string()))
        } else {
            Err(PlatformError::ProfileUnavailable(udid.to_string()))
        }
    }
}

impl SecurityLevelSdk for StaticPlatform {
    fn on_start(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn on_stop(&self) {}

    fn get_highest_sec_level(&self, udid: &str) -> Result<u32, PlatformError> {
        self.peers
            .iter()
            .find(|p| p.device_id == udid)
            .map(|p| p.devsl as u32)
            .ok_or(PlatformError::SecurityLevel(-1))
    }

    fn get_highest_sec_level_async(
        &self,
        udid: &str,
        callback: SecLevelCallback,
    ) -> Result<(), PlatformError> {
        let result = self.get_highest_sec_level(udid);
        let udid = udid.to_string();
        // The real service calls back from its own context
        std::thread::spawn(move || callback(udid, result));
        Ok(())
    }
}

/// Storage manager stand-in that records the RPC without issuing it
pub struct LoggingStorageManager;

impl StorageManagerRpc for LoggingStorageManager {
    fn mount_dfs_docs(
        &self,
        user_id: i32,
        relative_path: &str,
        network_id: &str,
        device_id: &str,
    ) -> Result<(), PlatformError> {
        info!(
            "MountDfsDocs user {user_id} path {relative_path} network {network_id} device {device_id}"
        );
        Ok(())
    }

    fn umount_dfs_docs(
        &self,
        user_id: i32,
        relative_path: &str,
        network_id: &str,
        device_id: &str,
    ) -> Result<(), PlatformError> {
        info!(
            "UMountDfsDocs user {user_id} path {relative_path} network {network_id} device {device_id}"
        );
        Ok(())
    }
}

/// Label store reading the `user.security` xattr, the platform's on-disk
/// label convention
pub struct XattrSecurityLabelStore;

const SECURITY_XATTR: &str = "user.security";

impl SecurityLabelStore for XattrSecurityLabelStore {
    fn security_label(&self, path: &str) -> Option<String> {
        let c_path = std::ffi::CString::new(path).ok()?;
        let c_name = std::ffi::CString::new(SECURITY_XATTR).ok()?;
        let mut buf = [0u8; 16];
        let len = unsafe {
            libc::getxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if len <= 0 {
            debug!("no security label on {path}");
            return None;
        }
        Some(String::from_utf8_lossy(&buf[..len as usize]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmdfsd_core::types::NETWORK_TYPE_WIFI_BIT;

    fn peer(cid: &str, udid: &str) -> PeerEntry {
        PeerEntry {
            cid: cid.into(),
            device_id: udid.into(),
            address: "127.0.0.1:5202".into(),
            network_type: NETWORK_TYPE_WIFI_BIT,
            ..Default::default()
        }
    }

    #[test]
    fn test_static_platform_lookups() {
        let platform = StaticPlatform::new("local", 1, vec![peer("c1", "d1")]);

        assert_eq!(platform.get_udid_by_network_id("c1").unwrap(), "d1");
        assert!(platform.get_udid_by_network_id("nope").is_err());
        assert!(platform
            .get_network_type_by_network_id("c1")
            .unwrap()
            .is_wifi_capable());

        let trusted = platform.get_trusted_device_list().unwrap();
        assert_eq!(trusted.len(), 1);
        assert_eq!(trusted[0].cid().unwrap(), "c1");
    }

    #[test]
    fn test_static_platform_groups() {
        let platform = StaticPlatform::new("local", 1, vec![peer("c1", "d1")]);
        let json = platform.get_related_groups("d1").unwrap();
        let groups = hmdfsd_core::types::parse_group_list(&json);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().any(|g| g.is_same_account()));
    }
}
