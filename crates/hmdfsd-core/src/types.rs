//! Core type definitions for the hmdfs daemon
//!
//! Peer identity, link classification, and trust-group records shared by the
//! device manager and the network agents.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DeviceInfoError;

/// Same-account trust group
pub const IDENTICAL_ACCOUNT_GROUP: i32 = 1;
/// Point-to-point (accountless) trust group
pub const PEER_TO_PEER_GROUP: i32 = 256;
/// Cross-account authorized trust group
pub const ACROSS_ACCOUNT_AUTHORIZE_GROUP: i32 = 1282;

/// Network-type bitmask bit signalling Wi-Fi capability
pub const NETWORK_TYPE_WIFI_BIT: u32 = 1 << 1;

/// Profile os_type value for peers running a compatible OS
pub const SUPPORTED_OS_TYPE: i32 = 10;

/// Physical link a session rides on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LinkType {
    /// Infrastructure Wi-Fi (AP)
    Ap = 0,
    /// Wi-Fi direct
    P2p = 1,
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkType::Ap => write!(f, "ap"),
            LinkType::P2p => write!(f, "p2p"),
        }
    }
}

/// Network-type bitmask reported by the platform device manager
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkType(pub u32);

impl NetworkType {
    pub fn is_wifi_capable(self) -> bool {
        self.0 & NETWORK_TYPE_WIFI_BIT != 0
    }
}

/// Identity of a peer device as seen by this daemon.
///
/// Both fields are learned asynchronously from platform callbacks, so either
/// may be unknown for a while. Reads return a typed error until the field is
/// initialized; writes keep first-write-wins semantics — a second set is a
/// logged no-op, matching the platform's delivery quirks where duplicate
/// callbacks re-announce the same device.
#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    cid: Option<String>,
    iid: Option<u64>,
    udid: Option<String>,
}

impl DeviceInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an info whose cid is already known (kernel-driven reconnects)
    pub fn from_cid(cid: impl Into<String>) -> Self {
        Self {
            cid: Some(cid.into()),
            iid: None,
            udid: None,
        }
    }

    /// Network/connection id of the peer
    pub fn cid(&self) -> Result<&str, DeviceInfoError> {
        self.cid.as_deref().ok_or(DeviceInfoError::CidNotInitialized)
    }

    /// Numeric instance id of the peer
    pub fn iid(&self) -> Result<u64, DeviceInfoError> {
        self.iid.ok_or(DeviceInfoError::IidNotInitialized)
    }

    /// Stable physical-device id (udid), when resolved
    pub fn udid(&self) -> Option<&str> {
        self.udid.as_deref()
    }

    pub fn set_cid(&mut self, cid: impl Into<String>) {
        if self.cid.is_some() {
            warn!("cid has been initialized, ignoring rewrite");
            return;
        }
        self.cid = Some(cid.into());
    }

    pub fn set_iid(&mut self, iid: u64) {
        if self.iid.is_some() {
            warn!("iid has been initialized, ignoring rewrite");
            return;
        }
        self.iid = Some(iid);
    }

    pub fn set_udid(&mut self, udid: impl Into<String>) {
        self.udid = Some(udid.into());
    }
}

/// One trust group a peer belongs to, parsed from the group-management
/// SDK's JSON group list
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupInfo {
    #[serde(rename = "groupName", default)]
    pub group_name: String,
    #[serde(rename = "groupId", default)]
    pub group_id: String,
    #[serde(rename = "groupOwner", default)]
    pub group_owner: String,
    #[serde(rename = "groupType", default)]
    pub group_type: i32,
}

impl GroupInfo {
    pub fn is_same_account(&self) -> bool {
        self.group_type == IDENTICAL_ACCOUNT_GROUP
    }
}

/// Parse the JSON group list returned by the group-management SDK.
///
/// Malformed entries are dropped rather than failing the whole list.
pub fn parse_group_list(json: &str) -> Vec<GroupInfo> {
    match serde_json::from_str::<Vec<serde_json::Value>>(json) {
        Ok(values) => values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        Err(e) => {
            warn!("failed to parse group list: {e}");
            Vec::new()
        }
    }
}

/// Cross-device file-access status pushed to registered listeners
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum DfsStatus {
    Offline = 0,
    Online = 1,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_info_first_write_wins() {
        let mut info = DeviceInfo::new();
        assert_eq!(info.cid(), Err(DeviceInfoError::CidNotInitialized));

        info.set_cid("peer-a");
        info.set_cid("peer-b"); // ignored
        assert_eq!(info.cid().unwrap(), "peer-a");

        assert_eq!(info.iid(), Err(DeviceInfoError::IidNotInitialized));
        info.set_iid(7);
        info.set_iid(8); // ignored
        assert_eq!(info.iid().unwrap(), 7);
    }

    #[test]
    fn test_network_type_wifi_bit() {
        assert!(NetworkType(NETWORK_TYPE_WIFI_BIT).is_wifi_capable());
        assert!(NetworkType(NETWORK_TYPE_WIFI_BIT | 1).is_wifi_capable());
        assert!(!NetworkType(1).is_wifi_capable());
        assert!(!NetworkType::default().is_wifi_capable());
    }

    #[test]
    fn test_parse_group_list() {
        let json = r#"[
            {"groupName":"home","groupId":"g1","groupOwner":"pkg.a","groupType":1},
            {"groupName":"share","groupId":"g2","groupOwner":"pkg.b","groupType":256}
        ]"#;
        let groups = parse_group_list(json);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].is_same_account());
        assert!(!groups[1].is_same_account());
    }

    #[test]
    fn test_parse_group_list_malformed() {
        assert!(parse_group_list("not json").is_empty());
        // entries with missing fields still parse via defaults
        let groups = parse_group_list(r#"[{"groupId":"g1"}]"#);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_type, 0);
    }
}
