//! Kernel control-channel wire protocol
//!
//! Command and notify records exchanged with the in-kernel hmdfs driver over
//! the per-mount control file. The layout is a fixed ABI: packed structs,
//! native-endian integers, fixed-width `char` buffers, no padding. Encoding
//! is explicit field-by-field so no implicit alignment can creep in, and
//! every struct size is pinned by a compile-time assertion.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;
use crate::{ACCOUNT_HASH_MAX_LEN, CID_MAX_LEN, KEY_MAX_LEN};

/// Command codes written to the control file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum KernelCmd {
    Init = 0,
    UpdateSocket = 1,
    OffLine = 2,
    SetAccount = 3,
    OffLineAll = 4,
    UpdateCapability = 5,
    GetP2pSessionFail = 6,
    DeleteConnection = 7,
    UpdateDevsl = 8,
}

/// Notifications pushed by the kernel through the control file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum NotifyCode {
    HsDone = 0,
    Offline = 1,
    OfflineIid = 2,
    GetSession = 3,
    GotUdpPort = 4,
    None = 5,
    Disconnect = 6,
    D2dpFailed = 7,
}

impl NotifyCode {
    pub fn from_raw(raw: i32) -> Result<Self, ProtocolError> {
        match raw {
            0 => Ok(NotifyCode::HsDone),
            1 => Ok(NotifyCode::Offline),
            2 => Ok(NotifyCode::OfflineIid),
            3 => Ok(NotifyCode::GetSession),
            4 => Ok(NotifyCode::GotUdpPort),
            5 => Ok(NotifyCode::None),
            6 => Ok(NotifyCode::Disconnect),
            7 => Ok(NotifyCode::D2dpFailed),
            other => Err(ProtocolError::UnknownNotify(other)),
        }
    }
}

/// Socket adoption state in `UpdateSocketParam`
pub const SOCKET_STAT_ACCEPT: u8 = 0;
pub const SOCKET_STAT_OPEN: u8 = 1;

/// Transport protocol in `UpdateSocketParam`
pub const TCP_TRANSPORT_PROTO: u8 = 0;
pub const UDP_TRANSPORT_PROTO: u8 = 1;

/// Handshake announcement: the daemon's own instance id and account hash
#[repr(C, packed)]
pub struct InitParam {
    pub cmd: i32,
    pub local_iid: u64,
    pub current_account: [u8; ACCOUNT_HASH_MAX_LEN],
}

/// Session hand-off: the kernel adopts an established socket
#[repr(C, packed)]
pub struct UpdateSocketParam {
    pub cmd: i32,
    pub newfd: i32,
    pub local_iid: u64,
    pub status: u8,
    pub protocol: u8,
    pub udp_port: u16,
    pub device_type: u8,
    pub master_key: [u8; KEY_MAX_LEN],
    pub cid: [u8; CID_MAX_LEN],
    pub link_type: i32,
    pub binder_fd: i32,
}

/// Peer-offline notice: the kernel drops all state for a cid
#[repr(C, packed)]
pub struct OfflineParam {
    pub cmd: i32,
    pub remote_cid: [u8; CID_MAX_LEN],
}

/// Security-level update for an online peer
#[repr(C, packed)]
pub struct UpdateDevslParam {
    pub cmd: i32,
    pub devsl: u32,
    pub cid: [u8; CID_MAX_LEN],
}

/// Notification record read back from the kernel
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct NotifyParam {
    pub notify: i32,
    pub fd: i32,
    pub udp_port: u16,
    pub device_type: u8,
    pub flag: u8,
    pub reserved: u32,
    pub remote_cid: [u8; CID_MAX_LEN],
}

pub const INIT_PARAM_SIZE: usize = 33;
pub const UPDATE_SOCKET_PARAM_SIZE: usize = 125;
pub const OFFLINE_PARAM_SIZE: usize = 68;
pub const UPDATE_DEVSL_PARAM_SIZE: usize = 72;
pub const NOTIFY_PARAM_SIZE: usize = 80;

// The kernel side reads these records as packed structs; a drifting field
// breaks the ABI silently, so pin every size at compile time.
const _: () = assert!(std::mem::size_of::<InitParam>() == INIT_PARAM_SIZE);
const _: () = assert!(std::mem::size_of::<UpdateSocketParam>() == UPDATE_SOCKET_PARAM_SIZE);
const _: () = assert!(std::mem::size_of::<OfflineParam>() == OFFLINE_PARAM_SIZE);
const _: () = assert!(std::mem::size_of::<UpdateDevslParam>() == UPDATE_DEVSL_PARAM_SIZE);
const _: () = assert!(std::mem::size_of::<NotifyParam>() == NOTIFY_PARAM_SIZE);

/// Copy a cid into a fixed kernel buffer, NUL-padded.
///
/// The kernel field is a fixed `char[64]`; a cid that fills it completely
/// leaves no terminator, so anything at or above the field size is refused.
pub fn copy_cid(cid: &str) -> Result<[u8; CID_MAX_LEN], ProtocolError> {
    if cid.len() >= CID_MAX_LEN {
        return Err(ProtocolError::CopyOverflow {
            len: cid.len(),
            max: CID_MAX_LEN,
        });
    }
    let mut buf = [0u8; CID_MAX_LEN];
    buf[..cid.len()].copy_from_slice(cid.as_bytes());
    Ok(buf)
}

/// Read a NUL-padded cid buffer back into a string
pub fn cid_from_buf(buf: &[u8; CID_MAX_LEN]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(CID_MAX_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl InitParam {
    pub fn new(local_iid: u64, account_hash: [u8; ACCOUNT_HASH_MAX_LEN]) -> Self {
        Self {
            cmd: KernelCmd::Init as i32,
            local_iid,
            current_account: account_hash,
        }
    }

    pub fn encode(&self) -> [u8; INIT_PARAM_SIZE] {
        let mut out = [0u8; INIT_PARAM_SIZE];
        let mut buf = &mut out[..];
        buf.put_i32_ne(self.cmd);
        buf.put_u64_ne(self.local_iid);
        buf.put_slice(&self.current_account);
        out
    }
}

impl UpdateSocketParam {
    pub fn encode(&self) -> [u8; UPDATE_SOCKET_PARAM_SIZE] {
        let mut out = [0u8; UPDATE_SOCKET_PARAM_SIZE];
        let mut buf = &mut out[..];
        buf.put_i32_ne(self.cmd);
        buf.put_i32_ne(self.newfd);
        buf.put_u64_ne(self.local_iid);
        buf.put_u8(self.status);
        buf.put_u8(self.protocol);
        buf.put_u16_ne(self.udp_port);
        buf.put_u8(self.device_type);
        buf.put_slice(&self.master_key);
        buf.put_slice(&self.cid);
        buf.put_i32_ne(self.link_type);
        buf.put_i32_ne(self.binder_fd);
        out
    }
}

impl OfflineParam {
    pub fn new(remote_cid: [u8; CID_MAX_LEN]) -> Self {
        Self {
            cmd: KernelCmd::OffLine as i32,
            remote_cid,
        }
    }

    pub fn encode(&self) -> [u8; OFFLINE_PARAM_SIZE] {
        let mut out = [0u8; OFFLINE_PARAM_SIZE];
        let mut buf = &mut out[..];
        buf.put_i32_ne(self.cmd);
        buf.put_slice(&self.remote_cid);
        out
    }
}

impl UpdateDevslParam {
    pub fn new(devsl: u32, cid: [u8; CID_MAX_LEN]) -> Self {
        Self {
            cmd: KernelCmd::UpdateDevsl as i32,
            devsl,
            cid,
        }
    }

    pub fn encode(&self) -> [u8; UPDATE_DEVSL_PARAM_SIZE] {
        let mut out = [0u8; UPDATE_DEVSL_PARAM_SIZE];
        let mut buf = &mut out[..];
        buf.put_i32_ne(self.cmd);
        buf.put_u32_ne(self.devsl);
        buf.put_slice(&self.cid);
        out
    }
}

impl NotifyParam {
    /// Decode one notify record; `None` on short input.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < NOTIFY_PARAM_SIZE {
            return None;
        }
        let mut buf = data;
        let notify = buf.get_i32_ne();
        let fd = buf.get_i32_ne();
        let udp_port = buf.get_u16_ne();
        let device_type = buf.get_u8();
        let flag = buf.get_u8();
        let reserved = buf.get_u32_ne();
        let mut remote_cid = [0u8; CID_MAX_LEN];
        buf.copy_to_slice(&mut remote_cid);
        Some(Self {
            notify,
            fd,
            udp_port,
            device_type,
            flag,
            reserved,
            remote_cid,
        })
    }

    pub fn remote_cid_str(&self) -> String {
        cid_from_buf(&self.remote_cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_cid_bounds() {
        assert!(copy_cid("abc").is_ok());
        assert!(copy_cid(&"x".repeat(CID_MAX_LEN - 1)).is_ok());
        // a cid that exactly fills the field leaves no NUL and is refused
        assert!(matches!(
            copy_cid(&"x".repeat(CID_MAX_LEN)),
            Err(ProtocolError::CopyOverflow { len: 64, max: 64 })
        ));
    }

    #[test]
    fn test_cid_round_trip() {
        let buf = copy_cid("peer-0042").unwrap();
        assert_eq!(cid_from_buf(&buf), "peer-0042");
    }

    #[test]
    fn test_update_socket_layout() {
        let param = UpdateSocketParam {
            cmd: KernelCmd::UpdateSocket as i32,
            newfd: 17,
            local_iid: 0x1122_3344_5566_7788,
            status: SOCKET_STAT_OPEN,
            protocol: TCP_TRANSPORT_PROTO,
            udp_port: 0,
            device_type: 0,
            master_key: [0xAB; KEY_MAX_LEN],
            cid: copy_cid("peer").unwrap(),
            link_type: 0,
            binder_fd: -1,
        };
        let bytes = param.encode();
        assert_eq!(bytes.len(), UPDATE_SOCKET_PARAM_SIZE);
        assert_eq!(i32::from_ne_bytes(bytes[0..4].try_into().unwrap()), 1);
        assert_eq!(i32::from_ne_bytes(bytes[4..8].try_into().unwrap()), 17);
        // status sits right after the iid, unaligned — no padding allowed
        assert_eq!(bytes[16], SOCKET_STAT_OPEN);
        assert_eq!(&bytes[21..21 + KEY_MAX_LEN], &[0xAB; KEY_MAX_LEN]);
        assert_eq!(
            i32::from_ne_bytes(bytes[121..125].try_into().unwrap()),
            -1
        );
    }

    #[test]
    fn test_notify_decode() {
        let mut raw = [0u8; NOTIFY_PARAM_SIZE];
        raw[0..4].copy_from_slice(&(NotifyCode::GetSession as i32).to_ne_bytes());
        raw[4..8].copy_from_slice(&42i32.to_ne_bytes());
        raw[16..20].copy_from_slice(b"cid1");

        let param = NotifyParam::decode(&raw).unwrap();
        let notify = param.notify;
        let fd = param.fd;
        assert_eq!(notify, NotifyCode::GetSession as i32);
        assert_eq!(fd, 42);
        assert_eq!(param.remote_cid_str(), "cid1");
    }

    #[test]
    fn test_notify_decode_short() {
        assert!(NotifyParam::decode(&[0u8; 10]).is_none());
    }

    #[test]
    fn test_offline_encode() {
        let param = OfflineParam::new(copy_cid("gone").unwrap());
        let bytes = param.encode();
        assert_eq!(
            i32::from_ne_bytes(bytes[0..4].try_into().unwrap()),
            KernelCmd::OffLine as i32
        );
        assert_eq!(&bytes[4..8], b"gone");
    }

    #[test]
    fn test_notify_code_from_raw() {
        assert_eq!(NotifyCode::from_raw(5).unwrap(), NotifyCode::None);
        assert!(NotifyCode::from_raw(99).is_err());
    }
}
