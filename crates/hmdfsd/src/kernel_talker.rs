//! Kernel control-channel bridge
//!
//! One `KernelTalker` per mount point. Commands (session hand-off, offline
//! notice, devsl update) are single packed writes on the mount's control
//! file; notifications pushed by the kernel are drained by a dedicated poll
//! thread and dispatched to the callbacks injected by the owning network
//! agent.
//!
//! Control-file failures are logged and the call returns without effect; a
//! caller must not assume the kernel received a command.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use hmdfsd_core::{
    copy_cid, DeviceInfo, InitParam, KernelCmd, NotifyCode, NotifyParam, OfflineParam,
    ProtocolError, UpdateDevslParam, UpdateSocketParam, ACCOUNT_HASH_MAX_LEN, CID_MAX_LEN,
    KEY_MAX_LEN, NOTIFY_PARAM_SIZE, SOCKET_STAT_ACCEPT, SOCKET_STAT_OPEN, TCP_TRANSPORT_PROTO,
};

use crate::mount_point::MountPoint;
use crate::session::Session;

/// Invoked on the poll thread when the kernel asks for a fresh session
pub type GetSessionCallback = Box<dyn Fn(NotifyParam) + Send + Sync>;
/// Invoked on the poll thread when the kernel reports a link disconnect
pub type CloseSessionCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct KernelTalker {
    mount_point: Weak<MountPoint>,
    local_device: Arc<RwLock<DeviceInfo>>,
    poll_timeout_ms: i32,
    get_session_cb: GetSessionCallback,
    close_session_cb: CloseSessionCallback,
    /// Serializes command writes; independent of the poll thread
    cmd_lock: Mutex<()>,
    is_running: AtomicBool,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl KernelTalker {
    pub fn new(
        mount_point: Weak<MountPoint>,
        local_device: Arc<RwLock<DeviceInfo>>,
        poll_timeout_ms: i32,
        get_session_cb: GetSessionCallback,
        close_session_cb: CloseSessionCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            mount_point,
            local_device,
            poll_timeout_ms,
            get_session_cb,
            close_session_cb,
            cmd_lock: Mutex::new(()),
            is_running: AtomicBool::new(false),
            poll_thread: Mutex::new(None),
        })
    }

    fn local_iid(&self) -> u64 {
        match self.local_device.read().iid() {
            Ok(iid) => iid,
            Err(_) => {
                warn!("local iid not yet known, sinking 0");
                0
            }
        }
    }

    /// Hand an established session's socket to the kernel.
    ///
    /// The session stays owned by the pool; only its fd, key and cid are
    /// read. Its own listener is disabled first — from here on the kernel
    /// owns events on this socket.
    pub fn sink_session_to_kernel(
        &self,
        session: &dyn Session,
        back_stage: bool,
    ) -> Result<(), ProtocolError> {
        let fd = session.handle();
        let cid = session.cid();
        let status = if session.is_from_server() {
            SOCKET_STAT_ACCEPT
        } else {
            SOCKET_STAT_OPEN
        };
        debug!(
            "sink session to kernel, cid {cid}, fd {fd}, key {}..",
            hex::encode(&session.key()[..4])
        );

        let mut master_key = [0u8; KEY_MAX_LEN];
        master_key.copy_from_slice(session.key());

        let param = UpdateSocketParam {
            cmd: KernelCmd::UpdateSocket as i32,
            newfd: fd,
            local_iid: self.local_iid(),
            status,
            protocol: TCP_TRANSPORT_PROTO,
            udp_port: 0,
            device_type: u8::from(back_stage),
            master_key,
            cid: copy_cid(cid)?,
            link_type: session.link_type() as i32,
            binder_fd: -1,
        };

        session.disable_listener();
        self.set_cmd(&param.encode());
        Ok(())
    }

    /// Tell the kernel a peer is gone
    pub fn sink_offline_cmd_to_kernel(&self, cid: &str) {
        if cid.len() >= CID_MAX_LEN {
            warn!("refusing offline cmd, cid of {} bytes", cid.len());
            return;
        }
        let cid_buf = match copy_cid(cid) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("refusing offline cmd: {e}");
                return;
            }
        };
        self.set_cmd(&OfflineParam::new(cid_buf).encode());
    }

    /// Announce the local instance to the kernel
    pub fn sink_init_cmd_to_kernel(&self, iid: u64) {
        let account = [0u8; ACCOUNT_HASH_MAX_LEN];
        self.set_cmd(&InitParam::new(iid, account).encode());
    }

    /// Push a resolved device security level for an online peer
    pub fn sink_devsl_to_kernel(&self, cid: &str, devsl: u32) {
        let cid_buf = match copy_cid(cid) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("refusing devsl cmd: {e}");
                return;
            }
        };
        self.set_cmd(&UpdateDevslParam::new(devsl, cid_buf).encode());
    }

    /// Start the poll thread; one per talker, double-create is a no-op
    pub fn create_poll_thread(self: &Arc<Self>) {
        let mut slot = self.poll_thread.lock();
        if slot.is_some() {
            error!("poll thread is already running");
            return;
        }
        self.is_running.store(true, Ordering::SeqCst);

        let talker = Arc::clone(self);
        *slot = Some(
            std::thread::Builder::new()
                .name("hmdfs-poll".into())
                .spawn(move || talker.poll_run())
                .expect("spawning the poll thread"),
        );
        info!("created poll thread");
    }

    /// Stop the poll loop and join the thread
    pub fn wait_for_poll_thread_exited(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        let handle = self.poll_thread.lock().take();
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    error!("poll thread panicked");
                }
                info!("poll thread exited");
            }
            None => error!("poll thread is not running"),
        }
    }

    fn poll_run(&self) {
        let Some(mp) = self.mount_point.upgrade() else {
            error!("mount point is gone, poll thread exiting");
            return;
        };
        let ctrl_path = mp.ctrl_path();
        drop(mp);

        let c_path = match std::ffi::CString::new(ctrl_path.to_string_lossy().as_bytes()) {
            Ok(p) => p,
            Err(_) => {
                error!("control path contains NUL, poll thread exiting");
                return;
            }
        };
        // The node may not exist until the kernel has seen our mount; bail
        // out quietly and let the next mount cycle retry.
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            error!(
                "failed to open control file {:?}: {}",
                ctrl_path,
                std::io::Error::last_os_error()
            );
            return;
        }
        info!("opened control file {:?}", ctrl_path);

        while self.is_running.load(Ordering::SeqCst) {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLPRI,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, self.poll_timeout_ms) };
            match ret {
                -1 => {
                    error!("poll error: {}", std::io::Error::last_os_error());
                    break;
                }
                0 => {} // tick, re-check is_running
                _ => self.handle_all_notify(fd),
            }
        }

        unsafe { libc::close(fd) };
        info!("poll loop exited");
    }

    /// Drain every pending notify record from the control file
    fn handle_all_notify(&self, fd: i32) {
        let mut buf = [0u8; NOTIFY_PARAM_SIZE];

        while self.is_running.load(Ordering::SeqCst) {
            unsafe { libc::lseek(fd, 0, libc::SEEK_SET) };
            let read_size =
                unsafe { libc::read(fd, buf.as_mut_ptr().cast(), NOTIFY_PARAM_SIZE) };
            if read_size < NOTIFY_PARAM_SIZE as isize {
                return;
            }
            let Some(param) = NotifyParam::decode(&buf) else {
                return;
            };
            if param.notify == NotifyCode::None as i32 {
                return;
            }
            self.notify_handler(param);
        }
    }

    fn notify_handler(&self, param: NotifyParam) {
        let cid = param.remote_cid_str();
        match NotifyCode::from_raw(param.notify) {
            Ok(NotifyCode::HsDone) => info!("NOTIFY_HS_DONE, remote cid {cid}"),
            Ok(NotifyCode::Offline) => info!("NOTIFY_OFFLINE, remote cid {cid}"),
            Ok(NotifyCode::OfflineIid) => info!("NOTIFY_OFFLINE_IID, remote cid {cid}"),
            Ok(NotifyCode::GetSession) => (self.get_session_cb)(param),
            Ok(NotifyCode::Disconnect) => (self.close_session_cb)(&cid),
            Ok(other) => info!("notify {other:?} not supported now"),
            Err(e) => warn!("{e}"),
        }
    }

    /// Single serialized write of one command record
    fn set_cmd(&self, bytes: &[u8]) {
        let _guard = self.cmd_lock.lock();
        let Some(mp) = self.mount_point.upgrade() else {
            error!("mount point is gone, command dropped");
            return;
        };
        let path = mp.ctrl_path();

        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                error!("failed to open control file {:?}: {e}", path);
                return;
            }
        };
        if let Err(e) = file.write_all(bytes) {
            error!("failed to write command (fd {}): {e}", file.as_raw_fd());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use hmdfsd_core::MountArgumentDescriptors;

    struct FakeSession {
        cid: String,
        from_server: bool,
        listener_disabled: AtomicBool,
    }

    impl Session for FakeSession {
        fn is_from_server(&self) -> bool {
            self.from_server
        }
        fn cid(&self) -> &str {
            &self.cid
        }
        fn handle(&self) -> i32 {
            33
        }
        fn session_id(&self) -> i32 {
            1
        }
        fn key(&self) -> &[u8; KEY_MAX_LEN] {
            &[0x5A; KEY_MAX_LEN]
        }
        fn link_type(&self) -> hmdfsd_core::LinkType {
            hmdfsd_core::LinkType::Ap
        }
        fn release(&self) {}
        fn disable_listener(&self) {
            self.listener_disabled.store(true, Ordering::SeqCst);
        }
    }

    fn talker_with_ctrl_file() -> (Arc<KernelTalker>, Arc<MountPoint>, tempfile::NamedTempFile) {
        let ctrl = tempfile::NamedTempFile::new().unwrap();
        let mut arg = MountArgumentDescriptors::alpha(100, "account");
        arg.ctrl_path_override = Some(ctrl.path().to_path_buf());
        let mp = Arc::new(MountPoint::new(arg));

        let mut local = DeviceInfo::new();
        local.set_cid("local");
        local.set_iid(0x42);

        let talker = KernelTalker::new(
            Arc::downgrade(&mp),
            Arc::new(RwLock::new(local)),
            50,
            Box::new(|_| {}),
            Box::new(|_| {}),
        );
        (talker, mp, ctrl)
    }

    #[test]
    fn test_sink_offline_writes_param() {
        let (talker, _mp, ctrl) = talker_with_ctrl_file();
        talker.sink_offline_cmd_to_kernel("peer-1");

        let written = std::fs::read(ctrl.path()).unwrap();
        assert_eq!(written.len(), hmdfsd_core::OFFLINE_PARAM_SIZE);
        assert_eq!(
            i32::from_ne_bytes(written[0..4].try_into().unwrap()),
            KernelCmd::OffLine as i32
        );
        assert_eq!(&written[4..10], b"peer-1");
    }

    #[test]
    fn test_sink_offline_rejects_full_width_cid() {
        let (talker, _mp, ctrl) = talker_with_ctrl_file();
        talker.sink_offline_cmd_to_kernel(&"x".repeat(CID_MAX_LEN));

        // rejected before any write
        assert!(std::fs::read(ctrl.path()).unwrap().is_empty());
    }

    #[test]
    fn test_sink_session_writes_socket_param() {
        let (talker, _mp, ctrl) = talker_with_ctrl_file();
        let session = FakeSession {
            cid: "peer-2".into(),
            from_server: true,
            listener_disabled: AtomicBool::new(false),
        };

        talker.sink_session_to_kernel(&session, false).unwrap();

        assert!(session.listener_disabled.load(Ordering::SeqCst));
        let written = std::fs::read(ctrl.path()).unwrap();
        assert_eq!(written.len(), hmdfsd_core::UPDATE_SOCKET_PARAM_SIZE);
        assert_eq!(
            i32::from_ne_bytes(written[0..4].try_into().unwrap()),
            KernelCmd::UpdateSocket as i32
        );
        assert_eq!(i32::from_ne_bytes(written[4..8].try_into().unwrap()), 33);
        assert_eq!(
            u64::from_ne_bytes(written[8..16].try_into().unwrap()),
            0x42
        );
        assert_eq!(written[16], SOCKET_STAT_ACCEPT);
    }

    #[test]
    fn test_sink_session_oversized_cid_fails_loudly() {
        let (talker, _mp, ctrl) = talker_with_ctrl_file();
        let session = FakeSession {
            cid: "y".repeat(CID_MAX_LEN),
            from_server: false,
            listener_disabled: AtomicBool::new(false),
        };

        let err = talker.sink_session_to_kernel(&session, false).unwrap_err();
        assert!(matches!(err, ProtocolError::CopyOverflow { .. }));
        assert!(std::fs::read(ctrl.path()).unwrap().is_empty());
    }

    #[test]
    fn test_notify_dispatch() {
        let gets = Arc::new(AtomicU32::new(0));
        let closes = Arc::new(AtomicU32::new(0));

        let ctrl = tempfile::NamedTempFile::new().unwrap();
        let mut arg = MountArgumentDescriptors::alpha(100, "account");
        arg.ctrl_path_override = Some(ctrl.path().to_path_buf());
        let mp = Arc::new(MountPoint::new(arg));

        let g = Arc::clone(&gets);
        let c = Arc::clone(&closes);
        let talker = KernelTalker::new(
            Arc::downgrade(&mp),
            Arc::new(RwLock::new(DeviceInfo::new())),
            50,
            Box::new(move |_| {
                g.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut param = NotifyParam::decode(&[0u8; NOTIFY_PARAM_SIZE]).unwrap();
        param.notify = NotifyCode::GetSession as i32;
        talker.notify_handler(param);
        param.notify = NotifyCode::Disconnect as i32;
        talker.notify_handler(param);
        param.notify = NotifyCode::HsDone as i32;
        talker.notify_handler(param); // log only

        assert_eq!(gets.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_poll_thread_lifecycle() {
        let (talker, _mp, _ctrl) = talker_with_ctrl_file();

        talker.create_poll_thread();
        // second create is refused
        talker.create_poll_thread();
        std::thread::sleep(std::time::Duration::from_millis(120));
        talker.wait_for_poll_thread_exited();

        // a fresh thread can be created after the old one exited
        talker.create_poll_thread();
        talker.wait_for_poll_thread_exited();
    }
}
