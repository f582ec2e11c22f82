//! Per-link-type connection orchestration
//!
//! A `NetworkAgent` owns one kernel talker and one session pool and runs
//! the connect/disconnect state machine for the devices of one account
//! group: `Idle → Connecting → Connected → Disconnecting → Idle` per
//! (device, link). Commands execute one at a time on the agent's actor
//! task; the connection attempts themselves are offloaded to blocking
//! tasks so a slow open never stalls command processing.
//!
//! What actually opens a socket is the `LinkProvider` hook; the shipping
//! provider lives in `tcp_link`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use hmdfsd_core::{
    AgentError, Config, DeviceInfo, LinkType, NotifyParam, MAX_RETRY_COUNT,
};

use crate::actor::{self, ActorHandle, Command, Handler};
use crate::kernel_talker::KernelTalker;
use crate::mount_point::MountPoint;
use crate::platform::DeviceManagerSdk;
use crate::session::Session;
use crate::session_pool::SessionPool;

/// Hands inbound sessions from the link layer to the owning agent
pub type SessionAcceptor = Arc<dyn Fn(Arc<dyn Session>) + Send + Sync>;

/// Transport hook: what actually opens and closes peer links.
///
/// `open_session` may block (it runs on a blocking task); inbound sessions
/// arrive through the acceptor passed to `join_domain`.
pub trait LinkProvider: Send + Sync + 'static {
    fn join_domain(&self, acceptor: SessionAcceptor) -> Result<(), AgentError>;
    fn quit_domain(&self);
    fn open_session(
        &self,
        info: &DeviceInfo,
        link_type: LinkType,
    ) -> Result<Arc<dyn Session>, AgentError>;
    fn close_session(&self, session: &dyn Session);
}

/// Commands processed by an agent's actor task
#[derive(Debug)]
pub enum AgentCmd {
    ConnectDevice(DeviceInfo),
    ConnectDeviceByP2p(DeviceInfo),
    DisconnectDevice(DeviceInfo),
    DisconnectDeviceByP2p(DeviceInfo),
    DisconnectDeviceByP2pHmdfs(DeviceInfo),
    AcceptSession(Arc<dyn Session>, bool),
    GetSessionProcess(NotifyParam),
    CloseSessionForOneDevice(String),
    ConnectOnlineDevices,
    DisconnectAllDevices,
}

/// Object-safe agent surface the device manager drives
#[async_trait]
pub trait NetworkAgentOps: Send + Sync {
    fn start(&self) -> Result<(), AgentError>;
    async fn stop(&self);
    fn post(&self, cmd: Command<AgentCmd>);
    fn mount_point(&self) -> Arc<MountPoint>;
}

pub struct NetworkAgent<P: LinkProvider> {
    provider: P,
    mount_point: Arc<MountPoint>,
    talker: Arc<KernelTalker>,
    pool: SessionPool,
    device_sdk: Arc<dyn DeviceManagerSdk>,
    local_device: Arc<RwLock<DeviceInfo>>,
    open_session_delay: Duration,
    /// Per-cid budget of reconnect attempts, cleared on success
    retried_times: DashMap<String, u32>,
    /// In-flight connect attempts, reaped on the next command
    tasks: Mutex<Vec<JoinHandle<()>>>,
    handle: Mutex<Option<ActorHandle<AgentCmd>>>,
    actor_task: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<Self>,
}

impl<P: LinkProvider> NetworkAgent<P> {
    pub fn new(
        provider: P,
        mount_point: Arc<MountPoint>,
        device_sdk: Arc<dyn DeviceManagerSdk>,
        local_device: Arc<RwLock<DeviceInfo>>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let get_session = {
                let weak = weak.clone();
                Box::new(move |param: NotifyParam| {
                    if let Some(agent) = weak.upgrade() {
                        agent.post_cmd(Command::once(AgentCmd::GetSessionProcess(param)));
                    }
                })
            };
            let close_session = {
                let weak = weak.clone();
                Box::new(move |cid: &str| {
                    if let Some(agent) = weak.upgrade() {
                        agent.post_cmd(Command::once(AgentCmd::CloseSessionForOneDevice(
                            cid.to_string(),
                        )));
                    }
                })
            };

            let talker = KernelTalker::new(
                Arc::downgrade(&mount_point),
                Arc::clone(&local_device),
                config.kernel.poll_timeout_ms,
                get_session,
                close_session,
            );
            let pool = SessionPool::new(Arc::clone(&talker), Arc::clone(&device_sdk));

            Self {
                provider,
                mount_point,
                talker,
                pool,
                device_sdk,
                local_device,
                open_session_delay: Duration::from_millis(config.network.open_session_delay_ms),
                retried_times: DashMap::new(),
                tasks: Mutex::new(Vec::new()),
                handle: Mutex::new(None),
                actor_task: Mutex::new(None),
                weak_self: weak.clone(),
            }
        })
    }

    pub fn session_pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn kernel_talker(&self) -> &Arc<KernelTalker> {
        &self.talker
    }

    fn post_cmd(&self, cmd: Command<AgentCmd>) {
        match self.handle.lock().as_ref() {
            Some(handle) => handle.recv(cmd),
            None => warn!("agent not started, command dropped"),
        }
    }

    /// Spawn one bounded connect attempt; success and retry both route back
    /// through the command queue.
    fn spawn_connect(&self, info: DeviceInfo, link_type: LinkType) {
        let Some(agent) = self.weak_self.upgrade() else {
            return;
        };

        self.reap_tasks();
        let task = tokio::spawn(async move {
            let opened = {
                let agent = Arc::clone(&agent);
                let info = info.clone();
                tokio::task::spawn_blocking(move || agent.provider.open_session(&info, link_type))
                    .await
            };
            let cid = info.cid().unwrap_or("<unset>").to_string();
            match opened {
                Ok(Ok(session)) => {
                    agent.post_cmd(Command::once(AgentCmd::AcceptSession(session, false)));
                }
                Ok(Err(e)) => {
                    warn!("open session to {cid} failed: {e}");
                    if agent.is_continue_retry(&cid) {
                        let cmd = match link_type {
                            LinkType::Ap => AgentCmd::ConnectDevice(info),
                            LinkType::P2p => AgentCmd::ConnectDeviceByP2p(info),
                        };
                        agent.post_cmd(Command::once(cmd));
                    } else {
                        error!("exceeded the maximum number of retries for {cid}");
                        agent.retried_times.remove(&cid);
                    }
                }
                Err(e) => error!("connect task for {cid} did not complete: {e}"),
            }
        });
        self.tasks.lock().push(task);
    }

    fn reap_tasks(&self) {
        self.tasks.lock().retain(|t| !t.is_finished());
    }

    fn is_continue_retry(&self, cid: &str) -> bool {
        let mut entry = self.retried_times.entry(cid.to_string()).or_insert(0);
        if *entry >= MAX_RETRY_COUNT {
            return false;
        }
        *entry += 1;
        true
    }

    async fn connect_device(&self, info: &DeviceInfo, link_type: LinkType) -> Result<(), AgentError> {
        // Settle delay: an offline notice for the previous link may still be
        // in flight when the next connect command lands.
        tokio::time::sleep(self.open_session_delay).await;
        self.spawn_connect(info.clone(), link_type);
        Ok(())
    }

    fn accept_session(&self, session: Arc<dyn Session>, back_stage: bool) -> Result<(), AgentError> {
        let cid = session.cid().to_string();
        info!("accept session, cid {cid}");
        self.pool.hold_session(session, back_stage)?;
        self.retried_times.remove(&cid);
        Ok(())
    }

    /// The kernel wants a fresh outbound session for a cid whose old socket
    /// it no longer trusts: drop the old fd, reconnect.
    fn get_session_process(&self, param: &NotifyParam) {
        let cid = param.remote_cid_str();
        let fd = param.fd;
        info!("NOTIFY_GET_SESSION, old fd {}, remote cid {cid}", fd);
        self.pool.release_session(fd);
        self.spawn_connect(DeviceInfo::from_cid(cid), LinkType::Ap);
    }

    fn disconnect_link(&self, cid: &str, link_type: LinkType, notify_kernel: bool) {
        let (removed, last) = self.pool.release_session_by_cid(cid, link_type, true);
        for session in &removed {
            self.provider.close_session(session.as_ref());
        }
        if notify_kernel && last {
            self.talker.sink_offline_cmd_to_kernel(cid);
        }
    }

    fn disconnect_device(&self, info: &DeviceInfo) -> Result<(), AgentError> {
        let cid = info.cid().map_err(|_| AgentError::Domain("cid unset".into()))?;
        info!("device offline, cid {cid}");
        self.disconnect_link(cid, LinkType::Ap, true);
        Ok(())
    }

    fn close_session_for_one_device(&self, cid: &str) {
        info!("closing every link for cid {cid}");
        self.disconnect_link(cid, LinkType::Ap, false);
        self.disconnect_link(cid, LinkType::P2p, false);
        self.talker.sink_offline_cmd_to_kernel(cid);
    }

    fn connect_online_devices(&self) -> Result<(), AgentError> {
        let infos = self.device_sdk.get_trusted_device_list()?;
        info!("have {} device(s) online", infos.len());
        for info in infos {
            self.post_cmd(Command::with_retry(
                AgentCmd::ConnectDevice(info),
                MAX_RETRY_COUNT,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<P: LinkProvider> Handler for NetworkAgent<P> {
    type Cmd = AgentCmd;

    async fn handle(&self, cmd: &AgentCmd) -> Result<(), AgentError> {
        self.reap_tasks();
        match cmd {
            AgentCmd::ConnectDevice(info) => self.connect_device(info, LinkType::Ap).await,
            AgentCmd::ConnectDeviceByP2p(info) => self.connect_device(info, LinkType::P2p).await,
            AgentCmd::DisconnectDevice(info) => self.disconnect_device(info),
            AgentCmd::DisconnectDeviceByP2p(info) => {
                let cid = info.cid().map_err(|_| AgentError::Domain("cid unset".into()))?;
                self.disconnect_link(cid, LinkType::P2p, false);
                Ok(())
            }
            AgentCmd::DisconnectDeviceByP2pHmdfs(info) => {
                let cid = info.cid().map_err(|_| AgentError::Domain("cid unset".into()))?;
                self.disconnect_link(cid, LinkType::P2p, true);
                Ok(())
            }
            AgentCmd::AcceptSession(session, back_stage) => {
                self.accept_session(Arc::clone(session), *back_stage)
            }
            AgentCmd::GetSessionProcess(param) => {
                self.get_session_process(param);
                Ok(())
            }
            AgentCmd::CloseSessionForOneDevice(cid) => {
                self.close_session_for_one_device(cid);
                Ok(())
            }
            AgentCmd::ConnectOnlineDevices => self.connect_online_devices(),
            AgentCmd::DisconnectAllDevices => {
                self.pool.release_all_session();
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<P: LinkProvider> NetworkAgentOps for NetworkAgent<P> {
    fn start(&self) -> Result<(), AgentError> {
        let me = self
            .weak_self
            .upgrade()
            .ok_or_else(|| AgentError::Domain("agent is being dropped".into()))?;

        let acceptor: SessionAcceptor = {
            let weak = self.weak_self.clone();
            Arc::new(move |session: Arc<dyn Session>| {
                if let Some(agent) = weak.upgrade() {
                    agent.post_cmd(Command::once(AgentCmd::AcceptSession(session, false)));
                }
            })
        };
        self.provider.join_domain(acceptor)?;

        let (handle, task) = actor::start(me);
        *self.handle.lock() = Some(handle);
        *self.actor_task.lock() = Some(task);

        self.talker.create_poll_thread();
        self.talker
            .sink_init_cmd_to_kernel(self.local_device.read().iid().unwrap_or(0));
        self.post_cmd(Command::once(AgentCmd::ConnectOnlineDevices));
        info!("network agent for {} started", self.mount_point);
        Ok(())
    }

    async fn stop(&self) {
        self.provider.quit_domain();
        self.post_cmd(Command::once(AgentCmd::DisconnectAllDevices));

        // Dropping the handle lets the queue drain and the consumer exit
        let task = {
            *self.handle.lock() = None;
            self.actor_task.lock().take()
        };
        if let Some(task) = task {
            if task.await.is_err() {
                error!("agent actor task panicked");
            }
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.talker.wait_for_poll_thread_exited();
        info!("network agent for {} stopped", self.mount_point);
    }

    fn post(&self, cmd: Command<AgentCmd>) {
        self.post_cmd(cmd);
    }

    fn mount_point(&self) -> Arc<MountPoint> {
        Arc::clone(&self.mount_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

    use hmdfsd_core::{MountArgumentDescriptors, KEY_MAX_LEN};
    use hmdfsd_core::config::PeerEntry;

    use crate::platform::StaticPlatform;

    struct FakeSession {
        cid: String,
        fd: RawFd,
        id: i32,
        link: LinkType,
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
            &[3u8; KEY_MAX_LEN]
        }
        fn link_type(&self) -> LinkType {
            self.link
        }
        fn release(&self) {}
        fn disable_listener(&self) {}
    }

    /// Provider whose sessions come from a scripted list; fails until
    /// `fail_attempts` opens have been tried.
    struct ScriptedProvider {
        opens: AtomicU32,
        closes: AtomicU32,
        fail_attempts: u32,
        next_fd: AtomicI32,
    }

    impl ScriptedProvider {
        fn new(fail_attempts: u32) -> Self {
            Self {
                opens: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                fail_attempts,
                next_fd: AtomicI32::new(100),
            }
        }
    }

    impl LinkProvider for ScriptedProvider {
        fn join_domain(&self, _acceptor: SessionAcceptor) -> Result<(), AgentError> {
            Ok(())
        }
        fn quit_domain(&self) {}

        fn open_session(
            &self,
            info: &DeviceInfo,
            link_type: LinkType,
        ) -> Result<Arc<dyn Session>, AgentError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            let cid = info.cid().unwrap().to_string();
            if n < self.fail_attempts {
                return Err(AgentError::OpenSession {
                    cid,
                    reason: "induced".into(),
                });
            }
            let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeSession {
                cid,
                fd,
                id: fd,
                link: link_type,
            }))
        }

        fn close_session(&self, _session: &dyn Session) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn agent_fixture(
        fail_attempts: u32,
    ) -> (
        Arc<NetworkAgent<ScriptedProvider>>,
        tempfile::NamedTempFile,
    ) {
        let ctrl = tempfile::NamedTempFile::new().unwrap();
        let mut arg = MountArgumentDescriptors::alpha(100, "account");
        arg.ctrl_path_override = Some(ctrl.path().to_path_buf());
        let mp = Arc::new(MountPoint::new(arg));

        let platform = Arc::new(StaticPlatform::new(
            "local",
            9,
            vec![PeerEntry {
                cid: "peer-1".into(),
                device_id: "dev-1".into(),
                address: "127.0.0.1:1".into(),
                ..Default::default()
            }],
        ));

        let mut config = Config::default();
        config.network.open_session_delay_ms = 1;
        config.kernel.poll_timeout_ms = 50;

        let mut local = DeviceInfo::new();
        local.set_cid("local");
        local.set_iid(9);

        let agent = NetworkAgent::new(
            ScriptedProvider::new(fail_attempts),
            mp,
            platform,
            Arc::new(RwLock::new(local)),
            &config,
        );
        (agent, ctrl)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_online_devices_populates_the_pool() {
        let (agent, _ctrl) = agent_fixture(0);
        agent.start().unwrap();
        settle().await;

        assert_eq!(agent.session_pool().session_count(), 1);
        assert_eq!(
            agent.session_pool().device_connect_count("dev-1", LinkType::Ap),
            1
        );
        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_failures_are_retried_until_success() {
        let (agent, _ctrl) = agent_fixture(2);
        agent.start().unwrap();
        settle().await;
        settle().await;

        assert_eq!(agent.provider.opens.load(Ordering::SeqCst), 3);
        assert_eq!(agent.session_pool().session_count(), 1);
        // the budget resets once a session lands
        assert!(agent.retried_times.get("peer-1").is_none());
        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_closes_and_notifies_kernel_once() {
        let (agent, ctrl) = agent_fixture(0);
        agent.start().unwrap();
        settle().await;

        std::fs::write(ctrl.path(), b"").unwrap(); // drop the hand-off bytes
        agent.post(Command::once(AgentCmd::DisconnectDevice(
            DeviceInfo::from_cid("peer-1"),
        )));
        settle().await;

        assert_eq!(agent.session_pool().session_count(), 0);
        assert_eq!(agent.provider.closes.load(Ordering::SeqCst), 1);
        // last link gone → one offline record
        let written = std::fs::read(ctrl.path()).unwrap();
        assert_eq!(written.len(), hmdfsd_core::OFFLINE_PARAM_SIZE);
        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_session_process_reconnects() {
        let (agent, _ctrl) = agent_fixture(0);
        agent.start().unwrap();
        settle().await;
        let first_opens = agent.provider.opens.load(Ordering::SeqCst);

        let mut param = NotifyParam::decode(&[0u8; hmdfsd_core::NOTIFY_PARAM_SIZE]).unwrap();
        param.notify = hmdfsd_core::NotifyCode::GetSession as i32;
        param.fd = 100; // the fd the first connect produced
        param.remote_cid[..6].copy_from_slice(b"peer-1");
        agent.post(Command::once(AgentCmd::GetSessionProcess(param)));
        settle().await;

        assert!(agent.provider.opens.load(Ordering::SeqCst) > first_opens);
        assert_eq!(agent.session_pool().session_count(), 1);
        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_drains_and_clears() {
        let (agent, _ctrl) = agent_fixture(0);
        agent.start().unwrap();
        settle().await;
        agent.stop().await;

        assert_eq!(agent.session_pool().session_count(), 0);
        // posting after stop must not panic
        agent.post(Command::once(AgentCmd::ConnectOnlineDevices));
    }
}
