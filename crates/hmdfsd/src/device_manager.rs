//! Device lifecycle coordination
//!
//! The `DeviceManagerAgent` is the single point of contact with the
//! platform's device-presence and trust-group services. It classifies each
//! peer's trust relationship, binds the peer to the network agent of the
//! matching account group, and drives connect/disconnect through that
//! agent's command queue. It also keeps the per-caller listener registry
//! and the per-device docs-mount reference count.
//!
//! Per peer cid the lifecycle is:
//! `Unknown → TrustQueried → NetworkBound → (Wifi|P2p)Connected → Offline`.
//!
//! Platform SDK queries are synchronous remote calls; they are always made
//! outside the state lock, on the callback thread that delivered the event.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hmdfsd_core::{
    parse_group_list, AgentError, Config, DeviceInfo, DfsStatus, GroupInfo, NetworkType,
    MAX_RETRY_COUNT, SUPPORTED_OS_TYPE,
};

use crate::actor::{self, ActorHandle, Command, Handler};
use crate::mount_manager::GroupNotifier;
use crate::mount_point::MountPoint;
use crate::network_agent::{AgentCmd, NetworkAgentOps};
use crate::platform::{
    DeviceManagerSdk, DeviceProfileSdk, DeviceStateCallback, FileDfsListener, StorageManagerRpc,
};
use crate::MOUNT_DFS_COUNT_ONE;

/// Builds the network agent for a freshly joined mount point
pub type AgentFactory = Box<dyn Fn(Arc<MountPoint>) -> Arc<dyn NetworkAgentOps> + Send + Sync>;

/// The slice of daemon configuration the device manager needs
#[derive(Clone, Debug)]
pub struct DeviceManagerConfig {
    pub user_id: i32,
    /// Classify peers by trust-group types instead of the system parameter
    pub classify_by_group_type: bool,
    /// Accountless flag used on the parameter-driven path
    pub accountless_parameter: bool,
}

impl From<&Config> for DeviceManagerConfig {
    fn from(config: &Config) -> Self {
        Self {
            user_id: config.user.id,
            classify_by_group_type: config.trust.classify_by_group_type,
            accountless_parameter: config.trust.accountless_parameter,
        }
    }
}

/// Commands processed on the device manager's own actor task
#[derive(Debug)]
pub enum DmCmd {
    JoinGroup(Arc<MountPoint>),
    QuitGroup(Arc<MountPoint>),
    OfflineAllDevice,
    ReconnectOnlineDevices,
}

#[derive(Default)]
struct DmState {
    /// mount-point id -> owning network agent
    mp_to_networks: HashMap<u32, Arc<dyn NetworkAgentOps>>,
    /// peer cid -> network agent chosen by trust classification
    cid_net_type_record: HashMap<String, Arc<dyn NetworkAgentOps>>,
    /// peer cid -> last seen network-type bitmask
    cid_network_type: HashMap<String, NetworkType>,
}

#[derive(Default)]
struct ListenerRegistry {
    /// caller token -> networkIds the caller has an active interest in
    network_id_map: HashMap<u32, HashSet<String>>,
    /// caller token -> death-watched remote listener
    app_call_connect: HashMap<u32, Arc<dyn FileDfsListener>>,
}

pub struct DeviceManagerAgent {
    device_sdk: Arc<dyn DeviceManagerSdk>,
    profile_sdk: Arc<dyn DeviceProfileSdk>,
    storage_mgr: Arc<dyn StorageManagerRpc>,
    agent_factory: AgentFactory,
    config: DeviceManagerConfig,
    local_device: Arc<RwLock<DeviceInfo>>,
    // A mutex, not a shared lock: it serializes the online/offline state
    // machine. Never re-enter an OnDevice* path from a locked section.
    state: Mutex<DmState>,
    /// physical-device id -> docs-mount reference count
    mount_dfs_count: Mutex<HashMap<String, u32>>,
    listeners: Mutex<ListenerRegistry>,
    handle: Mutex<Option<ActorHandle<DmCmd>>>,
    actor_task: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<Self>,
}

impl DeviceManagerAgent {
    pub fn new(
        device_sdk: Arc<dyn DeviceManagerSdk>,
        profile_sdk: Arc<dyn DeviceProfileSdk>,
        storage_mgr: Arc<dyn StorageManagerRpc>,
        agent_factory: AgentFactory,
        local_device: Arc<RwLock<DeviceInfo>>,
        config: DeviceManagerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            device_sdk,
            profile_sdk,
            storage_mgr,
            agent_factory,
            config,
            local_device,
            state: Mutex::new(DmState::default()),
            mount_dfs_count: Mutex::new(HashMap::new()),
            listeners: Mutex::new(ListenerRegistry::default()),
            handle: Mutex::new(None),
            actor_task: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    /// Register with the platform device manager and start the command
    /// queue. Registration failures are fatal to service start.
    pub fn start(&self) -> Result<(), AgentError> {
        let me = self
            .weak_self
            .upgrade()
            .ok_or_else(|| AgentError::Domain("device manager is being dropped".into()))?;

        self.device_sdk.init_device_manager()?;
        self.device_sdk
            .register_dev_state_callback(me.clone() as Arc<dyn DeviceStateCallback>)?;
        self.init_local_node_info()?;

        let (handle, task) = actor::start(me);
        *self.handle.lock() = Some(handle);
        *self.actor_task.lock() = Some(task);
        info!("device manager agent started");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Err(e) = self.device_sdk.unregister_dev_state_callback() {
            warn!("unregister from device manager failed: {e}");
        }
        let task = {
            *self.handle.lock() = None;
            self.actor_task.lock().take()
        };
        if let Some(task) = task {
            if task.await.is_err() {
                error!("device manager actor task panicked");
            }
        }
        info!("device manager agent stopped");
    }

    pub fn local_device(&self) -> Arc<RwLock<DeviceInfo>> {
        Arc::clone(&self.local_device)
    }

    fn init_local_node_info(&self) -> Result<(), AgentError> {
        let info = self.device_sdk.get_local_device_info()?;
        *self.local_device.write() = info;
        Ok(())
    }

    fn post_cmd(&self, cmd: Command<DmCmd>) {
        match self.handle.lock().as_ref() {
            Some(handle) => handle.recv(cmd),
            None => warn!("device manager not started, command dropped"),
        }
    }

    // === Group membership ===

    async fn join_group_inner(&self, mp: &Arc<MountPoint>) -> Result<(), AgentError> {
        let agent = {
            let mut state = self.state.lock();
            if state.mp_to_networks.contains_key(&mp.id()) {
                return Err(AgentError::GroupExists(mp.to_string()));
            }
            let agent = (self.agent_factory)(Arc::clone(mp));
            state.mp_to_networks.insert(mp.id(), Arc::clone(&agent));
            agent
        };
        agent.start()?;
        info!("joined group for {mp}");
        Ok(())
    }

    /// Every agent gets the disconnect broadcast before the map entry goes
    /// away; erasing first would drop the in-flight disconnect commands.
    async fn quit_group_inner(&self, mp: &Arc<MountPoint>) -> Result<(), AgentError> {
        self.offline_all_device();

        let agent = self
            .state
            .lock()
            .mp_to_networks
            .remove(&mp.id())
            .ok_or_else(|| AgentError::GroupMissing(mp.to_string()))?;
        agent.stop().await;
        info!("quit group for {mp}");
        Ok(())
    }

    /// Broadcast "disconnect everything" to every agent
    pub fn offline_all_device(&self) {
        let state = self.state.lock();
        for agent in state.mp_to_networks.values() {
            agent.post(Command::once(AgentCmd::DisconnectAllDevices));
        }
    }

    pub fn reconnect_online_devices(&self) {
        let state = self.state.lock();
        for agent in state.mp_to_networks.values() {
            agent.post(Command::with_retry(
                AgentCmd::ConnectOnlineDevices,
                MAX_RETRY_COUNT,
            ));
        }
    }

    // === Trust classification ===

    /// A peer is in scope only when its profile reports a compatible OS;
    /// everything else is silently skipped, not an error.
    fn is_support_device(&self, udid: &str) -> bool {
        match self.profile_sdk.get_os_type(udid) {
            Ok(os_type) if os_type == SUPPORTED_OS_TYPE => true,
            Ok(os_type) => {
                info!("device {udid} runs os_type {os_type}, out of scope");
                false
            }
            Err(e) => {
                info!("no profile for {udid} ({e}), out of scope");
                false
            }
        }
    }

    fn query_related_groups(&self, udid: &str) -> Vec<GroupInfo> {
        match self.profile_sdk.get_related_groups(udid) {
            Ok(json) => parse_group_list(&json),
            Err(e) => {
                warn!("trust group query for {udid} failed: {e}");
                Vec::new()
            }
        }
    }

    /// Accountless vs. same-account decision. The parameter-driven path is
    /// the platform's current behavior; the group-type path inspects the
    /// peer's trust groups and is selected by configuration.
    fn check_is_accountless(&self, groups: &[GroupInfo]) -> bool {
        if !self.config.classify_by_group_type {
            return self.config.accountless_parameter;
        }
        !groups.iter().any(GroupInfo::is_same_account)
    }

    fn find_network_base_trust_relation(
        &self,
        accountless: bool,
    ) -> Option<Arc<dyn NetworkAgentOps>> {
        self.state
            .lock()
            .mp_to_networks
            .values()
            .find(|agent| agent.mount_point().is_account_less() == accountless)
            .cloned()
    }

    fn resolve_udid(&self, info: &DeviceInfo) -> Option<String> {
        if let Some(udid) = info.udid() {
            return Some(udid.to_string());
        }
        let cid = info.cid().ok()?;
        self.device_sdk.get_udid_by_network_id(cid).ok()
    }

    /// Classify a peer and bind it to an agent; returns the bound agent.
    fn bind_network_for_device(&self, info: &DeviceInfo) -> Option<Arc<dyn NetworkAgentOps>> {
        let cid = info.cid().ok()?.to_string();
        let udid = self.resolve_udid(info)?;

        if !self.is_support_device(&udid) {
            return None;
        }

        let groups = self.query_related_groups(&udid);
        let accountless = self.check_is_accountless(&groups);
        let Some(agent) = self.find_network_base_trust_relation(accountless) else {
            warn!("no network agent for accountless={accountless}, cid {cid}");
            return None;
        };

        let network_type = self
            .device_sdk
            .get_network_type_by_network_id(&cid)
            .unwrap_or_default();

        let mut state = self.state.lock();
        state.cid_net_type_record.insert(cid.clone(), Arc::clone(&agent));
        state.cid_network_type.insert(cid, network_type);
        Some(agent)
    }

    fn recorded_agent(&self, cid: &str) -> Option<Arc<dyn NetworkAgentOps>> {
        self.state.lock().cid_net_type_record.get(cid).cloned()
    }

    // === Docs-mount reference counting ===

    /// Returns true when a docs mount for this device is already in place,
    /// in which case only the count moves.
    fn mount_dfs_count_only(&self, device_id: &str) -> bool {
        let mut counts = self.mount_dfs_count.lock();
        let count = counts.entry(device_id.to_string()).or_insert(0);
        let already = *count >= MOUNT_DFS_COUNT_ONE;
        *count += 1;
        debug!("docs-mount count for {device_id} now {count}");
        already
    }

    /// Returns true when other links still need the docs mount and only the
    /// count should move; `need_clear` drops the entry unconditionally.
    fn umount_dfs_count_only(&self, device_id: &str, need_clear: bool) -> bool {
        let mut counts = self.mount_dfs_count.lock();
        if need_clear {
            counts.remove(device_id);
            return false;
        }
        match counts.get_mut(device_id) {
            Some(count) if *count > MOUNT_DFS_COUNT_ONE => {
                *count -= 1;
                debug!("docs-mount count for {device_id} now {count}");
                true
            }
            _ => {
                counts.remove(device_id);
                false
            }
        }
    }

    /// Reference-counted wrapper around the storage manager's docs-mount
    /// RPC. RPC failures are logged and do not unwind the count: the count
    /// tracks local intent, not confirmed kernel state.
    pub fn mount_dfs_docs(&self, network_id: &str, device_id: &str) {
        if self.mount_dfs_count_only(device_id) {
            info!("docs for {device_id} already mounted, count only");
            return;
        }
        if let Err(e) =
            self.storage_mgr
                .mount_dfs_docs(self.config.user_id, device_id, network_id, device_id)
        {
            warn!("MountDfsDocs rpc failed: {e}");
        }
    }

    pub fn umount_dfs_docs(&self, network_id: &str, device_id: &str, need_clear: bool) {
        if self.umount_dfs_count_only(device_id, need_clear) {
            info!("docs for {device_id} still referenced, count only");
            return;
        }
        if let Err(e) =
            self.storage_mgr
                .umount_dfs_docs(self.config.user_id, device_id, network_id, device_id)
        {
            warn!("UMountDfsDocs rpc failed: {e}");
        }
    }

    // === Listener registry ===

    /// Register a caller's status listener; a second registration for the
    /// same token is refused, not overwritten.
    pub fn add_remote_reverse_obj(
        &self,
        token: u32,
        listener: Arc<dyn FileDfsListener>,
    ) -> Result<(), AgentError> {
        let mut registry = self.listeners.lock();
        if registry.app_call_connect.contains_key(&token) {
            return Err(AgentError::ListenerExists(token));
        }
        registry.app_call_connect.insert(token, listener);
        Ok(())
    }

    pub fn remove_remote_reverse_obj(&self, token: u32) {
        self.listeners.lock().app_call_connect.remove(&token);
    }

    /// Token a listener object was registered under, if any
    pub fn find_listener_by_object(&self, listener: &Arc<dyn FileDfsListener>) -> Option<u32> {
        self.listeners
            .lock()
            .app_call_connect
            .iter()
            .find(|(_, l)| Arc::ptr_eq(l, listener))
            .map(|(token, _)| *token)
    }

    pub fn add_network_id(&self, token: u32, network_id: impl Into<String>) {
        self.listeners
            .lock()
            .network_id_map
            .entry(token)
            .or_default()
            .insert(network_id.into());
    }

    pub fn remove_network_id(&self, token: u32) {
        self.listeners.lock().network_id_map.remove(&token);
    }

    fn remove_network_id_for_all_token(&self, network_id: &str) {
        let mut registry = self.listeners.lock();
        registry.network_id_map.retain(|_, set| {
            set.remove(network_id);
            !set.is_empty()
        });
    }

    fn notify_listeners_offline(&self, network_id: &str) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .app_call_connect
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener.on_status(network_id, DfsStatus::Offline);
        }
    }

    /// Test/introspection hook: networkIds a token is interested in
    pub fn network_ids(&self, token: u32) -> HashSet<String> {
        self.listeners
            .lock()
            .network_id_map
            .get(&token)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Handler for DeviceManagerAgent {
    type Cmd = DmCmd;

    async fn handle(&self, cmd: &DmCmd) -> Result<(), AgentError> {
        match cmd {
            DmCmd::JoinGroup(mp) => self.join_group_inner(mp).await,
            DmCmd::QuitGroup(mp) => self.quit_group_inner(mp).await,
            DmCmd::OfflineAllDevice => {
                self.offline_all_device();
                Ok(())
            }
            DmCmd::ReconnectOnlineDevices => {
                self.reconnect_online_devices();
                Ok(())
            }
        }
    }
}

impl GroupNotifier for DeviceManagerAgent {
    fn join_group(&self, mp: Arc<MountPoint>) {
        self.post_cmd(Command::once(DmCmd::JoinGroup(mp)));
    }

    fn quit_group(&self, mp: Arc<MountPoint>) {
        self.post_cmd(Command::once(DmCmd::QuitGroup(mp)));
    }
}

impl DeviceStateCallback for DeviceManagerAgent {
    fn on_device_ready(&self, info: DeviceInfo) {
        let Ok(cid) = info.cid().map(str::to_string) else {
            warn!("device ready without cid, ignored");
            return;
        };
        info!("OnDeviceReady, cid {cid}");

        let Some(agent) = self.bind_network_for_device(&info) else {
            return;
        };

        let wifi = self
            .state
            .lock()
            .cid_network_type
            .get(&cid)
            .copied()
            .unwrap_or_default()
            .is_wifi_capable();
        if wifi {
            agent.post(Command::with_retry(
                AgentCmd::ConnectDevice(info),
                MAX_RETRY_COUNT,
            ));
        } else {
            info!("cid {cid} not wifi-capable yet, waiting for a change event");
        }
    }

    fn on_device_offline(&self, info: DeviceInfo) {
        let Ok(cid) = info.cid().map(str::to_string) else {
            warn!("device offline without cid, ignored");
            return;
        };
        info!("OnDeviceOffline, cid {cid}");

        if let Some(agent) = self.recorded_agent(&cid) {
            agent.post(Command::once(AgentCmd::DisconnectDevice(info.clone())));
            agent.post(Command::once(AgentCmd::DisconnectDeviceByP2pHmdfs(
                info.clone(),
            )));
        }

        // the callback may omit the physical id; fall back to the directory
        let device_id = self.resolve_udid(&info).unwrap_or_else(|| cid.clone());

        self.notify_listeners_offline(&cid);
        self.umount_dfs_docs(&cid, &device_id, true);
        self.remove_network_id_for_all_token(&cid);

        let mut state = self.state.lock();
        state.cid_net_type_record.remove(&cid);
        state.cid_network_type.remove(&cid);
    }

    fn on_device_changed(&self, info: DeviceInfo) {
        let Ok(cid) = info.cid().map(str::to_string) else {
            return;
        };
        let new_type = match self.device_sdk.get_network_type_by_network_id(&cid) {
            Ok(t) => t,
            Err(e) => {
                warn!("network type query for {cid} failed: {e}");
                return;
            }
        };

        let (old_type, agent) = {
            let mut state = self.state.lock();
            let old = state
                .cid_network_type
                .insert(cid.clone(), new_type)
                .unwrap_or_default();
            (old, state.cid_net_type_record.get(&cid).cloned())
        };

        if old_type == new_type {
            debug!("network type for {cid} unchanged ({:#x})", new_type.0);
            return;
        }
        let Some(agent) = agent else {
            return;
        };

        match (old_type.is_wifi_capable(), new_type.is_wifi_capable()) {
            (false, true) => {
                info!("cid {cid} gained wifi, connecting");
                agent.post(Command::with_retry(
                    AgentCmd::ConnectDevice(info),
                    MAX_RETRY_COUNT,
                ));
            }
            (true, false) => {
                info!("cid {cid} lost wifi, disconnecting");
                agent.post(Command::once(AgentCmd::DisconnectDevice(info)));
            }
            _ => {}
        }
    }

    fn on_remote_died(&self) {
        warn!("platform device manager died, resetting links");
        self.offline_all_device();
        self.reconnect_online_devices();
    }
}

impl DeviceManagerAgent {
    /// P2P twin of the ready path, independent of the wifi gate
    pub fn on_device_p2p_online(&self, info: &DeviceInfo) -> Result<(), AgentError> {
        let cid = info
            .cid()
            .map_err(|_| AgentError::Domain("cid unset".into()))?
            .to_string();
        info!("OnDeviceP2POnline, cid {cid}");

        let agent = match self.recorded_agent(&cid) {
            Some(agent) => agent,
            None => self
                .bind_network_for_device(info)
                .ok_or_else(|| AgentError::Domain(format!("no agent bound for {cid}")))?,
        };
        agent.post(Command::with_retry(
            AgentCmd::ConnectDeviceByP2p(info.clone()),
            MAX_RETRY_COUNT,
        ));
        Ok(())
    }

    pub fn on_device_p2p_offline(&self, info: &DeviceInfo) -> Result<(), AgentError> {
        let cid = info
            .cid()
            .map_err(|_| AgentError::Domain("cid unset".into()))?
            .to_string();
        info!("OnDeviceP2POffline, cid {cid}");

        if let Some(agent) = self.recorded_agent(&cid) {
            agent.post(Command::once(AgentCmd::DisconnectDeviceByP2p(info.clone())));
        }
        let mut state = self.state.lock();
        state.cid_net_type_record.remove(&cid);
        state.cid_network_type.remove(&cid);
        Ok(())
    }

    /// Every device currently trusted by the platform
    pub fn get_remote_devices_info(&self) -> Result<Vec<DeviceInfo>, AgentError> {
        Ok(self.device_sdk.get_trusted_device_list()?)
    }
}
