//! TCP link provider
//!
//! The shipping `LinkProvider`: plain TCP sockets whose fd can be handed to
//! the in-kernel hmdfs driver. Session setup is a symmetric exchange of the
//! 64-byte cid field and the 32-byte session master key — the opener
//! generates the key, the acceptor adopts it. This is the LAN/dev-grade
//! transport; deployments with a platform connection bus plug their own
//! provider in instead.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use hmdfsd_core::{cid_from_buf, copy_cid, AgentError, DeviceInfo, LinkType, CID_MAX_LEN, KEY_MAX_LEN};

use crate::network_agent::{LinkProvider, SessionAcceptor};
use crate::platform::StaticPlatform;
use crate::session::Session;

/// cid → socket address lookup for outbound opens
pub trait PeerResolver: Send + Sync {
    fn resolve(&self, cid: &str) -> Option<SocketAddr>;
}

impl PeerResolver for StaticPlatform {
    fn resolve(&self, cid: &str) -> Option<SocketAddr> {
        self.peer(cid).and_then(|p| p.address.parse().ok())
    }
}

static NEXT_SESSION_ID: AtomicI32 = AtomicI32::new(1);

/// One established TCP link to a peer
pub struct TcpSession {
    stream: Mutex<Option<TcpStream>>,
    fd: RawFd,
    cid: String,
    key: [u8; KEY_MAX_LEN],
    id: i32,
    from_server: bool,
    listener_enabled: AtomicBool,
}

impl TcpSession {
    fn new(stream: TcpStream, cid: String, key: [u8; KEY_MAX_LEN], from_server: bool) -> Self {
        Self {
            fd: stream.as_raw_fd(),
            stream: Mutex::new(Some(stream)),
            cid,
            key,
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            from_server,
            listener_enabled: AtomicBool::new(true),
        }
    }
}

impl Session for TcpSession {
    fn is_from_server(&self) -> bool {
        self.from_server
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
        &self.key
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ap
    }

    fn release(&self) {
        let mut slot = self.stream.lock();
        if let Some(stream) = slot.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("shutdown of session {} failed: {e}", self.id);
            }
        }
    }

    fn disable_listener(&self) {
        self.listener_enabled.store(false, Ordering::SeqCst);
    }
}

struct ListenerState {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    port: u16,
}

pub struct TcpLinkProvider {
    local_cid: String,
    listen_port: u16,
    connect_timeout: Duration,
    resolver: Arc<dyn PeerResolver>,
    listener: Mutex<Option<ListenerState>>,
}

impl TcpLinkProvider {
    pub fn new(
        local_cid: impl Into<String>,
        listen_port: u16,
        connect_timeout: Duration,
        resolver: Arc<dyn PeerResolver>,
    ) -> Self {
        Self {
            local_cid: local_cid.into(),
            listen_port,
            connect_timeout,
            resolver,
            listener: Mutex::new(None),
        }
    }

    /// Port the accept loop is bound to, once the domain is joined
    pub fn local_port(&self) -> Option<u16> {
        self.listener.lock().as_ref().map(|l| l.port)
    }

    fn accept_loop(
        listener: TcpListener,
        local_cid: String,
        acceptor: SessionAcceptor,
        stop: Arc<AtomicBool>,
    ) {
        while !stop.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("inbound link from {peer}");
                    match accept_handshake(stream, &local_cid) {
                        Ok(session) => acceptor(Arc::new(session)),
                        Err(e) => warn!("inbound handshake failed: {e}"),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
        }
        debug!("accept loop exited");
    }
}

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

fn opener_handshake(
    mut stream: TcpStream,
    local_cid: &str,
    expected_cid: &str,
) -> Result<TcpSession, AgentError> {
    let io_err = |e: std::io::Error| AgentError::OpenSession {
        cid: expected_cid.to_string(),
        reason: e.to_string(),
    };

    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).map_err(io_err)?;
    stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT)).map_err(io_err)?;

    let cid_buf = copy_cid(local_cid).map_err(|e| AgentError::OpenSession {
        cid: expected_cid.to_string(),
        reason: e.to_string(),
    })?;
    let mut key = [0u8; KEY_MAX_LEN];
    getrandom::getrandom(&mut key).map_err(|e| AgentError::OpenSession {
        cid: expected_cid.to_string(),
        reason: e.to_string(),
    })?;

    stream.write_all(&cid_buf).map_err(io_err)?;
    stream.write_all(&key).map_err(io_err)?;

    let mut peer_cid_buf = [0u8; CID_MAX_LEN];
    stream.read_exact(&mut peer_cid_buf).map_err(io_err)?;
    let peer_cid = cid_from_buf(&peer_cid_buf);
    if peer_cid != expected_cid {
        return Err(AgentError::OpenSession {
            cid: expected_cid.to_string(),
            reason: format!("peer identified as {peer_cid}"),
        });
    }

    stream.set_read_timeout(None).ok();
    stream.set_write_timeout(None).ok();
    Ok(TcpSession::new(stream, peer_cid, key, false))
}

fn accept_handshake(mut stream: TcpStream, local_cid: &str) -> Result<TcpSession, AgentError> {
    let io_err = |e: std::io::Error| AgentError::Domain(e.to_string());

    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).map_err(io_err)?;
    stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT)).map_err(io_err)?;

    let mut peer_cid_buf = [0u8; CID_MAX_LEN];
    stream.read_exact(&mut peer_cid_buf).map_err(io_err)?;
    let mut key = [0u8; KEY_MAX_LEN];
    stream.read_exact(&mut key).map_err(io_err)?;

    let cid_buf = copy_cid(local_cid).map_err(|e| AgentError::Domain(e.to_string()))?;
    stream.write_all(&cid_buf).map_err(io_err)?;

    stream.set_read_timeout(None).ok();
    stream.set_write_timeout(None).ok();
    Ok(TcpSession::new(
        stream,
        cid_from_buf(&peer_cid_buf),
        key,
        true,
    ))
}

impl LinkProvider for TcpLinkProvider {
    fn join_domain(&self, acceptor: SessionAcceptor) -> Result<(), AgentError> {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            return Err(AgentError::Domain("domain already joined".into()));
        }

        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .map_err(|e| AgentError::Domain(format!("bind failed: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| AgentError::Domain(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| AgentError::Domain(e.to_string()))?
            .port();

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let local_cid = self.local_cid.clone();
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("hmdfs-accept".into())
                .spawn(move || Self::accept_loop(listener, local_cid, acceptor, stop))
                .map_err(|e| AgentError::Domain(e.to_string()))?
        };

        *slot = Some(ListenerState { stop, thread, port });
        info!("joined link domain on port {port}");
        Ok(())
    }

    fn quit_domain(&self) {
        if let Some(state) = self.listener.lock().take() {
            state.stop.store(true, Ordering::SeqCst);
            if state.thread.join().is_err() {
                error!("accept thread panicked");
            }
            info!("quit link domain");
        }
    }

    fn open_session(
        &self,
        info: &DeviceInfo,
        link_type: LinkType,
    ) -> Result<Arc<dyn Session>, AgentError> {
        let cid = info
            .cid()
            .map_err(|_| AgentError::Domain("cid unset".into()))?;
        let addr = self.resolver.resolve(cid).ok_or_else(|| AgentError::OpenSession {
            cid: cid.to_string(),
            reason: "no address for peer".into(),
        })?;

        debug!("opening {link_type} session to {cid} at {addr}");
        let stream =
            TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|e| {
                AgentError::OpenSession {
                    cid: cid.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let session = opener_handshake(stream, &self.local_cid, cid)?;
        info!(
            "opened session {} to {cid}, fd {}",
            session.session_id(),
            session.handle()
        );
        Ok(Arc::new(session))
    }

    fn close_session(&self, session: &dyn Session) {
        session.release();
    }
}
