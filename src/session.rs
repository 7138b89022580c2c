// session.rs - Session orchestration over the pooled connections
//
// A session couples a caller-visible identifier with an endpoint pool, a
// background keep-alive task, and accumulated diagnostics. Operations on a
// session are serialized FIFO through its dispatch lock; the heartbeat
// shares that lock, so a session never holds two connections at once.
//
// Shared tables are each behind one coarse lock, taken in the order
// configuration store -> session table -> pool table, and never held
// across an await.

use crate::config::{Endpoint, LinkConfig};
use crate::connection::{Connection, ConnectionState};
use crate::epath::CipPath;
use crate::error::{EnipLinkError, Result};
use crate::pool::ConnectionPool;
use crate::registry::{AssemblyRegistry, ConfigStore, DeviceConfiguration};
use crate::status::CipStatus;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Consecutive heartbeat failures tolerated before the connection is
/// declared dead and re-establishment starts.
const HEARTBEAT_FAILURE_LIMIT: u32 = 3;

/// Caller-visible snapshot of the logical connection behind a session.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub enip_session_handle: u32,
    pub o_t_connection_id: u32,
    pub t_o_connection_id: u32,
    pub sequence_count: u16,
    pub last_status: CipStatus,
}

/// Diagnostics surface returned for a session; maps 1:1 onto the REST
/// representation.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    pub session_id: String,
    pub connection: ConnectionStatus,
    pub host: String,
    pub port: u16,
    pub keep_alive_pattern_hex: String,
    pub keep_alive_active: bool,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct DiagState {
    connected: bool,
    enip_session_handle: u32,
    o_t_connection_id: u32,
    t_o_connection_id: u32,
    sequence_count: u16,
    last_status: CipStatus,
    last_activity: DateTime<Utc>,
    keep_alive_active: bool,
    closed: bool,
}

/// One live session. Held in the orchestrator table behind an `Arc`; the
/// heartbeat task only ever reaches it through the table, by id.
#[derive(Debug)]
pub(crate) struct SessionHandle {
    id: String,
    endpoint: Endpoint,
    pool: ConnectionPool,
    /// FIFO dispatch lock: caller operations and the heartbeat serialize
    /// here, so submission order is completion order.
    io_lock: tokio::sync::Mutex<()>,
    diag: Mutex<DiagState>,
    hb_stop: watch::Sender<bool>,
}

impl SessionHandle {
    fn is_closed(&self) -> bool {
        self.diag.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(EnipLinkError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn sync_from_connection(&self, conn: &Connection) {
        let mut diag = self.diag.lock().unwrap_or_else(|e| e.into_inner());
        diag.connected = conn.state() == ConnectionState::Connected;
        diag.enip_session_handle = conn.session_handle();
        diag.o_t_connection_id = conn.o_t_connection_id();
        diag.t_o_connection_id = conn.t_o_connection_id();
        diag.sequence_count = conn.sequence_count();
        diag.last_activity = Utc::now();
    }

    fn record_status(&self, status: CipStatus) {
        let mut diag = self.diag.lock().unwrap_or_else(|e| e.into_inner());
        diag.last_status = status;
        diag.last_activity = Utc::now();
    }

    fn record_failure(&self, fatal: bool) {
        let mut diag = self.diag.lock().unwrap_or_else(|e| e.into_inner());
        if fatal {
            diag.connected = false;
        }
        diag.last_activity = Utc::now();
    }

    fn set_keep_alive(&self, active: bool) {
        let mut diag = self.diag.lock().unwrap_or_else(|e| e.into_inner());
        diag.keep_alive_active = active;
    }

    fn mark_closed(&self) {
        let mut diag = self.diag.lock().unwrap_or_else(|e| e.into_inner());
        diag.closed = true;
        diag.connected = false;
        diag.keep_alive_active = false;
    }
}

#[derive(Debug)]
pub(crate) struct ManagerInner {
    config: LinkConfig,
    store: ConfigStore,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    pools: Mutex<HashMap<Endpoint, ConnectionPool>>,
}

/// The session orchestrator: owns the session table, the per-endpoint pool
/// table and the loaded device configuration. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Single constructor; all process-level defaults arrive in `config`.
    pub fn new(config: LinkConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                store: ConfigStore::new(),
                sessions: Mutex::new(HashMap::new()),
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Parse and install a device configuration document.
    pub fn put_configuration(&self, xml: &str) -> Result<DeviceConfiguration> {
        let configuration = self.inner.store.load(xml)?;
        info!(
            assemblies = configuration.assemblies.len(),
            "device configuration loaded"
        );
        Ok(configuration)
    }

    /// The raw XML of the currently loaded configuration, if any.
    pub fn get_configuration(&self) -> Option<String> {
        self.inner.store.configuration_xml()
    }

    pub(crate) fn registry(&self) -> Arc<AssemblyRegistry> {
        self.inner.store.registry()
    }

    /// Open a session against the default endpoint or a per-call override.
    ///
    /// Verifies the pooled connection reaches `Connected`, starts the
    /// keep-alive task and returns the initial diagnostics snapshot.
    pub async fn open_session(
        &self,
        host: Option<&str>,
        port: Option<u16>,
    ) -> Result<SessionDiagnostics> {
        let endpoint = self.inner.config.resolve_endpoint(host, port);
        let pool = self.pool_for(&endpoint);
        let lease = pool
            .acquire(self.inner.config.operation_deadline)
            .await?;

        let id = new_session_id();
        let (hb_stop, hb_rx) = watch::channel(false);
        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            endpoint: endpoint.clone(),
            pool,
            io_lock: tokio::sync::Mutex::new(()),
            diag: Mutex::new(DiagState {
                connected: lease.state() == ConnectionState::Connected,
                enip_session_handle: lease.session_handle(),
                o_t_connection_id: lease.o_t_connection_id(),
                t_o_connection_id: lease.t_o_connection_id(),
                sequence_count: lease.sequence_count(),
                last_status: CipStatus::SUCCESS,
                last_activity: Utc::now(),
                keep_alive_active: true,
                closed: false,
            }),
            hb_stop,
        });
        drop(lease);

        {
            let mut sessions = self
                .inner
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            sessions.insert(id.clone(), Arc::clone(&handle));
        }

        tokio::spawn(heartbeat_loop(
            Arc::downgrade(&self.inner),
            id.clone(),
            hb_rx,
            self.inner.config.clone(),
        ));

        info!(session = %id, endpoint = %endpoint, "session opened");
        Ok(self.diagnostics_for(&handle))
    }

    /// Close a session: stop the heartbeat, mark the handle closed and drop
    /// the table entry. Closing an already-closed session is a no-op.
    ///
    /// Pooled connections are deliberately left alone. They are shared by
    /// every session on the endpoint and outlive any one of them; broken
    /// ones are reaped lazily by `acquire`, and full teardown (Forward
    /// Close + UnregisterSession) happens only when the pool is drained.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let handle = {
            let mut sessions = self
                .inner
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            sessions.remove(session_id)
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        let _ = handle.hb_stop.send(true);
        handle.mark_closed();
        info!(session = %session_id, "session closed");
        Ok(())
    }

    pub fn get_diagnostics(&self, session_id: &str) -> Result<SessionDiagnostics> {
        let handle = self.require_session(session_id)?;
        Ok(self.diagnostics_for(&handle))
    }

    /// Ids of all live sessions.
    pub fn session_ids(&self) -> Vec<String> {
        let sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        sessions.keys().cloned().collect()
    }

    /// Close every session and drain every pool.
    pub async fn shutdown(&self) {
        for id in self.session_ids() {
            let _ = self.close_session(&id).await;
        }
        let pools: Vec<ConnectionPool> = {
            let mut table = self.inner.pools.lock().unwrap_or_else(|e| e.into_inner());
            table.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.drain().await;
        }
    }

    /// One Class 3 connected exchange on behalf of a session.
    pub(crate) async fn dispatch_unit(
        &self,
        session_id: &str,
        service: u8,
        path: CipPath,
        payload: Vec<u8>,
    ) -> Result<(CipStatus, Vec<u8>)> {
        self.dispatch(session_id, Exchange::Unit, service, path, payload)
            .await
    }

    /// One unconnected exchange (optionally routed through Unconnected
    /// Send) on behalf of a session.
    pub(crate) async fn dispatch_rr(
        &self,
        session_id: &str,
        service: u8,
        path: CipPath,
        payload: Vec<u8>,
        routed: bool,
    ) -> Result<(CipStatus, Vec<u8>)> {
        self.dispatch(
            session_id,
            Exchange::Rr { routed },
            service,
            path,
            payload,
        )
        .await
    }

    async fn dispatch(
        &self,
        session_id: &str,
        exchange: Exchange,
        service: u8,
        path: CipPath,
        payload: Vec<u8>,
    ) -> Result<(CipStatus, Vec<u8>)> {
        let handle = self.require_session(session_id)?;
        handle.ensure_open()?;
        let _io = handle.io_lock.lock().await;
        // The session may have closed while this call queued.
        handle.ensure_open()?;

        let mut lease = handle
            .pool
            .acquire(self.inner.config.operation_deadline)
            .await?;
        let deadline = Instant::now() + self.inner.config.operation_deadline;
        let result = match exchange {
            Exchange::Unit => lease.request_unit(service, path, payload, deadline).await,
            Exchange::Rr { routed } => {
                lease
                    .request_rr(service, path, payload, routed, deadline)
                    .await
            }
        };
        match &result {
            Ok((status, _)) => {
                handle.sync_from_connection(&lease);
                handle.record_status(*status);
            }
            Err(err) => {
                let fatal = err.is_connection_fatal();
                if fatal {
                    lease.mark_broken();
                }
                handle.record_failure(fatal);
            }
        }
        result
    }

    pub(crate) fn require_session(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        let sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| EnipLinkError::UnknownSession(session_id.to_string()))
    }

    fn diagnostics_for(&self, handle: &SessionHandle) -> SessionDiagnostics {
        let diag = handle.diag.lock().unwrap_or_else(|e| e.into_inner()).clone();
        SessionDiagnostics {
            session_id: handle.id.clone(),
            connection: ConnectionStatus {
                connected: diag.connected,
                enip_session_handle: diag.enip_session_handle,
                o_t_connection_id: diag.o_t_connection_id,
                t_o_connection_id: diag.t_o_connection_id,
                sequence_count: diag.sequence_count,
                last_status: diag.last_status,
            },
            host: handle.endpoint.host.clone(),
            port: handle.endpoint.port,
            keep_alive_pattern_hex: hex::encode(&self.inner.config.keep_alive_pattern),
            keep_alive_active: diag.keep_alive_active,
            last_activity: diag.last_activity,
        }
    }

    fn pool_for(&self, endpoint: &Endpoint) -> ConnectionPool {
        let mut pools = self.inner.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools
            .entry(endpoint.clone())
            .or_insert_with(|| {
                ConnectionPool::new(
                    endpoint.clone(),
                    self.inner.config.pool_size,
                    self.inner.config.read_timeout,
                )
            })
            .clone()
    }
}

#[derive(Debug, Clone, Copy)]
enum Exchange {
    Unit,
    Rr { routed: bool },
}

/// Random, URL-safe session identifier with 128 bits of entropy.
fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Background keep-alive task.
///
/// Holds only the session id and a weak handle to the orchestrator state;
/// when either disappears the task exits silently. Cancellation is
/// cooperative through a boolean signal checked before each sleep.
async fn heartbeat_loop(
    manager: Weak<ManagerInner>,
    session_id: String,
    mut stop: watch::Receiver<bool>,
    config: LinkConfig,
) {
    let mut failures: u32 = 0;
    loop {
        if *stop.borrow() {
            return;
        }
        tokio::select! {
            _ = sleep(config.heartbeat_interval) => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
                continue;
            }
        }

        let Some(inner) = manager.upgrade() else {
            return;
        };
        let handle = {
            let sessions = inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
            match sessions.get(&session_id) {
                Some(handle) => Arc::clone(handle),
                None => return,
            }
        };
        drop(inner);
        if handle.is_closed() {
            return;
        }

        match heartbeat_probe(&handle, &config).await {
            Ok(()) => {
                failures = 0;
                handle.set_keep_alive(true);
            }
            Err(err) => {
                failures += 1;
                warn!(
                    session = %session_id,
                    consecutive = failures,
                    error = %err,
                    "keep-alive probe failed"
                );
                if failures >= HEARTBEAT_FAILURE_LIMIT {
                    handle.set_keep_alive(false);
                    if reestablish(&handle, &config).await {
                        failures = 0;
                        handle.set_keep_alive(true);
                        info!(session = %session_id, "connection re-established");
                    } else {
                        handle.mark_closed();
                        warn!(
                            session = %session_id,
                            "session closed after re-establishment gave up"
                        );
                        return;
                    }
                }
            }
        }
    }
}

/// One keep-alive beat. A Class 3 connection gets a ListServices
/// request/reply so a dead peer trips the read deadline; otherwise the
/// opaque pattern goes out as a NOP.
async fn heartbeat_probe(handle: &SessionHandle, config: &LinkConfig) -> Result<()> {
    let _io = handle.io_lock.lock().await;
    handle.ensure_open()?;
    let mut lease = handle.pool.acquire(config.read_timeout).await?;
    let deadline = Instant::now() + config.read_timeout;
    let result = if lease.state() == ConnectionState::Connected {
        lease.probe_services(deadline).await
    } else {
        lease.send_nop(&config.keep_alive_pattern).await
    };
    match &result {
        Ok(()) => handle.sync_from_connection(&lease),
        Err(err) => {
            if err.is_connection_fatal() {
                lease.mark_broken();
            }
        }
    }
    result
}

/// Retry loop after the heartbeat declared the connection dead: capped
/// exponential backoff, a bounded number of attempts, success means a
/// `Connected` lease came back out of the pool.
async fn reestablish(handle: &SessionHandle, config: &LinkConfig) -> bool {
    for attempt in 0..config.reconnect_retries {
        let backoff = config.reconnect_backoff * (1u32 << attempt.min(4));
        sleep(backoff).await;
        if handle.is_closed() {
            return false;
        }
        match handle.pool.acquire(config.operation_deadline).await {
            Ok(lease) => {
                if lease.state() == ConnectionState::Connected {
                    handle.sync_from_connection(&lease);
                    return true;
                }
            }
            Err(err) => {
                debug!(
                    session = %handle.id,
                    attempt = attempt + 1,
                    error = %err,
                    "re-establishment attempt failed"
                );
            }
        }
    }
    false
}
