//! Host session management.
//!
//! The host owns a TCP listener that worker processes connect to. Each
//! accepted socket becomes a [`WorkerConnection`], which assigns request ids,
//! keeps the id → waiting caller table and routes responses back by id, in
//! whatever order they arrive. [`SessionManager`] owns the listener, the
//! worker processes and the set of live connections, and hands each request
//! to the least-loaded ready connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::BridgeError;
use crate::process::WorkerProcess;
use crate::transport::protocol::{
    Request, RequestId, RequestKind, ReservedId, Response, Status, PONG,
};
use crate::transport::{Frame, JsonLinesCodec};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Waiter = oneshot::Sender<Result<Response, BridgeError>>;

/// Lifecycle of one worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, readiness not announced yet.
    Connected,
    /// The worker sent its `INITIALIZED` response.
    Ready,
    /// EOF, read error or explicit close. Terminal.
    Closed,
}

/// Waiters keyed by request id. Each entry carries the token of the
/// registration that created it.
#[derive(Default)]
struct Pending {
    waiters: HashMap<RequestId, (u64, Waiter)>,
    next_token: u64,
    closed: bool,
}

/// One connected worker.
pub struct WorkerConnection {
    id: u64,
    /// Listener port, echoed in every request.
    port: u16,
    writer: Mutex<FramedWrite<BoxedWriter, JsonLinesCodec<Request>>>,
    pending: StdMutex<Pending>,
    state: watch::Sender<ConnectionState>,
    reader: StdMutex<Option<AbortHandle>>,
}

impl WorkerConnection {
    /// Wrap an accepted stream and start routing its responses.
    pub fn attach<S>(id: u64, stream: S, port: u16, max_frame_length: usize) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(
            Box::new(read_half) as BoxedReader,
            JsonLinesCodec::<Response>::with_max_frame_length(max_frame_length),
        );
        let writer = FramedWrite::new(
            Box::new(write_half) as BoxedWriter,
            JsonLinesCodec::<Request>::with_max_frame_length(max_frame_length),
        );

        let (state, _) = watch::channel(ConnectionState::Connected);
        let conn = Arc::new(Self {
            id,
            port,
            writer: Mutex::new(writer),
            pending: StdMutex::new(Pending::default()),
            state,
            reader: StdMutex::new(None),
        });

        let task = tokio::spawn(Arc::clone(&conn).read_loop(reader));
        if let Ok(mut slot) = conn.reader.lock() {
            *slot = Some(task.abort_handle());
        }
        conn
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().map_or(0, |p| p.waiters.len())
    }

    /// Wait until the worker announces readiness.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), BridgeError> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s != ConnectionState::Connected),
        )
        .await;

        match waited {
            Ok(Ok(state)) if *state == ConnectionState::Ready => Ok(()),
            Ok(_) => Err(BridgeError::ConnectionLost),
            Err(_) => Err(BridgeError::NoWorkerAvailable(timeout)),
        }
    }

    /// Send a request with a fresh id and wait for its response.
    pub async fn request(
        &self,
        kind: RequestKind,
        content: impl Into<String>,
        timeout: Duration,
    ) -> Result<Response, BridgeError> {
        self.request_with_id(RequestId::generate(), kind, content.into(), timeout)
            .await
    }

    /// Send a request under a caller-chosen id.
    ///
    /// Fails with `DuplicateId` if that id is still outstanding here and with
    /// `ReservedId` for the sentinel ids. Requests written before readiness
    /// are buffered by the transport and served once the worker is up.
    pub async fn request_with_id(
        &self,
        id: RequestId,
        kind: RequestKind,
        content: String,
        timeout: Duration,
    ) -> Result<Response, BridgeError> {
        if id.is_reserved() {
            return Err(ReservedId(id.to_string()).into());
        }

        let (token, rx) = self.register(&id)?;
        // removes the entry on timeout, write failure or caller cancellation
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
            token,
        };

        let request = Request::new(id.clone(), self.port, kind, content);
        debug!(connection = self.id, %id, %kind, "Sending request");

        // the deadline covers waiting for the writer and the write itself
        let exchange = async {
            if let Err(e) = self.writer.lock().await.send(request).await {
                return Err(BridgeError::from(e));
            }
            rx.await.unwrap_or(Err(BridgeError::ConnectionLost))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(connection = self.id, %id, ?timeout, "Request timed out");
                Err(BridgeError::Timeout {
                    id: id.clone(),
                    after: timeout,
                })
            }
        }
    }

    /// Load and run a code unit on the worker, returning its produced value.
    pub async fn execute(
        &self,
        specifier: &str,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        let resp = self.request(RequestKind::Execute, specifier, timeout).await?;
        match resp.status {
            Status::Success => Ok(resp.content),
            Status::Error => Err(BridgeError::Execution(resp.content)),
        }
    }

    /// Health check.
    pub async fn ping(&self, timeout: Duration) -> Result<(), BridgeError> {
        let resp = self.request(RequestKind::Ping, String::new(), timeout).await?;
        if resp.is_success() && resp.content == PONG {
            Ok(())
        } else {
            Err(BridgeError::Protocol(format!(
                "expected pong, got {:?}: {}",
                resp.status, resp.content
            )))
        }
    }

    /// Close the connection and fail everything still outstanding.
    pub async fn close(&self) {
        let abort = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(abort) = abort {
            abort.abort();
        }
        if let Err(e) = self.writer.lock().await.close().await {
            debug!(connection = self.id, error = %e, "Error closing connection");
        }
        self.fail_all();
    }

    fn register(
        &self,
        id: &RequestId,
    ) -> Result<(u64, oneshot::Receiver<Result<Response, BridgeError>>), BridgeError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| BridgeError::ConnectionLost)?;
        if pending.closed {
            return Err(BridgeError::ConnectionLost);
        }
        if pending.waiters.contains_key(id) {
            return Err(BridgeError::DuplicateId(id.clone()));
        }
        let (tx, rx) = oneshot::channel();
        pending.next_token += 1;
        let token = pending.next_token;
        pending.waiters.insert(id.clone(), (token, tx));
        Ok((token, rx))
    }

    async fn read_loop(self: Arc<Self>, mut reader: FramedRead<BoxedReader, JsonLinesCodec<Response>>) {
        loop {
            match reader.next().await {
                Some(Ok(Frame::Message(resp))) => self.route(resp),
                Some(Ok(Frame::Malformed(raw))) => {
                    warn!(connection = self.id, raw = %raw, "Undecodable frame from worker");
                }
                Some(Ok(Frame::Oversized { limit })) => {
                    warn!(connection = self.id, limit, "Oversized frame from worker");
                }
                Some(Err(e)) => {
                    warn!(connection = self.id, error = %e, "Worker connection error");
                    break;
                }
                None => {
                    debug!(connection = self.id, "Worker closed connection");
                    break;
                }
            }
        }
        self.fail_all();
    }

    fn route(&self, resp: Response) {
        if resp.is_ready() {
            let changed = self.state.send_if_modified(|state| {
                if *state == ConnectionState::Connected {
                    *state = ConnectionState::Ready;
                    true
                } else {
                    false
                }
            });
            if changed {
                info!(connection = self.id, "Worker ready");
            }
            return;
        }

        if resp.is_malformed_report() {
            warn!(connection = self.id, raw = %resp.content, "Worker could not parse a request");
            return;
        }

        let waiter = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.waiters.remove(&resp.id))
            .map(|(_, tx)| tx);
        match waiter {
            Some(tx) => {
                debug!(connection = self.id, id = %resp.id, status = ?resp.status, "Routing response");
                // receiver gone means the caller stopped waiting
                let _ = tx.send(Ok(resp));
            }
            None => {
                debug!(connection = self.id, id = %resp.id, "Dropping response nobody is waiting for");
            }
        }
    }

    fn fail_all(&self) {
        let waiters: Vec<Waiter> = match self.pending.lock() {
            Ok(mut pending) => {
                pending.closed = true;
                pending.waiters.drain().map(|(_, (_, tx))| tx).collect()
            }
            Err(_) => Vec::new(),
        };
        if !waiters.is_empty() {
            warn!(connection = self.id, outstanding = waiters.len(), "Failing outstanding requests");
        }
        for tx in waiters {
            let _ = tx.send(Err(BridgeError::ConnectionLost));
        }
        self.state.send_replace(ConnectionState::Closed);
    }
}

/// Removes its own registration, leaving a later one under the same id alone.
struct PendingGuard<'a> {
    pending: &'a StdMutex<Pending>,
    id: &'a RequestId,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            let owned = pending
                .waiters
                .get(self.id)
                .is_some_and(|(token, _)| *token == self.token);
            if owned {
                pending.waiters.remove(self.id);
            }
        }
    }
}

struct Shared {
    connections: RwLock<HashMap<u64, Arc<WorkerConnection>>>,
    /// Woken whenever a connection becomes ready.
    ready: Notify,
}

/// Owns the listener, the worker processes and the live connections.
pub struct SessionManager {
    config: HostConfig,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
    processes: Mutex<Vec<WorkerProcess>>,
    closed: AtomicBool,
}

impl SessionManager {
    /// Bind the listener and start accepting workers.
    pub async fn bind(config: HostConfig) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Listening for workers");

        let shared = Arc::new(Shared {
            connections: RwLock::new(HashMap::new()),
            ready: Notify::new(),
        });
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            local_addr.port(),
            config.max_frame_length,
        ));

        Ok(Self {
            config,
            local_addr,
            shared,
            accept_task,
            processes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Bind, spawn `config.processes` workers and wait until they are ready.
    pub async fn start(config: HostConfig) -> Result<Self, BridgeError> {
        let manager = Self::bind(config).await?;

        if let Some(command) = manager.config.worker.clone() {
            let count = manager.config.processes.max(1);
            {
                let mut processes = manager.processes.lock().await;
                for _ in 0..count {
                    let process = WorkerProcess::spawn(&command, manager.local_port())
                        .map_err(|e| BridgeError::Spawn(format!("{e:#}")))?;
                    processes.push(process);
                }
            }
            info!(count, program = %command.program, "Spawned workers");
            manager
                .wait_for_workers(count, manager.config.ready_timeout())
                .await?;
        }

        Ok(manager)
    }

    pub const fn config(&self) -> &HostConfig {
        &self.config
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The port workers must connect to.
    pub const fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub async fn connections(&self) -> usize {
        self.shared.connections.read().await.len()
    }

    pub async fn ready_connections(&self) -> usize {
        self.shared
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.is_ready())
            .count()
    }

    /// Requests outstanding across all connections.
    pub async fn pending_requests(&self) -> usize {
        self.shared
            .connections
            .read()
            .await
            .values()
            .map(|c| c.pending_requests())
            .sum()
    }

    /// Wait until at least `count` connections are ready.
    pub async fn wait_for_workers(&self, count: usize, timeout: Duration) -> Result<(), BridgeError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = self.ready_connections().await;
            if ready >= count {
                return Ok(());
            }
            debug!(ready, wanted = count, "Waiting for workers");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BridgeError::NoWorkerAvailable(timeout));
            }
        }
    }

    /// Execute a code unit on the least-loaded ready worker.
    pub async fn execute(&self, specifier: &str) -> Result<String, BridgeError> {
        let conn = self.pick().await?;
        conn.execute(specifier, self.config.request_timeout()).await
    }

    /// Health-check the least-loaded ready worker.
    pub async fn ping(&self) -> Result<(), BridgeError> {
        let conn = self.pick().await?;
        conn.ping(self.config.request_timeout()).await
    }

    /// Health-check every ready worker, keyed by connection id.
    pub async fn ping_all(&self) -> Vec<(u64, Result<(), BridgeError>)> {
        let conns: Vec<Arc<WorkerConnection>> = self.ready_snapshot().await;
        let timeout = self.config.request_timeout();
        let checks = conns.iter().map(|c| async move { (c.id(), c.ping(timeout).await) });
        futures::future::join_all(checks).await
    }

    /// Stop accepting, close every connection and kill spawned workers.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.accept_task.abort();

        let conns: Vec<Arc<WorkerConnection>> = {
            let mut map = self.shared.connections.write().await;
            map.drain().map(|(_, c)| c).collect()
        };
        for conn in &conns {
            conn.close().await;
        }

        let processes: Vec<WorkerProcess> = self.processes.lock().await.drain(..).collect();
        for process in processes {
            if let Err(e) = process.shutdown().await {
                warn!(error = %e, "Error shutting down worker process");
            }
        }
        info!(connections = conns.len(), "Session manager shut down");
    }

    async fn ready_snapshot(&self) -> Vec<Arc<WorkerConnection>> {
        self.shared
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.is_ready())
            .cloned()
            .collect()
    }

    async fn least_loaded(&self) -> Option<Arc<WorkerConnection>> {
        self.ready_snapshot()
            .await
            .into_iter()
            .min_by_key(|c| (c.pending_requests(), c.id()))
    }

    /// Least-loaded ready connection, waiting up to the ready timeout for one.
    async fn pick(&self) -> Result<Arc<WorkerConnection>, BridgeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Closed);
        }

        let timeout = self.config.ready_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = self.least_loaded().await {
                return Ok(conn);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BridgeError::NoWorkerAvailable(timeout));
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, port: u16, max_frame_length: usize) {
    let mut next_id: u64 = 0;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept worker connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        next_id += 1;
        register_connection(&shared, next_id, stream, peer, port, max_frame_length).await;
    }
}

async fn register_connection(
    shared: &Arc<Shared>,
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    port: u16,
    max_frame_length: usize,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let conn = WorkerConnection::attach(id, stream, port, max_frame_length);
    shared
        .connections
        .write()
        .await
        .insert(id, Arc::clone(&conn));
    info!(connection = id, %peer, "Worker connected");

    // announce readiness to waiters and prune the connection once it closes
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let mut state = conn.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Ready => shared.ready.notify_waiters(),
                ConnectionState::Closed => break,
                ConnectionState::Connected => {}
            }
            if state.changed().await.is_err() {
                break;
            }
        }
        shared.connections.write().await.remove(&id);
        info!(connection = id, "Worker disconnected");
    });
}
