//! Worker endpoint.
//!
//! A `WorkerSession` owns one connection to the host and one module loader.
//! Lifecycle per connection:
//!
//! 1. Connect to the host listener (`PORT`).
//! 2. Announce readiness with the `INITIALIZED` response.
//! 3. Serve: read frame → decode → dispatch → respond, until EOF.
//! 4. Wait up to `drain_timeout` for in-flight executions, abort the rest and
//!    return.
//!
//! Pings are answered inline. Executes run in their own tasks, limited by a
//! semaphore, so responses can be written in any order. Nothing a request
//! does can end the session; every failure becomes an `error` response.

use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::loader::{ExecError, ModuleLoader};
use crate::transport::protocol::{Request, RequestId, RequestKind, Response};
use crate::transport::{Frame, JsonLinesCodec};

type ResponseWriter<S> = Arc<Mutex<FramedWrite<WriteHalf<S>, JsonLinesCodec<Response>>>>;

/// One worker connection and the state that belongs to it.
pub struct WorkerSession<L> {
    config: WorkerConfig,
    loader: Arc<L>,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
}

impl<L: ModuleLoader> WorkerSession<L> {
    pub fn new(config: WorkerConfig, loader: L) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            loader: Arc::new(loader),
            permits,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Number of accepted executes that have not responded yet.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Open the connection to the host listener.
    pub async fn connect(&self) -> io::Result<TcpStream> {
        let address = self.config.address();
        debug!(%address, "Connecting to host");
        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;
        info!(%address, "Connected to host");
        Ok(stream)
    }

    /// Connect and serve until the host closes the connection.
    pub async fn run(self) -> io::Result<()> {
        let stream = self.connect().await?;
        self.serve(stream).await
    }

    /// Serve requests arriving on an established stream.
    ///
    /// Returns once the stream reaches EOF (or fails) and every in-flight
    /// execution has written its response or been aborted after
    /// `drain_timeout`. Only a failure to send the readiness announcement is
    /// returned as an error.
    pub async fn serve<S>(self, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let max_frame_length = self.config.max_frame_length;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(
            read_half,
            JsonLinesCodec::<Request>::with_max_frame_length(max_frame_length),
        );
        let writer: ResponseWriter<S> = Arc::new(Mutex::new(FramedWrite::new(
            write_half,
            JsonLinesCodec::<Response>::with_max_frame_length(max_frame_length),
        )));

        writer.lock().await.send(Response::ready()).await?;
        info!(port = self.config.port, "Worker ready");

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Frame::Message(request))) => {
                        self.dispatch(request, &writer, &mut tasks).await;
                    }
                    Some(Ok(Frame::Malformed(raw))) => {
                        warn!(len = raw.len(), "Received malformed frame");
                        respond(&writer, Response::malformed(raw)).await;
                    }
                    Some(Ok(Frame::Oversized { limit })) => {
                        warn!(limit, "Received oversized frame");
                        respond(
                            &writer,
                            Response::malformed(format!("frame exceeds {limit} bytes")),
                        )
                        .await;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Connection error");
                        break;
                    }
                    None => {
                        info!("Host closed connection");
                        break;
                    }
                },

                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Execute task failed");
                    }
                }
            }
        }

        drop(reader);
        if !tasks.is_empty() {
            debug!(in_flight = tasks.len(), "Waiting for in-flight executions");
        }
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Execute task failed");
                }
            }
        };
        if tokio::time::timeout(self.config.drain_timeout, drain).await.is_err() {
            warn!(
                abandoned = tasks.len(),
                drain_timeout = ?self.config.drain_timeout,
                "Aborting executions still running after the host left"
            );
            tasks.shutdown().await;
        }

        info!("Worker session closed");
        Ok(())
    }

    async fn dispatch<S>(
        &self,
        request: Request,
        writer: &ResponseWriter<S>,
        tasks: &mut JoinSet<()>,
    ) where
        S: AsyncWrite + Send + 'static,
    {
        debug!(id = %request.id, kind = %request.kind, port = request.port, "Request received");

        match request.kind {
            RequestKind::Ping => respond(writer, Response::pong(request.id)).await,
            RequestKind::Unknown => {
                warn!(id = %request.id, "Request with unrecognized type");
                respond(writer, Response::invalid_type(request.id)).await;
            }
            RequestKind::Execute => {
                let Some(slot) = QueueSlot::claim(&self.queued, self.config.max_queued) else {
                    warn!(id = %request.id, max_queued = self.config.max_queued, "Rejecting execute, backlog full");
                    let message = format!(
                        "worker overloaded: {} executions already queued",
                        self.config.max_queued
                    );
                    respond(writer, Response::error(request.id, message)).await;
                    return;
                };

                let loader = Arc::clone(&self.loader);
                let permits = Arc::clone(&self.permits);
                let writer = Arc::clone(writer);
                let limit = self.config.execute_timeout;

                tasks.spawn(async move {
                    let _slot = slot;
                    let Ok(_permit) = permits.acquire_owned().await else {
                        respond(&writer, Response::error(request.id, "worker shutting down")).await;
                        return;
                    };
                    let response = execute(loader, request.id, request.content, limit).await;
                    respond(&writer, response).await;
                });
            }
        }
    }
}

/// Load and run one unit, converting every failure into an error response.
async fn execute<L: ModuleLoader>(
    loader: Arc<L>,
    id: RequestId,
    specifier: String,
    limit: Option<Duration>,
) -> Response {
    debug!(%id, %specifier, "Executing");

    // run in a separate task so a panicking unit only fails this request
    let mut handle = AbortOnDrop(tokio::spawn(async move {
        let unit = loader.load(&specifier).await.map_err(|e| e.to_string())?;
        unit.run().await.map_err(|e| e.to_string())
    }));

    let joined = match limit {
        Some(limit) => {
            if let Ok(joined) = tokio::time::timeout(limit, &mut handle.0).await {
                joined
            } else {
                return Response::error(id, ExecError::Timeout(limit).to_string());
            }
        }
        None => (&mut handle.0).await,
    };

    match joined {
        Ok(Ok(value)) => Response::success(id, value),
        Ok(Err(message)) => Response::error(id, message),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            Response::error(id, ExecError::Panicked(panic_message(&*payload)).to_string())
        }
        Err(e) => Response::error(id, format!("execution aborted: {e}")),
    }
}

async fn respond<S>(writer: &ResponseWriter<S>, response: Response)
where
    S: AsyncWrite,
{
    debug!(id = %response.id, status = ?response.status, "Sending response");
    let mut w = writer.lock().await;
    if let Err(e) = w.send(response).await {
        error!(error = %e, "Failed to send response");
    }
}

/// Aborts the wrapped task when dropped, so cancelling an execute also
/// cancels the unit it started.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Counts one accepted execute until dropped.
struct QueueSlot {
    queued: Arc<AtomicUsize>,
}

impl QueueSlot {
    fn claim(queued: &Arc<AtomicUsize>, max_queued: usize) -> Option<Self> {
        let previous = queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_queued).then_some(n + 1)
            })
            .ok()?;

        let depth = previous + 1;
        if crosses_half(previous, max_queued) {
            warn!(depth, max_queued, "Execute backlog at half capacity");
        }
        Some(Self {
            queued: Arc::clone(queued),
        })
    }
}

/// Whether going from `previous` to `previous + 1` queued executes reaches
/// half of `max_queued`.
const fn crosses_half(previous: usize, max_queued: usize) -> bool {
    let half = max_queued.div_ceil(2);
    previous < half && previous + 1 >= half
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::RegistryLoader;
    use std::sync::atomic::AtomicBool;
    use crate::transport::protocol::{Status, INITIALIZED_ID, INVALID_MESSAGE_ID, PONG};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf};

    struct Host {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Host {
        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn send(&mut self, req: &Request) {
            let line = serde_json::to_string(req).unwrap() + "\n";
            self.send_raw(&line).await;
        }

        async fn recv(&mut self) -> Response {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for response")
                .unwrap()
                .expect("worker closed connection");
            serde_json::from_str(&line).unwrap()
        }
    }

    fn start(config: WorkerConfig, loader: RegistryLoader) -> (Host, tokio::task::JoinHandle<io::Result<()>>) {
        let (host_side, worker_side) = tokio::io::duplex(64 * 1024);
        let session = WorkerSession::new(config, loader);
        let handle = tokio::spawn(session.serve(worker_side));
        let (read_half, writer) = tokio::io::split(host_side);
        let host = Host {
            lines: BufReader::new(read_half).lines(),
            writer,
        };
        (host, handle)
    }

    fn id(s: &str) -> RequestId {
        RequestId::new(s).unwrap()
    }

    fn test_loader() -> RegistryLoader {
        RegistryLoader::new()
            .with_fn("fast", || async { Ok("fast-done".to_string()) })
            .with_fn("slow", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("slow-done".to_string())
            })
            .with_fn("hang", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("never".to_string())
            })
            .with_fn("boom", || async { Err(ExecError::failed("render exploded")) })
            .with_fn("panic", panicking_unit)
    }

    async fn panicking_unit() -> Result<String, ExecError> {
        panic!("unit panicked")
    }

    #[tokio::test]
    async fn readiness_is_first_message() {
        let (mut host, _handle) = start(WorkerConfig::new(1), test_loader());
        let first = host.recv().await;
        assert_eq!(first.id.as_str(), INITIALIZED_ID);
        assert_eq!(first.status, Status::Success);
    }

    #[tokio::test]
    async fn ping_returns_pong() {
        let (mut host, _handle) = start(WorkerConfig::new(1), test_loader());
        host.recv().await;

        host.send(&Request::ping(id("p1"), 1)).await;
        let resp = host.recv().await;
        assert_eq!(resp, Response::success(id("p1"), PONG));
    }

    #[tokio::test]
    async fn execute_success_and_failure() {
        let (mut host, _handle) = start(WorkerConfig::new(1), test_loader());
        host.recv().await;

        host.send(&Request::execute(id("a"), 1, "fast")).await;
        assert_eq!(host.recv().await, Response::success(id("a"), "fast-done"));

        host.send(&Request::execute(id("b"), 1, "boom")).await;
        assert_eq!(host.recv().await, Response::error(id("b"), "render exploded"));
    }

    #[tokio::test]
    async fn missing_module_is_an_error_and_session_survives() {
        let (mut host, _handle) = start(WorkerConfig::new(1), test_loader());
        host.recv().await;

        host.send(&Request::execute(id("a"), 1, "./does-not-exist.mjs")).await;
        let resp = host.recv().await;
        assert_eq!(resp.id, id("a"));
        assert_eq!(resp.status, Status::Error);
        assert!(resp.content.contains("does-not-exist"));

        host.send(&Request::ping(id("p"), 1)).await;
        assert_eq!(host.recv().await.status, Status::Success);
    }

    #[tokio::test]
    async fn panicking_unit_is_reported_as_error() {
        let (mut host, _handle) = start(WorkerConfig::new(1), test_loader());
        host.recv().await;

        host.send(&Request::execute(id("a"), 1, "panic")).await;
        let resp = host.recv().await;
        assert_eq!(resp.status, Status::Error);
        assert!(resp.content.contains("unit panicked"));

        host.send(&Request::execute(id("b"), 1, "fast")).await;
        assert_eq!(host.recv().await.status, Status::Success);
    }

    #[tokio::test]
    async fn unknown_type_uses_original_id() {
        let (mut host, _handle) = start(WorkerConfig::new(1), test_loader());
        host.recv().await;

        host.send_raw("{\"id\":\"x\",\"port\":1,\"type\":\"shutdown\",\"content\":\"\"}\n")
            .await;
        assert_eq!(
            host.recv().await,
            Response::error(id("x"), "Invalid message type")
        );
    }

    #[tokio::test]
    async fn missing_or_odd_fields_are_answered_under_the_request_id() {
        let (mut host, _handle) = start(WorkerConfig::new(1), test_loader());
        host.recv().await;

        host.send_raw("{\"id\":\"x\",\"port\":1,\"content\":\"\"}\n").await;
        assert_eq!(host.recv().await, Response::error(id("x"), "Invalid message type"));

        host.send_raw("{\"id\":\"y\",\"port\":1,\"type\":5,\"content\":\"\"}\n")
            .await;
        assert_eq!(host.recv().await, Response::error(id("y"), "Invalid message type"));

        host.send_raw("{\"id\":\"z\",\"type\":\"ping\",\"content\":7}\n").await;
        assert_eq!(host.recv().await, Response::success(id("z"), PONG));

        // without a usable id only the sentinel can carry the report
        host.send_raw("{\"id\":5,\"type\":\"ping\"}\n").await;
        assert_eq!(host.recv().await.id.as_str(), INVALID_MESSAGE_ID);
    }

    #[tokio::test]
    async fn malformed_input_then_valid_frame() {
        let (mut host, _handle) = start(WorkerConfig::new(1), test_loader());
        host.recv().await;

        host.send_raw("not-json\n").await;
        let resp = host.recv().await;
        assert_eq!(resp.id.as_str(), INVALID_MESSAGE_ID);
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.content, "not-json");

        host.send(&Request::ping(id("p"), 1)).await;
        assert_eq!(host.recv().await.id, id("p"));
    }

    #[tokio::test]
    async fn completion_order_follows_latency_not_arrival() {
        let (mut host, _handle) = start(WorkerConfig::new(1), test_loader());
        host.recv().await;

        host.send(&Request::execute(id("slow"), 1, "slow")).await;
        host.send(&Request::execute(id("fast"), 1, "fast")).await;

        let first = host.recv().await;
        let second = host.recv().await;
        assert_eq!(first.id, id("fast"));
        assert_eq!(second.id, id("slow"));
        assert_eq!(second.content, "slow-done");
    }

    #[tokio::test]
    async fn ping_is_not_blocked_by_running_executes() {
        let mut config = WorkerConfig::new(1);
        config.max_concurrency = 1;
        let (mut host, _handle) = start(config, test_loader());
        host.recv().await;

        host.send(&Request::execute(id("h1"), 1, "hang")).await;
        host.send(&Request::execute(id("h2"), 1, "hang")).await;
        host.send(&Request::ping(id("p"), 1)).await;

        assert_eq!(host.recv().await, Response::pong(id("p")));
    }

    #[tokio::test]
    async fn execute_timeout_produces_error() {
        let mut config = WorkerConfig::new(1);
        config.execute_timeout = Some(Duration::from_millis(50));
        let (mut host, _handle) = start(config, test_loader());
        host.recv().await;

        host.send(&Request::execute(id("h"), 1, "hang")).await;
        let resp = host.recv().await;
        assert_eq!(resp.id, id("h"));
        assert_eq!(resp.status, Status::Error);
        assert!(resp.content.contains("timed out"));
    }

    #[tokio::test]
    async fn backlog_limit_rejects_excess_executes() {
        let mut config = WorkerConfig::new(1);
        config.max_concurrency = 1;
        config.max_queued = 1;
        let (mut host, _handle) = start(config, test_loader());
        host.recv().await;

        host.send(&Request::execute(id("h"), 1, "hang")).await;
        host.send(&Request::execute(id("over"), 1, "fast")).await;

        let resp = host.recv().await;
        assert_eq!(resp.id, id("over"));
        assert_eq!(resp.status, Status::Error);
        assert!(resp.content.starts_with("worker overloaded"));
    }

    #[tokio::test]
    async fn serve_returns_after_in_flight_work_on_eof() {
        let (mut host, handle) = start(WorkerConfig::new(1), test_loader());
        host.recv().await;

        host.send(&Request::execute(id("s"), 1, "slow")).await;
        host.writer.shutdown().await.unwrap();

        assert_eq!(host.recv().await, Response::success(id("s"), "slow-done"));
        handle.await.unwrap().unwrap();
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn stuck_units_are_aborted_after_drain_timeout() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&dropped);
        let loader = RegistryLoader::new().with_fn("stuck", move || {
            let guard = SetOnDrop(Arc::clone(&flag));
            async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(String::new())
            }
        });

        let mut config = WorkerConfig::new(1);
        config.drain_timeout = Duration::from_millis(50);
        let (mut host, handle) = start(config, loader);
        host.recv().await;

        host.send(&Request::execute(id("s"), 1, "stuck")).await;
        // let the unit start before the host goes away
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.writer.shutdown().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session did not finish after drain timeout")
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("unit kept running after the session closed");
    }

    #[test]
    fn half_capacity_warning_fires_once_on_crossing() {
        assert!(crosses_half(0, 1));
        assert!(crosses_half(1, 4));
        assert!(!crosses_half(2, 4));
        assert!(crosses_half(511, 1024));
        assert!(!crosses_half(510, 1024));
        assert!(!crosses_half(512, 1024));
        // odd capacity rounds the threshold up
        assert!(crosses_half(2, 5));
        assert!(!crosses_half(1, 5));
    }

    #[tokio::test]
    async fn chunked_reads_from_mock_stream() {
        let ready = serde_json::to_string(&Response::ready()).unwrap() + "\n";
        let pong = serde_json::to_string(&Response::pong(id("a"))).unwrap() + "\n";

        let mock = tokio_test::io::Builder::new()
            .write(ready.as_bytes())
            .read(br#"{"id":"#)
            .read(br#""a","port":1,"#)
            .read(br#""type":"pi"#)
            .read(br#"ng","content":"#)
            .read(b"\"\"}\n")
            .write(pong.as_bytes())
            .build();

        let session = WorkerSession::new(WorkerConfig::new(1), test_loader());
        session.serve(mock).await.unwrap();
    }
}
