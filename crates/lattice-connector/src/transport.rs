//! Transport embedding for the connector.
//!
//! Two embedding models share the [`HttpRpcHandler`]:
//!
//! - **Own listener**: [`ConnectorListener`] binds the configured endpoint
//!   (TCP host/port or Unix socket; the socket wins when both are set). The
//!   accept thread feeds connections into a bounded worker pool, so at most
//!   `max_connections` exchanges run at once and excess connections wait
//!   their turn instead of being refused.
//! - **Middleware**: a host HTTP server hands parsed requests to
//!   [`HttpRpcHandler::handle_http`] and writes the returned response itself.

use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use lattice_config::{BodyLimit, SocketEndpoint};
use lattice_parallel::ParallelPool;
use lattice_rpc::http::{self, HttpError, HttpRequest, HttpResponse};
use lattice_rpc::{RpcRequest, RpcResponse};

use crate::dispatch::Dispatcher;

#[cfg(unix)]
use std::fs;
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::Path;

const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");

/// Sleep between accept polls while no connection is waiting.
const IDLE_WAIT: Duration = Duration::from_millis(20);
/// Sleep after an accept failure before polling again.
const FAULT_WAIT: Duration = Duration::from_millis(200);

/// A connection accepted by the listener.
pub enum AcceptedConnection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Read for AcceptedConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for AcceptedConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
        }
    }
}

/// Handles accepted connections.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handles one connection. Implementations should avoid panicking.
    fn handle(&self, conn: AcceptedConnection);
}

enum BoundSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl BoundSocket {
    fn set_polling(&self) -> io::Result<()> {
        match self {
            Self::Tcp(listener) => listener.set_nonblocking(true),
            #[cfg(unix)]
            Self::Unix(listener) => listener.set_nonblocking(true),
        }
    }

    /// Accepts one pending connection, or `None` when nothing is waiting.
    fn poll_accept(&self) -> io::Result<Option<AcceptedConnection>> {
        let accepted = match self {
            Self::Tcp(listener) => match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    Some(AcceptedConnection::Tcp(stream))
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => None,
                Err(error) => return Err(error),
            },
            #[cfg(unix)]
            Self::Unix(listener) => match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    Some(AcceptedConnection::Unix(stream))
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => None,
                Err(error) => return Err(error),
            },
        };
        Ok(accepted)
    }
}

/// Listener bound to a connector endpoint.
pub struct ConnectorListener {
    endpoint: SocketEndpoint,
    socket: BoundSocket,
}

impl ConnectorListener {
    /// Binds the endpoint without accepting yet.
    ///
    /// A stale Unix socket file left by a dead instance is reclaimed; a
    /// socket with a live peer on it refuses to bind.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError`] when resolution, reclaiming, or binding
    /// fails.
    pub fn bind(endpoint: &SocketEndpoint) -> Result<Self, ListenerError> {
        let socket = match endpoint {
            SocketEndpoint::Tcp { host, port } => BoundSocket::Tcp(bind_tcp(host, *port)?),
            SocketEndpoint::Unix { path } => {
                #[cfg(unix)]
                {
                    BoundSocket::Unix(bind_unix(path.as_std_path())?)
                }
                #[cfg(not(unix))]
                {
                    let _ = path;
                    return Err(ListenerError::UnsupportedUnix {
                        endpoint: endpoint.to_string(),
                    });
                }
            }
        };
        Ok(Self {
            endpoint: endpoint.clone(),
            socket,
        })
    }

    /// Address actually bound, for TCP endpoints (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.socket {
            BoundSocket::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            BoundSocket::Unix(_) => None,
        }
    }

    /// Starts accepting on a background thread.
    ///
    /// Accepted connections are handed to `handler` through a worker pool of
    /// `max_connections` threads; connections beyond the cap queue in accept
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Configure`] when the socket cannot be put
    /// into polling mode.
    pub fn start(
        self,
        handler: Arc<dyn ConnectionHandler>,
        max_connections: usize,
    ) -> Result<ListenerHandle, ListenerError> {
        if let Err(source) = self.socket.set_polling() {
            self.release_socket();
            return Err(ListenerError::Configure { source });
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread =
            thread::spawn(move || self.accept_until_stopped(&stop_flag, handler, max_connections));

        Ok(ListenerHandle {
            stop,
            thread: Some(thread),
        })
    }

    fn accept_until_stopped(
        self,
        stop: &AtomicBool,
        handler: Arc<dyn ConnectionHandler>,
        max_connections: usize,
    ) {
        info!(
            target: TRANSPORT_TARGET,
            endpoint = %self.endpoint,
            max_connections,
            "serving connector endpoint"
        );

        let exchanges = ParallelPool::new(
            move |conn: AcceptedConnection| handler.handle(conn),
            max_connections,
        );

        while !stop.load(Ordering::SeqCst) {
            match self.socket.poll_accept() {
                Ok(Some(conn)) => {
                    // Completion is tracked by the pool; the per-connection
                    // result carries nothing.
                    drop(exchanges.queue(conn));
                }
                Ok(None) => thread::sleep(IDLE_WAIT),
                Err(error) => {
                    warn!(
                        target: TRANSPORT_TARGET,
                        endpoint = %self.endpoint,
                        error = %error,
                        "accept failed"
                    );
                    thread::sleep(FAULT_WAIT);
                }
            }
        }

        // Let queued and in-flight exchanges finish before releasing the
        // socket path.
        exchanges.flush();
        self.release_socket();
    }

    fn release_socket(&self) {
        #[cfg(unix)]
        if let SocketEndpoint::Unix { path } = &self.endpoint {
            match fs::remove_file(path.as_std_path()) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => {
                    debug!(
                        target: TRANSPORT_TARGET,
                        path = %path,
                        error = %error,
                        "socket file left behind"
                    );
                }
            }
        }
    }
}

/// Handle to the background listener thread.
pub struct ListenerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ListenerHandle {
    /// Requests the accept loop to exit without waiting for it.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stops accepting, drains in-flight exchanges, and joins the thread.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::ThreadPanic`] when the listener thread
    /// panicked.
    pub fn close(mut self) -> Result<(), ListenerError> {
        self.request_stop();
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| ListenerError::ThreadPanic),
            None => Ok(()),
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!(
                target: TRANSPORT_TARGET,
                "listener thread panicked during drop"
            );
        }
    }
}

fn bind_tcp(host: &str, port: u16) -> Result<TcpListener, ListenerError> {
    let target = format!("{host}:{port}");
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|source| ListenerError::Bind {
            target: target.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| ListenerError::NoAddress {
            target: target.clone(),
        })?;
    TcpListener::bind(addr).map_err(|source| ListenerError::Bind { target, source })
}

#[cfg(unix)]
fn bind_unix(path: &Path) -> Result<UnixListener, ListenerError> {
    reclaim_stale_socket(path)?;
    UnixListener::bind(path).map_err(|source| ListenerError::Bind {
        target: path.display().to_string(),
        source,
    })
}

/// Removes a socket file left behind by a dead instance.
///
/// A successful probe connection means another instance is live on the path,
/// which is a hard bind failure rather than something to reclaim.
#[cfg(unix)]
fn reclaim_stale_socket(path: &Path) -> Result<(), ListenerError> {
    if !path.exists() {
        return Ok(());
    }

    match UnixStream::connect(path) {
        Ok(_live) => Err(ListenerError::SocketBusy {
            path: path.display().to_string(),
        }),
        Err(error)
            if matches!(
                error.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) =>
        {
            debug!(
                target: TRANSPORT_TARGET,
                path = %path.display(),
                "reclaiming stale socket file"
            );
            fs::remove_file(path).map_err(|source| ListenerError::Reclaim {
                path: path.display().to_string(),
                source,
            })
        }
        Err(source) => Err(ListenerError::Reclaim {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Errors raised by the connector listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Resolving or binding the target failed.
    #[error("cannot bind '{target}': {source}")]
    Bind {
        target: String,
        #[source]
        source: io::Error,
    },
    /// The host name resolved to no usable address.
    #[error("'{target}' did not resolve to a usable address")]
    NoAddress { target: String },
    /// Another instance is live on the configured socket path.
    #[error("another instance is serving on '{path}'")]
    SocketBusy { path: String },
    /// A stale socket path could not be probed or removed.
    #[error("could not reclaim socket path '{path}': {source}")]
    Reclaim {
        path: String,
        #[source]
        source: io::Error,
    },
    /// The socket could not be switched into polling mode.
    #[error("listener configuration failed: {source}")]
    Configure {
        #[source]
        source: io::Error,
    },
    /// Unix sockets are not available on this platform.
    #[error("unix endpoint '{endpoint}' is unsupported on this platform")]
    UnsupportedUnix { endpoint: String },
    /// The listener thread panicked.
    #[error("listener thread panicked")]
    ThreadPanic,
}

/// Connection handler speaking HTTP JSON-RPC.
///
/// Doubles as the middleware surface: host servers call
/// [`handle_http`](Self::handle_http) with an already-parsed request and
/// write the returned response themselves.
pub struct HttpRpcHandler {
    dispatcher: Arc<Dispatcher>,
    mount_path: String,
    body_limit: BodyLimit,
}

impl HttpRpcHandler {
    /// Builds a handler serving the dispatcher at `mount_path`.
    #[must_use]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        mount_path: impl Into<String>,
        body_limit: BodyLimit,
    ) -> Self {
        Self {
            dispatcher,
            mount_path: mount_path.into(),
            body_limit,
        }
    }

    /// Processes one parsed HTTP request into a response.
    #[must_use]
    pub fn handle_http(&self, request: &HttpRequest) -> HttpResponse {
        if strip_query(&request.path) != self.mount_path {
            return HttpResponse::status(404);
        }
        if request.method != "POST" {
            return HttpResponse::status(405);
        }
        if self.body_limit.exceeded_by(request.body.len()) {
            return HttpResponse::status(413);
        }

        let body = match request.body_as_json() {
            Ok(body) => body,
            Err(cause) => {
                debug!(
                    target: TRANSPORT_TARGET,
                    error = %cause,
                    "request body failed to decode"
                );
                return rpc_error_response(None, -32700, "Parse error");
            }
        };
        let envelope: RpcRequest = match serde_json::from_value(body) {
            Ok(envelope) => envelope,
            Err(cause) => {
                debug!(
                    target: TRANSPORT_TARGET,
                    error = %cause,
                    "request envelope rejected"
                );
                return rpc_error_response(None, -32600, "Invalid request");
            }
        };

        let id = Some(envelope.id);
        let params = envelope.params.unwrap_or(Value::Null);
        let response = match self.dispatcher.dispatch(&envelope.method, params) {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => RpcResponse::failure(id, error),
        };
        match serde_json::to_vec(&response) {
            Ok(body) => HttpResponse::ok_json(body),
            Err(_) => HttpResponse::status(500),
        }
    }
}

impl ConnectionHandler for HttpRpcHandler {
    fn handle(&self, conn: AcceptedConnection) {
        let mut reader = BufReader::new(conn);
        let request = match http::read_request(&mut reader, self.body_limit.bytes()) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(target: TRANSPORT_TARGET, "client disconnected without request");
                return;
            }
            Err(HttpError::BodyTooLarge { size, limit }) => {
                debug!(target: TRANSPORT_TARGET, size, limit, "request body too large");
                let mut conn = reader.into_inner();
                let _ = http::write_response(&mut conn, &HttpResponse::status(413));
                return;
            }
            Err(cause) => {
                warn!(
                    target: TRANSPORT_TARGET,
                    error = %cause,
                    "failed to read request"
                );
                let mut conn = reader.into_inner();
                let _ = http::write_response(&mut conn, &HttpResponse::status(400));
                return;
            }
        };

        let response = self.handle_http(&request);
        let mut conn = reader.into_inner();
        if let Err(cause) = http::write_response(&mut conn, &response) {
            warn!(
                target: TRANSPORT_TARGET,
                error = %cause,
                "failed to write response"
            );
        }
    }
}

fn strip_query(path: &str) -> &str {
    path.split_once('?').map_or(path, |(path, _)| path)
}

fn rpc_error_response(id: Option<i64>, code: i64, message: &str) -> HttpResponse {
    let response = RpcResponse::failure(
        id,
        serde_json::json!({"code": code, "message": message}),
    );
    match serde_json::to_vec(&response) {
        Ok(body) => HttpResponse::ok_json(body),
        Err(_) => HttpResponse::status(500),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;

    use serde_json::json;

    use lattice_metrics::NoopMetrics;

    use super::*;
    use crate::compile::compile_routes;
    use crate::dispatch::DispatchOptions;
    use crate::route::{RouteConfig, ServerDefaults};

    fn echo_handler() -> HttpRpcHandler {
        let mut routes = BTreeMap::new();
        routes.insert(
            "echo".to_string(),
            RouteConfig::new(|data: &mut Value| Ok(data.take())).into(),
        );
        let compiled = compile_routes(&routes, &ServerDefaults::new()).expect("compile");
        let dispatcher = Arc::new(Dispatcher::new(
            compiled,
            DispatchOptions::default(),
            Arc::new(NoopMetrics),
        ));
        HttpRpcHandler::new(dispatcher, "/", BodyLimit::from_bytes(64 * 1024))
    }

    fn post(handler: &HttpRpcHandler, body: &[u8]) -> HttpResponse {
        let mut wire = Vec::new();
        write!(
            wire,
            "POST / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .expect("header");
        wire.extend_from_slice(body);
        let mut reader = std::io::BufReader::new(std::io::Cursor::new(wire));
        let request = http::read_request(&mut reader, 64 * 1024)
            .expect("read")
            .expect("present");
        handler.handle_http(&request)
    }

    #[test]
    fn dispatches_valid_envelope() {
        let handler = echo_handler();
        let response = post(
            &handler,
            br#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"n":7}}"#,
        );

        assert_eq!(response.status, 200);
        let envelope: RpcResponse = serde_json::from_slice(&response.body).expect("decode");
        assert_eq!(envelope.result, Some(json!({"n": 7})));
        assert_eq!(envelope.id, Some(1));
    }

    #[test]
    fn rejects_invalid_json_with_parse_error() {
        let handler = echo_handler();
        let response = post(&handler, b"not json at all");

        let envelope: RpcResponse = serde_json::from_slice(&response.body).expect("decode");
        assert_eq!(envelope.error.expect("error")["code"], json!(-32700));
    }

    #[test]
    fn rejects_missing_method_with_invalid_request() {
        let handler = echo_handler();
        let response = post(&handler, br#"{"jsonrpc":"2.0","id":1}"#);

        let envelope: RpcResponse = serde_json::from_slice(&response.body).expect("decode");
        assert_eq!(envelope.error.expect("error")["code"], json!(-32600));
    }

    #[test]
    fn unknown_paths_are_not_found() {
        let handler = echo_handler();
        let mut wire = Vec::new();
        write!(wire, "POST /elsewhere HTTP/1.1\r\nContent-Length: 2\r\n\r\n{{}}").expect("wire");
        let mut reader = std::io::BufReader::new(std::io::Cursor::new(wire));
        let request = http::read_request(&mut reader, 64 * 1024)
            .expect("read")
            .expect("present");

        assert_eq!(handler.handle_http(&request).status, 404);
    }

    #[test]
    fn non_post_methods_are_rejected() {
        let handler = echo_handler();
        let mut wire = Vec::new();
        write!(wire, "GET / HTTP/1.1\r\n\r\n").expect("wire");
        let mut reader = std::io::BufReader::new(std::io::Cursor::new(wire));
        let request = http::read_request(&mut reader, 64 * 1024)
            .expect("read")
            .expect("present");

        assert_eq!(handler.handle_http(&request).status, 405);
    }

    #[test]
    fn listener_serves_round_trips_over_tcp() {
        let handler = Arc::new(echo_handler());
        let listener =
            ConnectorListener::bind(&SocketEndpoint::tcp("127.0.0.1", 0)).expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = listener.start(handler, 4).expect("start");

        let client = lattice_rpc::RpcClient::new(format!("http://127.0.0.1:{}", addr.port()))
            .expect("client");
        let response = client
            .call("echo", Some(json!({"ping": true})))
            .expect("call");

        assert_eq!(response.result, Some(json!({"ping": true})));
        handle.close().expect("close listener");
    }

    #[test]
    fn listener_drains_concurrent_clients() {
        let handler = Arc::new(echo_handler());
        let listener =
            ConnectorListener::bind(&SocketEndpoint::tcp("127.0.0.1", 0)).expect("bind");
        let addr = listener.local_addr().expect("addr");
        // A cap of 1 forces later connections to queue behind the first.
        let handle = listener.start(handler, 1).expect("start");

        let clients: Vec<_> = (0..4)
            .map(|n| {
                let url = format!("http://127.0.0.1:{}", addr.port());
                std::thread::spawn(move || {
                    let client = lattice_rpc::RpcClient::new(url).expect("client");
                    client.call("echo", Some(json!({"n": n}))).expect("call")
                })
            })
            .collect();

        for client in clients {
            let response = client.join().expect("join client");
            assert!(response.result.is_some());
        }
        handle.close().expect("close listener");
    }

    #[cfg(unix)]
    #[test]
    fn listener_serves_round_trips_over_unix_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("connector.sock");
        let endpoint = SocketEndpoint::unix(
            camino::Utf8PathBuf::from_path_buf(socket_path.clone()).expect("utf8"),
        );

        let handler = Arc::new(echo_handler());
        let listener = ConnectorListener::bind(&endpoint).expect("bind");
        let handle = listener.start(handler, 4).expect("start");

        let client =
            lattice_rpc::RpcClient::new(format!("unix://{}", socket_path.display()))
                .expect("client");
        let response = client.call("echo", Some(json!({"n": 1}))).expect("call");

        assert_eq!(response.result, Some(json!({"n": 1})));
        handle.close().expect("close listener");
        assert!(!socket_path.exists(), "socket file cleaned up");
    }

    #[cfg(unix)]
    #[test]
    fn stale_socket_file_is_reclaimed_on_bind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("stale.sock");
        let endpoint = SocketEndpoint::unix(
            camino::Utf8PathBuf::from_path_buf(socket_path.clone()).expect("utf8"),
        );

        // Dropping a listener that never served closes the descriptor but
        // leaves the socket file behind, exactly like a crashed instance.
        {
            let first = ConnectorListener::bind(&endpoint).expect("first bind");
            drop(first);
        }
        assert!(socket_path.exists());

        let second = ConnectorListener::bind(&endpoint).expect("reclaims stale socket");
        drop(second);
    }
}
