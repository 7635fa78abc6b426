//! HTTP exposition endpoint for the metric registry.
//!
//! Binds a TCP listener and answers `GET /metrics` with the rendered
//! registry. Everything else is a 404. Exchanges are tiny, so connections
//! are handled inline on the accept thread.

use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use lattice_rpc::http::{self, HttpResponse};

use crate::sink::MetricsSink;

const SERVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");

/// Sleep between accept polls while no scrape is waiting.
const IDLE_WAIT: Duration = Duration::from_millis(30);
/// Sleep after an accept failure before polling again.
const FAULT_WAIT: Duration = Duration::from_millis(250);

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Background server exposing a [`MetricsSink`] over HTTP.
pub struct MetricsServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MetricsServer {
    /// Binds the exposition endpoint and starts the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsServerError`] when the address does not resolve or
    /// the listener cannot bind.
    pub fn bind(
        host: &str,
        port: u16,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, MetricsServerError> {
        let mut addrs =
            (host, port)
                .to_socket_addrs()
                .map_err(|source| MetricsServerError::Resolve {
                    host: host.to_string(),
                    port,
                    source,
                })?;
        let addr = addrs.next().ok_or_else(|| MetricsServerError::ResolveEmpty {
            host: host.to_string(),
            port,
        })?;
        let listener =
            TcpListener::bind(addr).map_err(|source| MetricsServerError::Bind { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| MetricsServerError::NonBlocking { source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| MetricsServerError::NonBlocking { source })?;

        info!(
            target: SERVER_TARGET,
            addr = %local_addr,
            "metrics endpoint active"
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || run_accept_loop(&listener, &shutdown_flag, &sink));

        Ok(Self {
            local_addr,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Address the endpoint actually bound, useful with port 0 in tests.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the accept loop and joins the server thread.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!(target: SERVER_TARGET, "metrics server thread panicked");
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_accept_loop(listener: &TcpListener, shutdown: &AtomicBool, sink: &Arc<dyn MetricsSink>) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(error) = stream
                    .set_nonblocking(false)
                    .and_then(|()| serve_connection(stream, sink))
                {
                    warn!(
                        target: SERVER_TARGET,
                        error = %error,
                        "metrics exchange failed"
                    );
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(IDLE_WAIT);
            }
            Err(error) => {
                warn!(
                    target: SERVER_TARGET,
                    error = %error,
                    "metrics accept failed"
                );
                thread::sleep(FAULT_WAIT);
            }
        }
    }
}

fn serve_connection(stream: std::net::TcpStream, sink: &Arc<dyn MetricsSink>) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let request = match http::read_request(&mut reader, 4096) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(error) => {
            return Err(io::Error::other(error));
        }
    };

    let response = match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/metrics") => HttpResponse::ok_text(
            EXPOSITION_CONTENT_TYPE,
            sink.render().into_bytes(),
        ),
        ("GET", _) => HttpResponse::status(404),
        _ => HttpResponse::status(405),
    };

    let mut stream = reader.into_inner();
    http::write_response(&mut stream, &response).map_err(io::Error::other)?;
    stream.flush()
}

/// Errors raised while starting the metrics endpoint.
#[derive(Debug, Error)]
pub enum MetricsServerError {
    /// The host name failed to resolve.
    #[error("failed to resolve metrics address {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    /// The host name resolved to no addresses.
    #[error("metrics address {host}:{port} resolved to no usable address")]
    ResolveEmpty { host: String, port: u16 },
    /// Binding the listener failed.
    #[error("failed to bind metrics listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Switching the listener to non-blocking mode failed.
    #[error("failed to configure metrics listener: {source}")]
    NonBlocking {
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Write};
    use std::net::TcpStream;

    use super::*;
    use crate::registry::Registry;

    fn fetch(addr: SocketAddr, path: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(addr).expect("connect");
        write!(stream, "GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").expect("write");
        stream.flush().expect("flush");

        let mut reader = BufReader::new(stream);
        let response = http::read_response(&mut reader).expect("read response");
        (response.status, String::from_utf8_lossy(&response.body).to_string())
    }

    #[test]
    fn serves_rendered_registry_on_metrics_path() {
        let registry = Arc::new(Registry::new());
        registry.inc_counter("handle_api_success_count", &[("api", "t")]);

        let mut server =
            MetricsServer::bind("127.0.0.1", 0, registry.clone()).expect("bind server");
        let (status, body) = fetch(server.local_addr(), "/metrics");

        assert_eq!(status, 200);
        assert!(body.contains(r#"handle_api_success_count{api="t"} 1"#));
        server.shutdown();
    }

    #[test]
    fn unknown_paths_are_not_found() {
        let registry = Arc::new(Registry::new());
        let mut server = MetricsServer::bind("127.0.0.1", 0, registry).expect("bind server");

        let (status, _) = fetch(server.local_addr(), "/health");

        assert_eq!(status, 404);
        server.shutdown();
    }

    #[test]
    fn shutdown_joins_the_accept_thread() {
        let registry = Arc::new(Registry::new());
        let mut server = MetricsServer::bind("127.0.0.1", 0, registry).expect("bind server");
        server.shutdown();
        // A second shutdown is a no-op.
        server.shutdown();
    }
}
