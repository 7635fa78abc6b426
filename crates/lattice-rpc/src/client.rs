//! Outbound HTTP JSON-RPC client.
//!
//! A client is a lightweight stub bound to a peer's target URL. Connections
//! are opened per call and closed after the exchange, so stubs are cheap to
//! create and safe to replace at any time.

use std::io::{BufReader, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::envelope::{RpcRequest, RpcResponse};
use crate::http::{self, HttpError};

/// Tracing target for outbound client activity.
const CLIENT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::client");

/// Configuration for one outbound peer.
///
/// Deserialises from either a bare URL string or the record form carrying an
/// expected peer alias:
///
/// ```json
/// "http://billing:3000"
/// {"connect": "http://billing:3000", "originRemoteAlias": "billing"}
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ClientConfig {
    /// Bare target URL.
    Url(String),
    /// Target URL with an expected peer self-identifier.
    Record {
        /// Target URL.
        connect: String,
        /// Alias the peer must report from `_ping`.
        #[serde(default, alias = "originRemoteAlias")]
        origin_remote_alias: Option<String>,
    },
}

impl ClientConfig {
    /// Builds a bare-URL configuration.
    #[must_use]
    pub fn url(connect: impl Into<String>) -> Self {
        Self::Url(connect.into())
    }

    /// Builds a configuration that pins the peer's self-reported alias.
    #[must_use]
    pub fn with_origin(connect: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::Record {
            connect: connect.into(),
            origin_remote_alias: Some(alias.into()),
        }
    }

    /// Returns the target URL.
    #[must_use]
    pub fn connect(&self) -> &str {
        match self {
            Self::Url(connect) => connect,
            Self::Record { connect, .. } => connect,
        }
    }

    /// Returns the pinned peer alias, when one was configured.
    #[must_use]
    pub fn origin_remote_alias(&self) -> Option<&str> {
        match self {
            Self::Url(_) => None,
            Self::Record {
                origin_remote_alias,
                ..
            } => origin_remote_alias.as_deref(),
        }
    }
}

/// A resolved connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTarget {
    /// HTTP over TCP.
    Tcp {
        host: String,
        port: u16,
        path: String,
    },
    /// HTTP over a Unix domain socket.
    Unix { path: String },
}

impl ClientTarget {
    /// Parses a target from `http://host:port[/path]` or `unix:///path`.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Target`] for unsupported schemes or incomplete
    /// addresses.
    pub fn parse(connect: &str) -> Result<Self, CallError> {
        let url = Url::parse(connect).map_err(|source| CallError::Target {
            connect: connect.to_string(),
            message: source.to_string(),
        })?;

        match url.scheme() {
            "http" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| CallError::Target {
                        connect: connect.to_string(),
                        message: "missing host".to_string(),
                    })?
                    .to_string();
                let port = url.port().unwrap_or(80);
                let path = match url.path() {
                    "" => "/".to_string(),
                    path => path.to_string(),
                };
                Ok(Self::Tcp { host, port, path })
            }
            "unix" => {
                let path = url.path();
                if path.is_empty() {
                    return Err(CallError::Target {
                        connect: connect.to_string(),
                        message: "missing socket path".to_string(),
                    });
                }
                Ok(Self::Unix {
                    path: path.to_string(),
                })
            }
            other => Err(CallError::Target {
                connect: connect.to_string(),
                message: format!("unsupported scheme '{other}'"),
            }),
        }
    }

    fn host_header(&self) -> String {
        match self {
            Self::Tcp { host, port, .. } => format!("{host}:{port}"),
            Self::Unix { .. } => "localhost".to_string(),
        }
    }

    fn request_path(&self) -> &str {
        match self {
            Self::Tcp { path, .. } => path,
            Self::Unix { .. } => "/",
        }
    }
}

enum ClientStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl std::io::Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
        }
    }
}

/// An outbound RPC stub bound to a single peer.
#[derive(Debug, Clone)]
pub struct RpcClient {
    connect: String,
    target: ClientTarget,
}

impl RpcClient {
    /// Builds a client from a target URL.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Target`] when the URL cannot be resolved to a
    /// supported transport.
    pub fn new(connect: impl Into<String>) -> Result<Self, CallError> {
        let connect = connect.into();
        let target = ClientTarget::parse(&connect)?;
        Ok(Self { connect, target })
    }

    /// Returns the configured target URL.
    #[must_use]
    pub fn connect_url(&self) -> &str {
        &self.connect
    }

    /// Issues one JSON-RPC call and returns the decoded response envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Refused`] when the peer is not accepting
    /// connections, and other [`CallError`] variants for transport or
    /// framing failures. A response envelope carrying an `error` member is
    /// *not* an `Err`: interpreting the envelope is the caller's concern.
    pub fn call(&self, method: &str, params: Option<Value>) -> Result<RpcResponse, CallError> {
        let request = RpcRequest::new(method, params);
        let body = serde_json::to_vec(&request).map_err(CallError::Encode)?;

        debug!(
            target: CLIENT_TARGET,
            connect = %self.connect,
            method,
            id = request.id,
            "issuing outbound call"
        );

        let mut stream = self.open_stream()?;
        http::write_request(
            &mut stream,
            self.target.request_path(),
            &self.target.host_header(),
            &body,
        )?;

        let mut reader = BufReader::new(stream);
        let response = http::read_response(&mut reader)?;
        if response.status != 200 {
            return Err(CallError::Status {
                connect: self.connect.clone(),
                status: response.status,
            });
        }

        serde_json::from_slice(&response.body).map_err(CallError::Decode)
    }

    fn open_stream(&self) -> Result<ClientStream, CallError> {
        let result = match &self.target {
            ClientTarget::Tcp { host, port, .. } => {
                TcpStream::connect((host.as_str(), *port)).map(ClientStream::Tcp)
            }
            #[cfg(unix)]
            ClientTarget::Unix { path } => UnixStream::connect(path).map(ClientStream::Unix),
            #[cfg(not(unix))]
            ClientTarget::Unix { .. } => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        };

        result.map_err(|source| {
            if source.kind() == std::io::ErrorKind::ConnectionRefused {
                CallError::Refused {
                    connect: self.connect.clone(),
                }
            } else {
                CallError::Connect {
                    connect: self.connect.clone(),
                    source,
                }
            }
        })
    }
}

/// Errors surfaced by outbound calls.
#[derive(Debug, Error)]
pub enum CallError {
    /// The target URL could not be resolved to a supported transport.
    #[error("invalid client target '{connect}': {message}")]
    Target { connect: String, message: String },
    /// The peer refused the connection.
    #[error("connection to '{connect}' refused")]
    Refused { connect: String },
    /// Connecting to the peer failed for another reason.
    #[error("failed to connect to '{connect}': {source}")]
    Connect {
        connect: String,
        #[source]
        source: std::io::Error,
    },
    /// The HTTP exchange failed.
    #[error(transparent)]
    Http(#[from] HttpError),
    /// The peer answered with a non-200 HTTP status.
    #[error("peer '{connect}' answered HTTP status {status}")]
    Status { connect: String, status: u16 },
    /// The request envelope could not be serialised.
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    /// The response body was not a JSON-RPC envelope.
    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),
}

impl CallError {
    /// Returns true when the failure was a refused connection.
    #[must_use]
    pub fn is_refused(&self) -> bool {
        matches!(self, Self::Refused { .. })
    }
}
