//! Listener socket endpoints.
//!
//! The connector and the metrics exposition endpoint each bind one of these.
//! Endpoints are always assembled from resolved configuration parts; the
//! framework never parses them back out of URLs. When a Unix socket path is
//! configured it takes precedence over the TCP host/port pair.

use std::fmt;
use std::fs;
use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Where a listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEndpoint {
    /// Unix domain socket at the given path.
    Unix { path: Utf8PathBuf },
    /// TCP socket on the given host and port.
    Tcp { host: String, port: u16 },
}

impl SocketEndpoint {
    /// Builds a Unix domain socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a TCP endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Whether this endpoint uses the Unix transport.
    #[must_use]
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix { .. })
    }

    /// Prepares the filesystem for binding this endpoint.
    ///
    /// For Unix endpoints a missing parent directory chain is created and
    /// the socket's immediate parent is restricted to the owning user. A
    /// parent that already exists keeps its permissions. TCP endpoints need
    /// no preparation.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] when the path has no parent directory or the
    /// directory cannot be created.
    pub fn ensure_ready(&self) -> Result<(), EndpointError> {
        let Self::Unix { path } = self else {
            return Ok(());
        };
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .ok_or_else(|| EndpointError::NoParent { path: path.clone() })?;

        let parent_std = parent.as_std_path();
        if parent_std.exists() {
            return Ok(());
        }

        fs::create_dir_all(parent_std).map_err(|source| EndpointError::Prepare {
            path: parent.to_path_buf(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent_std, fs::Permissions::from_mode(0o700)).map_err(
                |source| EndpointError::Prepare {
                    path: parent.to_path_buf(),
                    source,
                },
            )?;
        }

        Ok(())
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(f, "unix://{path}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

/// Errors raised while preparing an endpoint for binding.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// A Unix socket path had no parent directory to create.
    #[error("unix socket path '{path}' lacks a parent directory")]
    NoParent { path: Utf8PathBuf },
    /// Creating or restricting the socket directory failed.
    #[error("could not prepare '{path}' for the listener socket: {source}")]
    Prepare {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_both_transports() {
        assert_eq!(
            SocketEndpoint::unix("/run/lattice/connector.sock").to_string(),
            "unix:///run/lattice/connector.sock"
        );
        assert_eq!(
            SocketEndpoint::tcp("0.0.0.0", 3000).to_string(),
            "tcp://0.0.0.0:3000"
        );
    }

    #[test]
    fn ensure_ready_creates_missing_parent_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("deep/nested/lattice.sock");
        let endpoint = SocketEndpoint::unix(
            Utf8PathBuf::from_path_buf(socket.clone()).expect("utf8 path"),
        );

        endpoint.ensure_ready().expect("prepare");

        assert!(socket.parent().expect("parent").is_dir());
    }

    #[test]
    fn ensure_ready_leaves_existing_directories_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("lattice.sock");
        let endpoint = SocketEndpoint::unix(
            Utf8PathBuf::from_path_buf(socket).expect("utf8 path"),
        );

        // The tempdir itself already exists; preparation must not touch it.
        endpoint.ensure_ready().expect("prepare");
        assert!(dir.path().is_dir());
    }

    #[test]
    fn ensure_ready_rejects_bare_relative_paths() {
        let endpoint = SocketEndpoint::unix("lattice.sock");
        let error = endpoint.ensure_ready().expect_err("no parent");
        assert!(matches!(error, EndpointError::NoParent { .. }));
    }

    #[test]
    fn ensure_ready_is_a_noop_for_tcp() {
        SocketEndpoint::tcp("127.0.0.1", 0)
            .ensure_ready()
            .expect("tcp needs no preparation");
    }

    #[test]
    fn is_unix_distinguishes_transports() {
        assert!(SocketEndpoint::unix("/tmp/x.sock").is_unix());
        assert!(!SocketEndpoint::tcp("127.0.0.1", 80).is_unix());
    }
}
