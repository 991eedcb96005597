//! Listener transport for the daemon's wire protocol.

use std::path::PathBuf;

use crate::errors::{BurrowError, BurrowResult};

/// Where the daemon listens for client connections.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Transport {
    /// TCP transport, `host:port`.
    Tcp { addr: String },

    /// Unix socket transport.
    Unix { socket_path: PathBuf },
}

impl Transport {
    /// Create a TCP transport.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::Tcp { addr: addr.into() }
    }

    /// Create a Unix socket transport.
    pub fn unix(socket_path: impl Into<PathBuf>) -> Self {
        Self::Unix {
            socket_path: socket_path.into(),
        }
    }

    /// Build a transport from the daemon's `--listen-network` and
    /// `--listen-addr` flag pair.
    pub fn from_flags(network: &str, addr: &str) -> BurrowResult<Self> {
        match network {
            "unix" => Ok(Self::unix(addr)),
            "tcp" => Ok(Self::tcp(addr)),
            other => Err(BurrowError::InvalidArgument(format!(
                "unsupported listen network {:?}: expected unix or tcp",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp { addr } => write!(f, "tcp://{}", addr),
            Transport::Unix { socket_path } => write!(f, "unix://{}", socket_path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_flags_accepts_unix_and_tcp() {
        assert_eq!(
            Transport::from_flags("unix", "/tmp/burrow.sock").unwrap(),
            Transport::unix("/tmp/burrow.sock")
        );
        assert_eq!(
            Transport::from_flags("tcp", "127.0.0.1:7777").unwrap(),
            Transport::tcp("127.0.0.1:7777")
        );
    }

    #[test]
    fn from_flags_rejects_unknown_network() {
        let err = Transport::from_flags("vsock", "1024").unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn display_renders_uri() {
        assert_eq!(
            Transport::unix("/run/burrow.sock").to_string(),
            "unix:///run/burrow.sock"
        );
        assert_eq!(Transport::tcp("0.0.0.0:7777").to_string(), "tcp://0.0.0.0:7777");
    }
}
