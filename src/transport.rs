//! Transport handshake: the channel between the protocol client and the
//! language server, opened only after the server signalled readiness.
//!
//! - `stdio`: the child's stdout/stdin are the channel.
//! - `socket`: a loopback port is reserved before spawn, passed to the child,
//!   and connected to once after readiness. A refused connection is a startup
//!   failure; the same port is never retried.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::SessionError;
use crate::supervisor::Supervisor;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    #[default]
    Socket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "addr", rename_all = "lowercase")]
pub enum Endpoint {
    Stdio,
    Socket(SocketAddr),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Stdio => write!(f, "stdio"),
            Endpoint::Socket(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// An open message channel handed to the protocol client.
pub struct Transport {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub endpoint: Endpoint,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("endpoint", &self.endpoint).finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W, endpoint: Endpoint) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            endpoint,
        }
    }

    /// Single connect attempt to a loopback port, bounded by `timeout`.
    pub async fn connect(port: u16, timeout: Duration) -> Result<Self, SessionError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(SessionError::Handshake(format!("connect to {} failed: {}", addr, e)))
            }
            Err(_) => {
                return Err(SessionError::Handshake(format!(
                    "connect to {} timed out after {:?}",
                    addr, timeout
                )))
            }
        };
        let _ = stream.set_nodelay(true);
        tracing::info!("Connected to language server at {}", addr);

        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer, Endpoint::Socket(addr)))
    }
}

/// Ask the OS for a free ephemeral loopback port. The probe socket is closed
/// before returning so the child can bind the same number.
pub fn reserve_loopback_port() -> Result<u16, SessionError> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| SessionError::Handshake(format!("cannot reserve a loopback port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| SessionError::Handshake(format!("cannot read reserved port: {}", e)))?
        .port();
    drop(listener);
    Ok(port)
}

/// Transport decided before spawn; opened after readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPlan {
    Stdio,
    Socket { port: u16 },
}

impl TransportPlan {
    pub fn prepare(kind: TransportKind) -> Result<Self, SessionError> {
        match kind {
            TransportKind::Stdio => Ok(TransportPlan::Stdio),
            TransportKind::Socket => {
                let port = reserve_loopback_port()?;
                tracing::info!("Reserved loopback port {} for the language server", port);
                Ok(TransportPlan::Socket { port })
            }
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            TransportPlan::Stdio => TransportKind::Stdio,
            TransportPlan::Socket { .. } => TransportKind::Socket,
        }
    }

    /// Extra launch argument for the child (the port number), if any.
    pub fn port(&self) -> Option<u16> {
        match self {
            TransportPlan::Stdio => None,
            TransportPlan::Socket { port } => Some(*port),
        }
    }

    /// Open the channel to the ready child held by `supervisor`.
    pub async fn open(&self, supervisor: &mut Supervisor) -> Result<Transport, SessionError> {
        match self {
            TransportPlan::Stdio => {
                let (reader, writer) = supervisor.take_stdio().ok_or_else(|| {
                    SessionError::Handshake("child stdio is not available".to_string())
                })?;
                Ok(Transport::new(reader, writer, Endpoint::Stdio))
            }
            TransportPlan::Socket { port } => Transport::connect(*port, CONNECT_TIMEOUT).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn reserved_port_is_ephemeral_and_free_again() {
        let port = reserve_loopback_port().unwrap();
        assert!(port >= 1024);
        // 예약 소켓이 닫혔으므로 자식이 같은 포트를 바인드할 수 있어야 함
        let rebound = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port));
        assert!(rebound.is_ok());
    }

    #[test]
    fn stdio_plan_has_no_port_argument() {
        let plan = TransportPlan::prepare(TransportKind::Stdio).unwrap();
        assert_eq!(plan, TransportPlan::Stdio);
        assert_eq!(plan.port(), None);
        assert_eq!(plan.kind(), TransportKind::Stdio);
    }

    #[tokio::test]
    async fn socket_connect_round_trip() {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut transport = Transport::connect(port, CONNECT_TIMEOUT).await.unwrap();
        assert_eq!(
            transport.endpoint,
            Endpoint::Socket(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        );
        transport.writer.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        transport.reader.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_handshake_error() {
        let port = reserve_loopback_port().unwrap();
        let err = Transport::connect(port, CONNECT_TIMEOUT).await.unwrap_err();
        assert_eq!(err.error_code(), "HANDSHAKE_ERROR");
    }

    #[test]
    fn transport_kind_from_config_strings() {
        #[derive(Deserialize)]
        struct Wrapper {
            transport: TransportKind,
        }
        let w: Wrapper = toml::from_str("transport = \"stdio\"").unwrap();
        assert_eq!(w.transport, TransportKind::Stdio);
        assert_eq!(TransportKind::default(), TransportKind::Socket);
    }

    #[test]
    fn endpoint_display() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 4000));
        assert_eq!(Endpoint::Socket(addr).to_string(), "tcp://127.0.0.1:4000");
        assert_eq!(Endpoint::Stdio.to_string(), "stdio");
    }
}
