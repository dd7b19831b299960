//! Readiness probes.
//!
//! A probe performs the smallest protocol-level exchange that proves a
//! database inside a container is accepting clients: open a connection,
//! check the greeting, close. Any failure (refused, reset, not yet
//! authenticating, timeout) is reported as [`NotReady`]. Probes never mutate
//! the database, so they are safe to run repeatedly and from many processes.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::container::ContainerConfig;

/// Upper bound for a single probe attempt.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long [`TcpProbe`] waits for the peer to hang up after connecting.
pub const TCP_HANGUP_GRACE: Duration = Duration::from_millis(200);

/// The container is not (yet) accepting connections.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("container not ready: {reason}")]
pub struct NotReady {
    pub reason: String,
}

impl NotReady {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Check whether the container described by `config` is ready for clients.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self, config: &ContainerConfig) -> Result<(), NotReady>;
}

async fn connect(config: &ContainerConfig) -> Result<TcpStream, NotReady> {
    let addr = format!("{}:{}", config.host(), config.host_port());
    tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| NotReady::new(format!("timed out connecting to {addr}")))?
        .map_err(|e| NotReady::new(format!("{addr}: {e}")))
}

/// Accepts a TCP connection that the peer keeps open.
///
/// Docker's userland proxy accepts on the published port as soon as the
/// container starts and hangs up if nothing inside is listening yet, so a
/// connect alone proves nothing. The probe waits [`TCP_HANGUP_GRACE`] for
/// end-of-stream; silence or a greeting counts as ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn check(&self, config: &ContainerConfig) -> Result<(), NotReady> {
        let mut stream = connect(config).await?;
        let mut byte = [0u8; 1];
        match tokio::time::timeout(TCP_HANGUP_GRACE, stream.read(&mut byte)).await {
            Err(_) | Ok(Ok(1..)) => Ok(()),
            Ok(Ok(0)) => Err(NotReady::new("connection closed by peer")),
            Ok(Err(e)) => Err(NotReady::new(format!("connection lost: {e}"))),
        }
    }
}

/// Sends `PING` and expects `+PONG`.
///
/// Redis answers `-LOADING` while it replays its dataset, which counts as not
/// ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisProbe;

#[async_trait]
impl ReadinessProbe for RedisProbe {
    async fn check(&self, config: &ContainerConfig) -> Result<(), NotReady> {
        let exchange = async {
            let stream = connect(config).await?;
            let mut reader = BufReader::new(stream);
            reader
                .get_mut()
                .write_all(b"PING\r\n")
                .await
                .map_err(|e| NotReady::new(format!("write PING: {e}")))?;

            let mut line = String::new();
            reader
                .read_line(&mut line)
                .await
                .map_err(|e| NotReady::new(format!("read PING reply: {e}")))?;

            if line.starts_with("+PONG") {
                Ok(())
            } else {
                Err(NotReady::new(format!("unexpected PING reply: {}", line.trim_end())))
            }
        };

        tokio::time::timeout(PROBE_TIMEOUT, exchange)
            .await
            .map_err(|_| NotReady::new("timed out waiting for PONG"))?
    }
}

/// Reads the MySQL server greeting.
///
/// The server speaks first: a packet header (3-byte length, sequence id)
/// followed by the protocol version, which is `10` for every supported
/// server. `0xff` is an error packet (e.g. still initializing).
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlProbe;

const MYSQL_PROTOCOL_V10: u8 = 0x0a;
const MYSQL_ERR_PACKET: u8 = 0xff;

#[async_trait]
impl ReadinessProbe for MysqlProbe {
    async fn check(&self, config: &ContainerConfig) -> Result<(), NotReady> {
        let exchange = async {
            let mut stream = connect(config).await?;
            let mut head = [0u8; 5];
            stream
                .read_exact(&mut head)
                .await
                .map_err(|e| NotReady::new(format!("read greeting: {e}")))?;

            match head[4] {
                MYSQL_PROTOCOL_V10 => Ok(()),
                MYSQL_ERR_PACKET => Err(NotReady::new("server sent an error packet")),
                other => Err(NotReady::new(format!("unexpected protocol version {other}"))),
            }
        };

        tokio::time::timeout(PROBE_TIMEOUT, exchange)
            .await
            .map_err(|_| NotReady::new("timed out waiting for greeting"))?
    }
}

/// Sends a legacy `isMaster` command and requires a well-formed reply.
///
/// `OP_QUERY` against `admin.$cmd` is still accepted for the connection
/// handshake by every server version. The reply must echo the request id,
/// and an `OP_REPLY` must not carry the query-failure flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoProbe;

const MONGO_OP_REPLY: i32 = 1;
const MONGO_OP_QUERY: i32 = 2004;
const MONGO_OP_MSG: i32 = 2013;
const MONGO_QUERY_FAILURE: i32 = 0x2;
const MONGO_MAX_MESSAGE: i32 = 48 * 1024 * 1024;

static MONGO_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// `OP_QUERY { isMaster: 1 }` on `admin.$cmd`.
fn mongo_is_master(request_id: i32) -> Vec<u8> {
    let mut query = Vec::with_capacity(19);
    query.extend_from_slice(&19i32.to_le_bytes());
    query.push(0x10);
    query.extend_from_slice(b"isMaster\0");
    query.extend_from_slice(&1i32.to_le_bytes());
    query.push(0x00);

    let mut body = Vec::with_capacity(42);
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(b"admin.$cmd\0");
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&(-1i32).to_le_bytes());
    body.extend_from_slice(&query);

    let mut message = Vec::with_capacity(16 + body.len());
    message.extend_from_slice(&(16 + body.len() as i32).to_le_bytes());
    message.extend_from_slice(&request_id.to_le_bytes());
    message.extend_from_slice(&0i32.to_le_bytes());
    message.extend_from_slice(&MONGO_OP_QUERY.to_le_bytes());
    message.extend_from_slice(&body);
    message
}

fn le_i32(bytes: &[u8], at: usize) -> i32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    i32::from_le_bytes(word)
}

#[async_trait]
impl ReadinessProbe for MongoProbe {
    async fn check(&self, config: &ContainerConfig) -> Result<(), NotReady> {
        let exchange = async {
            let mut stream = connect(config).await?;
            let request_id = MONGO_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
            stream
                .write_all(&mongo_is_master(request_id))
                .await
                .map_err(|e| NotReady::new(format!("write isMaster: {e}")))?;

            let mut header = [0u8; 16];
            stream
                .read_exact(&mut header)
                .await
                .map_err(|e| NotReady::new(format!("read isMaster reply: {e}")))?;

            let length = le_i32(&header, 0);
            let response_to = le_i32(&header, 8);
            let op_code = le_i32(&header, 12);
            if !(16..=MONGO_MAX_MESSAGE).contains(&length) {
                return Err(NotReady::new(format!("implausible reply length {length}")));
            }
            if response_to != request_id {
                return Err(NotReady::new(format!(
                    "reply answers request {response_to}, expected {request_id}"
                )));
            }

            let mut body = vec![0u8; length as usize - 16];
            stream
                .read_exact(&mut body)
                .await
                .map_err(|e| NotReady::new(format!("read isMaster body: {e}")))?;

            match op_code {
                MONGO_OP_REPLY if body.len() < 20 => Err(NotReady::new("truncated OP_REPLY")),
                MONGO_OP_REPLY if le_i32(&body, 0) & MONGO_QUERY_FAILURE != 0 => {
                    Err(NotReady::new("isMaster query failed"))
                }
                MONGO_OP_REPLY | MONGO_OP_MSG => Ok(()),
                other => Err(NotReady::new(format!("unexpected reply opcode {other}"))),
            }
        };

        tokio::time::timeout(PROBE_TIMEOUT, exchange)
            .await
            .map_err(|_| NotReady::new("timed out waiting for isMaster reply"))?
    }
}

/// Completes a full Postgres startup and authentication handshake against
/// the root database, then drops the connection.
///
/// The official image restarts the server once after running its init
/// scripts, so a successful TCP connect alone is not enough.
#[cfg(feature = "postgres")]
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresProbe;

#[cfg(feature = "postgres")]
#[async_trait]
impl ReadinessProbe for PostgresProbe {
    async fn check(&self, config: &ContainerConfig) -> Result<(), NotReady> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(config.host())
            .port(config.host_port())
            .user(config.username())
            .password(config.password())
            .dbname(config.root_database())
            .connect_timeout(PROBE_TIMEOUT);

        let connected = tokio::time::timeout(PROBE_TIMEOUT, pg.connect(tokio_postgres::NoTls))
            .await
            .map_err(|_| NotReady::new("timed out during postgres handshake"))?;

        match connected {
            Ok((client, connection)) => {
                drop(client);
                drop(connection);
                Ok(())
            }
            Err(e) => Err(NotReady::new(format!("postgres: {e}"))),
        }
    }
}

/// Without the `postgres` feature: sends an `SSLRequest` and expects the
/// single-byte `S` or `N` answer from the postmaster.
#[cfg(not(feature = "postgres"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresProbe;

#[cfg(not(feature = "postgres"))]
const POSTGRES_SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];

#[cfg(not(feature = "postgres"))]
#[async_trait]
impl ReadinessProbe for PostgresProbe {
    async fn check(&self, config: &ContainerConfig) -> Result<(), NotReady> {
        let exchange = async {
            let mut stream = connect(config).await?;
            stream
                .write_all(&POSTGRES_SSL_REQUEST)
                .await
                .map_err(|e| NotReady::new(format!("write SSLRequest: {e}")))?;

            let mut answer = [0u8; 1];
            stream
                .read_exact(&mut answer)
                .await
                .map_err(|e| NotReady::new(format!("read SSLRequest answer: {e}")))?;

            match answer[0] {
                b'S' | b'N' => Ok(()),
                other => Err(NotReady::new(format!("unexpected SSLRequest answer {other:#04x}"))),
            }
        };

        tokio::time::timeout(PROBE_TIMEOUT, exchange)
            .await
            .map_err(|_| NotReady::new("timed out waiting for SSLRequest answer"))?
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::container::ContainerConfig;

    async fn listener() -> (TcpListener, ContainerConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ContainerConfig::custom("probe-test", "scratch", port, port, TcpProbe);
        (listener, config)
    }

    /// A port that was free a moment ago; nothing is listening on it.
    fn closed_port_config() -> ContainerConfig {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        ContainerConfig::custom("probe-test", "scratch", port, port, TcpProbe)
    }

    /// Accepts every connection and hangs up straight away, like Docker's
    /// port proxy while the container's server is still booting.
    fn hang_up_on_accept(listener: TcpListener) {
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let (_listener, config) = listener().await;
        assert!(TcpProbe.check(&config).await.is_ok());
        assert!(TcpProbe.check(&closed_port_config()).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe_peer_hangs_up() {
        let (listener, config) = listener().await;
        hang_up_on_accept(listener);
        let err = TcpProbe.check(&config).await.unwrap_err();
        assert!(err.reason.contains("closed") || err.reason.contains("lost"));
    }

    #[test]
    fn test_mongo_is_master_encoding() {
        let message = mongo_is_master(7);
        assert_eq!(message.len(), 58);
        assert_eq!(le_i32(&message, 0), 58);
        assert_eq!(le_i32(&message, 4), 7);
        assert_eq!(le_i32(&message, 12), MONGO_OP_QUERY);
        assert_eq!(&message[20..31], b"admin.$cmd\0");
    }

    /// Reads an isMaster query and answers it with an `OP_REPLY` carrying
    /// `flags`.
    fn mongo_server(listener: TcpListener, flags: i32) {
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut query = [0u8; 58];
            socket.read_exact(&mut query).await.unwrap();
            assert_eq!(le_i32(&query, 12), MONGO_OP_QUERY);

            let document = [0x05, 0x00, 0x00, 0x00, 0x00];
            let mut reply = Vec::new();
            reply.extend_from_slice(&41i32.to_le_bytes());
            reply.extend_from_slice(&99i32.to_le_bytes());
            reply.extend_from_slice(&query[4..8]);
            reply.extend_from_slice(&MONGO_OP_REPLY.to_le_bytes());
            reply.extend_from_slice(&flags.to_le_bytes());
            reply.extend_from_slice(&0i64.to_le_bytes());
            reply.extend_from_slice(&0i32.to_le_bytes());
            reply.extend_from_slice(&1i32.to_le_bytes());
            reply.extend_from_slice(&document);
            socket.write_all(&reply).await.unwrap();
        });
    }

    #[tokio::test]
    async fn test_mongo_probe_reply() {
        let (listener, config) = listener().await;
        mongo_server(listener, 0);
        assert!(MongoProbe.check(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_mongo_probe_query_failure() {
        let (listener, config) = listener().await;
        mongo_server(listener, MONGO_QUERY_FAILURE);
        let err = MongoProbe.check(&config).await.unwrap_err();
        assert!(err.reason.contains("query failed"));
    }

    #[tokio::test]
    async fn test_mongo_probe_peer_hangs_up() {
        let (listener, config) = listener().await;
        hang_up_on_accept(listener);
        assert!(MongoProbe.check(&config).await.is_err());
        assert!(MongoProbe.check(&closed_port_config()).await.is_err());
    }

    #[tokio::test]
    async fn test_mongo_probe_mismatched_response_to() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut query = [0u8; 58];
            socket.read_exact(&mut query).await.unwrap();
            let mut header = Vec::new();
            header.extend_from_slice(&16i32.to_le_bytes());
            header.extend_from_slice(&1i32.to_le_bytes());
            header.extend_from_slice(&(-5i32).to_le_bytes());
            header.extend_from_slice(&MONGO_OP_REPLY.to_le_bytes());
            socket.write_all(&header).await.unwrap();
        });
        let err = MongoProbe.check(&config).await.unwrap_err();
        assert!(err.reason.contains("expected"));
    }

    #[tokio::test]
    async fn test_redis_probe_pong() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 6];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PING\r\n");
            socket.write_all(b"+PONG\r\n").await.unwrap();
        });
        assert!(RedisProbe.check(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_redis_probe_loading() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 6];
            socket.read_exact(&mut buf).await.unwrap();
            socket
                .write_all(b"-LOADING Redis is loading the dataset in memory\r\n")
                .await
                .unwrap();
        });
        let err = RedisProbe.check(&config).await.unwrap_err();
        assert!(err.reason.contains("LOADING"));
    }

    #[tokio::test]
    async fn test_mysql_probe_greeting() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(&[0x4a, 0x00, 0x00, 0x00, 0x0a, b'5', b'.', b'6'])
                .await
                .unwrap();
        });
        assert!(MysqlProbe.check(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_mysql_probe_error_packet() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(&[0x10, 0x00, 0x00, 0x00, 0xff, 0x69, 0x04])
                .await
                .unwrap();
        });
        assert!(MysqlProbe.check(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_mysql_probe_closed_early() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });
        assert!(MysqlProbe.check(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_postgres_probe_refused() {
        assert!(PostgresProbe.check(&closed_port_config()).await.is_err());
    }

    #[tokio::test]
    async fn test_postgres_probe_peer_hangs_up() {
        let (listener, config) = listener().await;
        hang_up_on_accept(listener);
        assert!(PostgresProbe.check(&config).await.is_err());
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_postgres_probe_ssl_answer() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 8];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(request, POSTGRES_SSL_REQUEST);
            socket.write_all(b"N").await.unwrap();
        });
        assert!(PostgresProbe.check(&config).await.is_ok());
    }
}
