//! The TCP/TLS listener and per-connection pump tasks.
//!
//! Each accepted socket gets a reader task (bytes → framed XML elements →
//! core events) and a writer task (outbound queue → socket, reporting a
//! `sent` event per message so the registry can advance its window). The
//! core never blocks on either.
use anyhow::{Context, Result};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use weft::{Connection, ConnectionId, ConnectionStatus, XmlElement, XmlStream};

/// How the listener treats transport security.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecurityPolicy {
    /// Plain TCP only.
    NoTls,
    /// TLS when key material is configured, plain otherwise.
    AllowTls,
    /// Refuse to start without TLS.
    RequireTls,
}

impl FromStr for SecurityPolicy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, String> {
        match value {
            "no-tls" => Ok(SecurityPolicy::NoTls),
            "allow-tls" => Ok(SecurityPolicy::AllowTls),
            "require-tls" => Ok(SecurityPolicy::RequireTls),
            other => Err(format!("unknown security policy {:?}", other)),
        }
    }
}

/// Events delivered from the transport to the server core.
pub enum NetEvent {
    /// A socket finished its handshake.
    Connected {
        /// The connection handle to register.
        connection: Arc<NetConnection>,
    },
    /// One complete message arrived.
    Message {
        /// Origin connection.
        id: ConnectionId,
        /// The parsed top-level element.
        element: XmlElement,
    },
    /// The writer finished transmitting one message.
    Sent {
        /// The transmitting connection.
        id: ConnectionId,
    },
    /// The socket is gone.
    Closed {
        /// The closed connection.
        id: ConnectionId,
    },
}

enum WriterMsg {
    Element(XmlElement),
    Shutdown,
}

/// A live socket as seen by the session machinery.
pub struct NetConnection {
    id: ConnectionId,
    remote: String,
    writer: mpsc::UnboundedSender<WriterMsg>,
    status: AtomicU8,
}

impl NetConnection {
    /// Asks the writer task to wind the connection down.
    pub fn close(&self) {
        self.set_status(ConnectionStatus::Closing);
        let _ = self.writer.send(WriterMsg::Shutdown);
    }

    fn set_status(&self, status: ConnectionStatus) {
        let value = match status {
            ConnectionStatus::Opening => 0,
            ConnectionStatus::Open => 1,
            ConnectionStatus::Closing => 2,
            ConnectionStatus::Closed => 3,
        };
        self.status.store(value, Ordering::SeqCst);
    }
}

impl Connection for NetConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn status(&self) -> ConnectionStatus {
        match self.status.load(Ordering::SeqCst) {
            0 => ConnectionStatus::Opening,
            1 => ConnectionStatus::Open,
            2 => ConnectionStatus::Closing,
            _ => ConnectionStatus::Closed,
        }
    }

    fn send(&self, element: XmlElement) -> weft::Result<()> {
        if self.status() != ConnectionStatus::Open {
            return Err(weft::Error::ConnectionClosed);
        }
        self.writer
            .send(WriterMsg::Element(element))
            .map_err(|_| weft::Error::ConnectionClosed)
    }

    fn remote_identifier(&self) -> String {
        self.remote.clone()
    }
}

/// Loads a rustls acceptor from PEM key and certificate files.
pub fn tls_acceptor(key_file: &Path, certificate_file: &Path) -> Result<TlsAcceptor> {
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(certificate_file)
            .with_context(|| format!("opening {}", certificate_file.display()))?,
    ))
    .collect::<std::io::Result<_>>()
    .context("reading certificate chain")?;
    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_file)
            .with_context(|| format!("opening {}", key_file.display()))?,
    ))
    .context("reading private key")?
    .context("key file holds no private key")?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building tls config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accepts sockets forever, spawning pump tasks per connection.
pub async fn run_listener(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    events: mpsc::Sender<NetEvent>,
) {
    let mut next_id = 1u64;
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let id = ConnectionId(next_id);
        next_id += 1;
        let events = events.clone();
        let tls = tls.clone();
        let remote = peer.to_string();
        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(stream) => pump(id, remote, stream, events).await,
                    Err(err) => {
                        warn!(%id, %err, "tls handshake failed");
                    }
                },
                None => pump(id, remote, socket, events).await,
            }
        });
    }
}

/// Runs the reader and writer halves of one established stream.
async fn pump<S>(id: ConnectionId, remote: String, stream: S, events: mpsc::Sender<NetEvent>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    info!(%id, remote, "connection established");
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(NetConnection {
        id,
        remote,
        writer: writer_tx,
        status: AtomicU8::new(1),
    });
    if events
        .send(NetEvent::Connected {
            connection: connection.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    let writer_events = events.clone();
    let writer_conn = connection.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = writer_rx.recv().await {
            match message {
                WriterMsg::Element(element) => {
                    if write_half.write_all(&element.to_bytes()).await.is_err() {
                        break;
                    }
                    if writer_events
                        .send(NetEvent::Sent { id })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WriterMsg::Shutdown => break,
            }
        }
        writer_conn.set_status(ConnectionStatus::Closed);
        let _ = write_half.shutdown().await;
    });

    let mut framer = XmlStream::new();
    let mut buffer = [0u8; 8192];
    loop {
        match read_half.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => match framer.feed(&buffer[..n]) {
                Ok(messages) => {
                    for element in messages {
                        if events
                            .send(NetEvent::Message { id, element })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Err(err) => {
                    debug!(%id, %err, "closing connection on malformed stream");
                    break;
                }
            },
            Err(err) => {
                debug!(%id, %err, "read failed");
                break;
            }
        }
    }
    connection.close();
    let _ = writer.await;
    connection.set_status(ConnectionStatus::Closed);
    let _ = events.send(NetEvent::Closed { id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn listener_frames_messages_and_reports_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(run_listener(listener, None, tx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let NetEvent::Connected { connection } = rx.recv().await.unwrap() else {
            panic!("expected connect event");
        };
        assert_eq!(connection.status(), ConnectionStatus::Open);

        // Two messages split across arbitrary write boundaries.
        client.write_all(b"<login name=\"alice\"").await.unwrap();
        client
            .write_all(b" password=\"pw\"/><sync-ack/>")
            .await
            .unwrap();
        let NetEvent::Message { element, .. } = rx.recv().await.unwrap() else {
            panic!("expected first message");
        };
        assert_eq!(element.name(), "login");
        assert_eq!(element.attr("name"), Some("alice"));
        let NetEvent::Message { element, .. } = rx.recv().await.unwrap() else {
            panic!("expected second message");
        };
        assert_eq!(element.name(), "sync-ack");

        // Outbound path: send one element, expect bytes plus a sent event.
        connection
            .send(XmlElement::new("welcome").with_attr("protocol-version", "1.0"))
            .unwrap();
        let NetEvent::Sent { id } = rx.recv().await.unwrap() else {
            panic!("expected sent event");
        };
        assert_eq!(id, connection.id());
        let mut read = vec![0u8; 256];
        let n = client.read(&mut read).await.unwrap();
        assert!(String::from_utf8_lossy(&read[..n]).contains("welcome"));

        drop(client);
        loop {
            match rx.recv().await.unwrap() {
                NetEvent::Closed { id } => {
                    assert_eq!(id, connection.id());
                    break;
                }
                _ => continue,
            }
        }
    }
}
