//! End-to-end exercise of the server over real sockets: login, directory
//! browsing, session subscription and concurrent editing between two
//! clients.
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use weft::{XmlElement, XmlStream};
use weft_server::accounts::AccountStore;
use weft_server::server::Server;
use weft_server::transport;

struct Client {
    stream: TcpStream,
    framer: XmlStream,
    queued: Vec<XmlElement>,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Client {
        Client {
            stream: TcpStream::connect(addr).await.unwrap(),
            framer: XmlStream::new(),
            queued: Vec::new(),
        }
    }

    async fn send(&mut self, element: XmlElement) {
        self.stream.write_all(&element.to_bytes()).await.unwrap();
    }

    /// Sends `element` wrapped in a group container addressed to the
    /// server-published group `group`.
    async fn send_grouped(&mut self, group: &str, element: XmlElement) {
        let container = XmlElement::new("group")
            .with_attr("name", group)
            .with_attr("publisher", "you")
            .with_child(element);
        self.send(container).await;
    }

    /// Receives the next message, unwrapping group containers.
    async fn recv(&mut self) -> XmlElement {
        loop {
            if !self.queued.is_empty() {
                return self.queued.remove(0);
            }
            let mut buf = [0u8; 4096];
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for a message")
                .unwrap();
            assert!(n > 0, "server closed the connection unexpectedly");
            for message in self.framer.feed(&buf[..n]).unwrap() {
                if message.name() == "group" {
                    self.queued.extend(message.children().iter().cloned());
                } else {
                    self.queued.push(message);
                }
            }
        }
    }

    /// Receives until a message named `name` arrives.
    async fn recv_until(&mut self, name: &str) -> XmlElement {
        loop {
            let message = self.recv().await;
            if message.name() == name {
                return message;
            }
        }
    }
}

async fn start_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, mut rx) = mpsc::channel(256);
    tokio::spawn(transport::run_listener(listener, None, tx));
    tokio::spawn(async move {
        let mut server = Server::new("weftd", AccountStore::in_memory(), None, None);
        while let Some(event) = rx.recv().await {
            server.handle_event(event);
        }
    });
    addr
}

#[tokio::test]
async fn two_clients_edit_one_document() {
    let addr = start_server().await;

    // First client logs in and creates a document.
    let mut alice = Client::connect(addr).await;
    alice.send(XmlElement::new("login").with_attr("name", "alice")).await;
    let welcome = alice.recv_until("welcome").await;
    assert_eq!(welcome.attr("protocol-version"), Some("1.0"));
    let root: u32 = welcome.attr("root").unwrap().parse().unwrap();

    alice
        .send_grouped(
            "directory",
            XmlElement::new("explore-node").with_attr("id", root),
        )
        .await;
    let begin = alice.recv_until("explore-begin").await;
    assert_eq!(begin.attr("total"), Some("0"));
    alice.recv_until("explore-end").await;

    alice
        .send_grouped(
            "directory",
            XmlElement::new("add-node")
                .with_attr("parent", root)
                .with_attr("name", "shared")
                .with_attr("type", "text"),
        )
        .await;
    let added = alice.recv_until("add-node").await;
    assert_eq!(added.attr("name"), Some("shared"));
    let node: u32 = added.attr("id").unwrap().parse().unwrap();

    // Subscribe and complete the handshake.
    alice
        .send_grouped(
            "directory",
            XmlElement::new("subscribe-session").with_attr("id", node),
        )
        .await;
    let offer = alice.recv_until("subscribe-session").await;
    let group = offer.attr("group").unwrap().to_owned();
    alice
        .send_grouped(
            "directory",
            XmlElement::new("subscribe-ack").with_attr("id", node),
        )
        .await;
    alice.recv_until("sync-begin").await;
    alice.recv_until("sync-end").await;
    alice
        .send_grouped(&group, XmlElement::new("sync-ack"))
        .await;

    // Join a user and edit.
    alice
        .send_grouped(&group, XmlElement::new("user-join").with_attr("name", "alice"))
        .await;
    let joined = alice.recv_until("user-join").await;
    let alice_id: u32 = joined.attr("id").unwrap().parse().unwrap();

    // Second client subscribes to the same document.
    let mut bob = Client::connect(addr).await;
    bob.send(XmlElement::new("login").with_attr("name", "bob")).await;
    bob.recv_until("welcome").await;
    bob.send_grouped(
        "directory",
        XmlElement::new("subscribe-session").with_attr("id", node),
    )
    .await;
    bob.recv_until("subscribe-session").await;
    bob.send_grouped(
        "directory",
        XmlElement::new("subscribe-ack").with_attr("id", node),
    )
    .await;
    bob.recv_until("sync-begin").await;
    bob.recv_until("sync-end").await;
    bob.send_grouped(&group, XmlElement::new("sync-ack")).await;

    // Alice types; the server relays the request to Bob.
    alice
        .send_grouped(
            &group,
            XmlElement::new("request")
                .with_attr("user", alice_id)
                .with_attr("time", format!("{}:0", alice_id))
                .with_child(
                    XmlElement::new("insert")
                        .with_attr("pos", 0)
                        .with_text("hello collaboration"),
                ),
        )
        .await;
    let relayed = bob.recv_until("request").await;
    assert_eq!(relayed.attr("user"), Some(alice_id.to_string().as_str()));
    assert_eq!(relayed.children()[0].text(), "hello collaboration");

    // A malformed request only draws a failure report, the session
    // survives.
    alice
        .send_grouped(
            &group,
            XmlElement::new("request")
                .with_attr("user", alice_id)
                .with_attr("time", format!("{}:1", alice_id))
                .with_child(
                    XmlElement::new("insert")
                        .with_attr("pos", 99999)
                        .with_text("out of bounds"),
                ),
        )
        .await;
    let failure = alice.recv_until("request-failed").await;
    assert_eq!(failure.attr("domain"), Some("ot"));

    // The session still works afterwards.
    alice
        .send_grouped(
            &group,
            XmlElement::new("request")
                .with_attr("user", alice_id)
                .with_attr("time", format!("{}:1", alice_id))
                .with_child(
                    XmlElement::new("insert")
                        .with_attr("pos", 0)
                        .with_text("still alive: "),
                ),
        )
        .await;
    let relayed = bob.recv_until("request").await;
    assert_eq!(relayed.children()[0].text(), "still alive: ");
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(transport::run_listener(listener, None, tx));
    tokio::spawn(async move {
        let mut server = Server::new(
            "weftd",
            AccountStore::in_memory(),
            None,
            Some("sesame".into()),
        );
        while let Some(event) = rx.recv().await {
            server.handle_event(event);
        }
    });

    let mut mallory = Client::connect(addr).await;
    mallory
        .send(
            XmlElement::new("login")
                .with_attr("name", "mallory")
                .with_attr("password", "guess"),
        )
        .await;
    let reply = mallory.recv().await;
    assert_eq!(reply.name(), "request-failed");

    let mut alice = Client::connect(addr).await;
    alice
        .send(
            XmlElement::new("login")
                .with_attr("name", "alice")
                .with_attr("password", "sesame"),
        )
        .await;
    let reply = alice.recv_until("welcome").await;
    assert_eq!(reply.name(), "welcome");
}
