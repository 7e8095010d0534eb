//! End-to-end tests against a server that terminates TLS itself.
//!
//! Each test issues a throwaway CA and a leaf certificate for `127.0.0.1`
//! with `rcgen`, starts an [`EngineServer`] on them, and connects through
//! rustls clients that trust only that CA.

#![allow(clippy::unwrap_used)]

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use engine_server::{EngineServer, KeyPair, MailBox, ServerConfig, TlsConfig};
use futures::StreamExt as _;
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

/// Certificate material written to a scratch directory.
struct Pki {
    dir: PathBuf,
    tls: TlsConfig,
    roots: RootCertStore,
}

impl Pki {
    fn issue(name: &str) -> Self {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf = rcgen::CertificateParams::new(vec!["localhost".to_owned(), "127.0.0.1".to_owned()])
            .unwrap()
            .signed_by(&leaf_key, &ca, &ca_key)
            .unwrap();

        let dir = std::env::temp_dir().join(format!(
            "engine-server-tls-live-{}-{name}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let tls = TlsConfig {
            cert_path: dir.join("cert.pem"),
            key_path: dir.join("key.pem"),
        };
        std::fs::write(&tls.cert_path, leaf.pem()).unwrap();
        std::fs::write(&tls.key_path, leaf_key.serialize_pem()).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(ca.der().clone()).unwrap();
        Self { dir, tls, roots }
    }

    fn client_config(&self) -> Arc<rustls::ClientConfig> {
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(self.roots.clone())
        .with_no_client_auth();
        Arc::new(config)
    }
}

impl Drop for Pki {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Query string proving possession of `client`'s private key.
fn credentials(server: &EngineServer, client: &KeyPair) -> (MailBox, String) {
    let mailbox = client.mailbox_for(server.config().keys.public_key());
    let sealed = mailbox.seal(&json!("hello")).unwrap();
    let query = format!(
        "publicKey={}&encryptedMessage={}",
        client.public_key_hex(),
        sealed
            .replace('+', "%2B")
            .replace('/', "%2F")
            .replace('=', "%3D")
    );
    (mailbox, query)
}

struct SecureClient {
    mailbox: MailBox,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SecureClient {
    async fn connect(server: &EngineServer, addr: SocketAddr, pki: &Pki) -> Self {
        let (mailbox, query) = credentials(server, &KeyPair::generate());
        let url = format!("wss://127.0.0.1:{}/websocket?{query}", addr.port());
        let (socket, _response) = tokio_tungstenite::connect_async_tls_with_config(
            url,
            None,
            false,
            Some(Connector::Rustls(pki.client_config())),
        )
        .await
        .unwrap();
        Self { mailbox, socket }
    }

    async fn receive(&mut self) -> Value {
        let frame = tokio::time::timeout(WAIT, self.socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame {
            Message::Text(text) => self.mailbox.open(text.as_str()).unwrap(),
            other => Value::String(format!("unexpected frame: {other:?}")),
        }
    }
}

fn start_with_tls(pki: &Pki) -> (Arc<EngineServer>, SocketAddr) {
    let config = ServerConfig::default()
        .with_host("127.0.0.1")
        .with_port(0)
        .with_tls(Some(pki.tls.clone()));
    let server = Arc::new(EngineServer::new(config));
    let addr = server.start().unwrap();
    (server, addr)
}

async fn stop(server: Arc<EngineServer>) {
    tokio::task::spawn_blocking(move || server.stop_and_join())
        .await
        .unwrap()
        .unwrap();
}

async fn wait_for_connections(server: &EngineServer, expected: usize) {
    for _ in 0..500 {
        if server.connection_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.connection_count(), expected);
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_protocol_over_tls_is_sealed_wss() {
    let pki = Pki::issue("protocol");
    let (server, addr) = start_with_tls(&pki);
    let (mailbox, query) = credentials(&server, &KeyPair::generate());

    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("127.0.0.1").unwrap();
    let mut tls = TlsConnector::from(pki.client_config())
        .connect(name, tcp)
        .await
        .unwrap();
    let request =
        format!("GET /protocol?{query} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n");
    tls.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    if let Err(e) = tls.read_to_end(&mut raw).await {
        assert_eq!(e.kind(), ErrorKind::UnexpectedEof);
    }
    let response = String::from_utf8(raw).unwrap();
    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected response: {head}");

    let sealed: String = serde_json::from_str(body).unwrap();
    assert_eq!(mailbox.open(&sealed).unwrap(), json!({"protocol": "wss://"}));

    stop(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_reaches_wss_client() {
    let pki = Pki::issue("broadcast");
    let (server, addr) = start_with_tls(&pki);

    let mut client = SecureClient::connect(&server, addr, &pki).await;
    wait_for_connections(&server, 1).await;

    let report = server
        .queue_message(json!({"output_changed": false}))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(client.receive().await, json!({"output_changed": false}));

    stop(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_peer_does_not_hold_up_other_handshakes() {
    let pki = Pki::issue("silent");
    let (server, addr) = start_with_tls(&pki);

    // Connects but never starts a handshake.
    let _silent = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let connect = SecureClient::connect(&server, addr, &pki);
    let mut client = tokio::time::timeout(Duration::from_secs(3), connect)
        .await
        .unwrap();
    wait_for_connections(&server, 1).await;

    server.queue_message(json!({"quit": true})).unwrap();
    assert_eq!(client.receive().await, json!({"quit": true}));

    stop(server).await;
}
