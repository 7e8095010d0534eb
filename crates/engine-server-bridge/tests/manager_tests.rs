//! Integration tests for the engine server manager.
//!
//! Each test runs a real server through [`EngineServerManager`] with a
//! recording [`EngineAdapter`] and drives it with a `tokio-tungstenite`
//! client.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use engine_server::{KeyPair, MailBox, ServerConfig, ServerError};
use engine_server_bridge::{BridgeError, ConfigSource, EngineAdapter, EngineServerManager};
use engine_server_types::{EngineEvent, ServerStatus};
use futures::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingAdapter {
    calls: Mutex<Vec<String>>,
    output: AtomicBool,
}

impl RecordingAdapter {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn wait_for_calls(&self, expected: usize) -> Vec<String> {
        for _ in 0..500 {
            if self.calls.lock().len() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.calls()
    }
}

impl EngineAdapter for RecordingAdapter {
    fn inject_stroke(&self, keys: &[String]) -> anyhow::Result<()> {
        let output = self.output.load(Ordering::SeqCst);
        self.calls
            .lock()
            .push(format!("stroke {} output={output}", keys.join("+")));
        Ok(())
    }

    fn inject_translation(&self, mapping: &str) -> anyhow::Result<()> {
        self.calls.lock().push(format!("translation {mapping}"));
        Ok(())
    }

    fn is_output_enabled(&self) -> bool {
        self.output.load(Ordering::SeqCst)
    }

    fn force_enable(&self, enabled: bool) {
        self.output.store(enabled, Ordering::SeqCst);
    }

    fn zero_last_stroke_length(&self) {
        self.calls.lock().push("zero".to_owned());
    }
}

struct Client {
    mailbox: MailBox,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    async fn connect(server_key_hex: &str, addr: SocketAddr) -> Self {
        let keys = KeyPair::generate();
        let mailbox = keys.mailbox_for_hex(server_key_hex).unwrap();
        let sealed = mailbox.seal(&json!("hello")).unwrap();
        let url = format!(
            "ws://{addr}/websocket?publicKey={}&encryptedMessage={}",
            keys.public_key_hex(),
            sealed
                .replace('+', "%2B")
                .replace('/', "%2F")
                .replace('=', "%3D")
        );
        let (socket, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
        Self { mailbox, socket }
    }

    async fn send(&mut self, payload: &Value) {
        let sealed = self.mailbox.seal(payload).unwrap();
        self.socket.send(Message::text(sealed)).await.unwrap();
    }

    async fn receive(&mut self) -> Value {
        let frame = tokio::time::timeout(WAIT, self.socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        self.mailbox.open(frame.to_text().unwrap()).unwrap()
    }
}

fn make_manager() -> (Arc<EngineServerManager>, Arc<RecordingAdapter>) {
    let adapter = Arc::new(RecordingAdapter::default());
    let config = ServerConfig::default().with_host("127.0.0.1").with_port(0);
    let manager = EngineServerManager::new(
        Arc::clone(&adapter) as Arc<dyn EngineAdapter>,
        ConfigSource::Fixed(config),
    );
    (Arc::new(manager), adapter)
}

async fn start(manager: &Arc<EngineServerManager>) -> SocketAddr {
    let manager = Arc::clone(manager);
    tokio::task::spawn_blocking(move || manager.start())
        .await
        .unwrap()
        .unwrap()
}

async fn stop(manager: &Arc<EngineServerManager>) -> Result<(), BridgeError> {
    let manager = Arc::clone(manager);
    tokio::task::spawn_blocking(move || manager.stop()).await.unwrap()
}

async fn wait_for_connections(manager: &EngineServerManager, expected: usize) {
    for _ in 0..500 {
        if manager.connection_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(manager.connection_count(), expected);
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_stroke_reaches_adapter_with_output_on() {
    let (manager, adapter) = make_manager();
    let addr = start(&manager).await;
    let key = manager.public_key_hex().unwrap();

    let mut client = Client::connect(&key, addr).await;
    client
        .send(&json!({"forced": true, "zero_last_stroke_length": true, "stroke": ["S-"]}))
        .await;

    let calls = adapter.wait_for_calls(2).await;
    assert_eq!(calls, vec!["zero", "stroke S- output=true"]);
    assert!(!adapter.is_output_enabled());

    stop(&manager).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_published_event_reaches_client() {
    let (manager, _adapter) = make_manager();
    let addr = start(&manager).await;
    let key = manager.public_key_hex().unwrap();

    let mut client = Client::connect(&key, addr).await;
    wait_for_connections(&manager, 1).await;

    let report = manager
        .publish(&EngineEvent::SendString("hello".to_owned()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(client.receive().await, json!({"send_string": "hello"}));

    stop(&manager).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifecycle_errors_are_reported() {
    let (manager, _adapter) = make_manager();
    assert_eq!(manager.status(), ServerStatus::Stopped);
    assert!(matches!(
        stop(&manager).await,
        Err(BridgeError::Server(ServerError::NotRunning))
    ));
    assert!(manager.publish(&EngineEvent::Quit).is_none());

    start(&manager).await;
    assert_eq!(manager.status(), ServerStatus::Running);
    let second = {
        let manager = Arc::clone(&manager);
        tokio::task::spawn_blocking(move || manager.start()).await.unwrap()
    };
    assert!(matches!(
        second,
        Err(BridgeError::Server(ServerError::AlreadyRunning))
    ));

    stop(&manager).await.unwrap();
    assert_eq!(manager.status(), ServerStatus::Stopped);
    assert!(manager.local_addr().is_none());
    assert!(matches!(
        stop(&manager).await,
        Err(BridgeError::Server(ServerError::NotRunning))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_rewires_inbound_commands() {
    let (manager, adapter) = make_manager();
    start(&manager).await;
    stop(&manager).await.unwrap();

    let addr = start(&manager).await;
    let key = manager.public_key_hex().unwrap();
    let mut client = Client::connect(&key, addr).await;
    client.send(&json!({"translation": "{#Return}"})).await;

    let calls = adapter.wait_for_calls(1).await;
    assert_eq!(calls, vec!["translation {#Return}"]);

    stop(&manager).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_config_file_is_loaded_on_start() {
    let dir = std::env::temp_dir().join(format!("engine-server-bridge-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.json");
    let private_key = "0101010101010101010101010101010101010101010101010101010101010101";
    std::fs::write(
        &path,
        format!(r#"{{ "host": "127.0.0.1", "port": 0, "private_key": "{private_key}" }}"#),
    )
    .unwrap();

    let manager = Arc::new(EngineServerManager::new(
        Arc::new(RecordingAdapter::default()),
        ConfigSource::File(path),
    ));
    start(&manager).await;

    let expected = KeyPair::from_private_hex(private_key).unwrap().public_key_hex();
    assert_eq!(manager.public_key_hex(), Some(expected));

    stop(&manager).await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}
