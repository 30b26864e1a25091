//! Full service over a real socket: mock sensor, temp storage root, WebSocket clients.

use futures::{SinkExt, StreamExt};
use sensor_daq::config::Settings;
use sensor_daq::data::FileStore;
use sensor_daq::hardware::MockAccelerometer;
use sensor_daq::Service;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn start(root: &std::path::Path) -> Service {
    let mut settings = Settings::default();
    settings.storage.root = root.to_path_buf();
    settings.network.port = free_port();
    settings.sampler.rate_hz = 200;
    Service::start(&settings, MockAccelerometer::with_seed(11))
        .await
        .unwrap()
}

async fn connect(service: &Service) -> Client {
    let url = format!("ws://{}", service.local_addr());
    let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    client
}

async fn send(client: &mut Client, command: Value) {
    client.send(Message::Text(command.to_string())).await.unwrap();
}

/// Next message of the given `type`, skipping broadcasts of other kinds.
async fn next_of(client: &mut Client, kind: &str) -> Value {
    next_matching(client, kind, |_| true).await
}

/// Next message of the given `type` that also satisfies `accept`.
async fn next_matching(client: &mut Client, kind: &str, accept: impl Fn(&Value) -> bool) -> Value {
    let wait = async {
        while let Some(frame) = client.next().await {
            if let Message::Text(text) = frame.unwrap() {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] == kind && accept(&value) {
                    return value;
                }
            }
        }
        panic!("connection closed while waiting for {kind}");
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_gets_status_and_errors_keep_connection_open() {
    let dir = tempfile::tempdir().unwrap();
    let service = start(dir.path()).await;
    let mut client = connect(&service).await;

    let greeting = next_of(&mut client, "status").await;
    assert_eq!(greeting["data"]["sampling_rate"], 200);
    assert_eq!(greeting["data"]["paused"], false);

    send(&mut client, json!({"command": "get_csv_data", "filename": "2000/01/Week_1/01/000000.csv"})).await;
    let error = next_of(&mut client, "error").await;
    assert!(error["message"].as_str().unwrap().contains("not found"));

    send(&mut client, json!({"command": "get_csv_data", "filename": "../../etc/passwd"})).await;
    next_of(&mut client, "error").await;

    send(&mut client, json!({"command": "make_coffee"})).await;
    let error = next_of(&mut client, "error").await;
    assert_eq!(error["message"], "Unknown command: make_coffee");

    // Still usable after three errors.
    send(&mut client, json!({"command": "get_file_list"})).await;
    let list = next_of(&mut client, "file_list").await;
    assert!(list["files"].is_array());

    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_files_are_pushed_and_listed_in_folder_structure() {
    let dir = tempfile::tempdir().unwrap();
    let service = start(dir.path()).await;
    let mut client = connect(&service).await;
    next_of(&mut client, "status").await;

    let announced = next_of(&mut client, "new_file").await;
    let filename = announced["filename"].as_str().unwrap().to_string();
    assert!(filename.ends_with(".csv"));
    assert!(filename.split('/').nth(2).unwrap().starts_with("Week_"));
    assert!(announced["total_files"].as_u64().unwrap() >= 1);
    assert!(announced["samples"].as_u64().unwrap() >= 1);

    send(&mut client, json!({"command": "get_folder_structure"})).await;
    let tree = next_of(&mut client, "folder_structure").await;
    let parts: Vec<&str> = filename.split('/').collect();
    let day = tree["structure"][parts[0]][parts[1]][parts[2]][parts[3]]
        .as_array()
        .unwrap();
    assert!(day.iter().any(|entry| entry["path"] == filename.as_str()));

    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_changes_are_validated_and_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let service = start(dir.path()).await;
    let mut requester = connect(&service).await;
    let mut watcher = connect(&service).await;
    next_of(&mut requester, "status").await;
    next_of(&mut watcher, "status").await;

    send(&mut requester, json!({"command": "set_sampling_rate", "rate": 5000})).await;
    let rejected = next_of(&mut requester, "command_response").await;
    assert_eq!(rejected["success"], false);
    assert_eq!(rejected["new_rate"], 200);
    assert_eq!(service.control().current_rate(), 200);

    send(&mut requester, json!({"command": "set_sampling_rate", "rate": 500})).await;
    let accepted = next_of(&mut requester, "command_response").await;
    assert_eq!(accepted["success"], true);
    assert_eq!(accepted["new_rate"], 500);

    // Either still pending or already applied at a second boundary.
    next_matching(&mut watcher, "status", |s| {
        s["data"]["pending_rate"] == 500 || s["data"]["sampling_rate"] == 500
    })
    .await;

    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_is_visible_to_other_clients() {
    let dir = tempfile::tempdir().unwrap();
    let service = start(dir.path()).await;
    let mut a = connect(&service).await;
    let mut b = connect(&service).await;
    next_of(&mut a, "status").await;
    next_of(&mut b, "status").await;

    send(&mut a, json!({"command": "pause_collection"})).await;
    let ack = next_of(&mut a, "command_response").await;
    assert_eq!(ack["command"], "pause_collection");
    assert_eq!(ack["success"], true);
    assert!(service.control().is_paused());

    next_matching(&mut b, "status", |s| s["data"]["paused"] == true).await;

    send(&mut b, json!({"command": "resume_collection"})).await;
    next_of(&mut b, "command_response").await;
    assert!(!service.control().is_paused());

    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_notifies_clients_and_leaves_catalog_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let service = start(dir.path()).await;
    let mut client = connect(&service).await;
    next_of(&mut client, "status").await;
    assert_eq!(service.clients().count(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    service.shutdown().await.unwrap();

    let notice = next_of(&mut client, "shutdown").await;
    assert_eq!(notice["message"], "Server shutting down");

    // The open second is flushed on stop and the aggregate written on close.
    let store = FileStore::open(dir.path()).unwrap();
    assert!(store.list().count() >= 1);
    assert!(dir.path().join("aggregate_data.csv").is_file());
    assert!(dir.path().join("max_record.json").is_file());
}
