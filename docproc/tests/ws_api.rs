//! WebSocket notifications over a real socket.

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use docproc::api::AppState;
use docproc::api::routes::create_router;
use docproc::config::{AppConfig, MEMORY_QUEUE_URL};
use docproc::pipeline::{DocumentType, ProcessingRequest};
use docproc::queue::TaskPriority;
use docproc::services::ServiceContainer;
use docproc::storage::MemoryObjectStore;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serve the API on an ephemeral port. Only the queue is started, so jobs stay
/// pending until cancelled.
async fn serve() -> (SocketAddr, Arc<ServiceContainer>) {
    let config = AppConfig {
        queue_url: MEMORY_QUEUE_URL.to_string(),
        ..Default::default()
    };
    let services = Arc::new(
        ServiceContainer::builder(config)
            .with_storage(Arc::new(MemoryObjectStore::new()))
            .build()
            .await
            .unwrap(),
    );
    services.queue.initialize().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(AppState::new(services.clone()));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, services)
}

async fn connect(addr: SocketAddr, query: &str) -> Socket {
    let url = format!("ws://{}/api/ws{}", addr, query);
    let (socket, _) = connect_async(url.as_str()).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, message: Value) {
    socket
        .send(Message::text(message.to_string()))
        .await
        .unwrap();
}

/// Next JSON text frame, skipping control frames.
async fn next_json(socket: &mut Socket) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket closed: {:?}", other),
            }
        }
    })
    .await
    .expect("no message received")
}

async fn submit(services: &ServiceContainer, user: &str) -> String {
    let request = ProcessingRequest::new("doc-1", "/tmp/doc-1.pdf", DocumentType::Pdf);
    services
        .coordinator
        .submit_job(request, user, TaskPriority::Normal)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_subscribe_receives_snapshot_and_cancellation() {
    let (addr, services) = serve().await;
    let job_id = submit(&services, "alice").await;

    let mut socket = connect(addr, "?user_id=alice").await;
    let confirmed = next_json(&mut socket).await;
    assert_eq!(confirmed["type"], "subscription_confirmed");
    assert_eq!(confirmed["channels"], json!(["user_alice"]));

    send(&mut socket, json!({ "type": "subscribe", "jobIds": [job_id] })).await;
    let confirmed = next_json(&mut socket).await;
    assert_eq!(confirmed["type"], "subscription_confirmed");
    assert_eq!(confirmed["jobIds"], json!([job_id]));

    let update = next_json(&mut socket).await;
    assert_eq!(update["type"], "progress_update");
    assert_eq!(update["jobId"], job_id.as_str());
    assert_eq!(update["data"]["status"], "pending");
    assert_eq!(update["data"]["progressPercentage"], 0.0);

    assert!(services.coordinator.cancel_job(&job_id, "alice").await.unwrap());

    let update = next_json(&mut socket).await;
    assert_eq!(update["type"], "progress_update");
    assert_eq!(update["data"]["status"], "cancelled");

    let notice = next_json(&mut socket).await;
    assert_eq!(notice["type"], "channel_message");
    assert_eq!(notice["channel"], "user_alice");
    assert_eq!(notice["messageType"], "job_cancelled");
    assert_eq!(notice["data"]["jobId"], job_id.as_str());

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn test_first_subscribe_registers_anonymous_connection() {
    let (addr, services) = serve().await;
    let job_id = submit(&services, "bob").await;

    let mut socket = connect(addr, "").await;
    send(&mut socket, json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut socket).await["type"], "pong");
    assert_eq!(services.tracker.connection_count(), 0);

    send(
        &mut socket,
        json!({ "type": "subscribe", "jobIds": [job_id], "channels": ["announcements"] }),
    )
    .await;
    let confirmed = next_json(&mut socket).await;
    assert_eq!(confirmed["type"], "subscription_confirmed");
    assert_eq!(confirmed["channels"], json!(["announcements"]));
    assert_eq!(next_json(&mut socket).await["type"], "progress_update");
    assert_eq!(services.tracker.connection_count(), 1);

    let delivered =
        services
            .tracker
            .broadcast_to_channel("announcements", "maintenance", json!({ "in": "5m" }));
    assert_eq!(delivered, 1);
    let message = next_json(&mut socket).await;
    assert_eq!(message["type"], "channel_message");
    assert_eq!(message["messageType"], "maintenance");
}

#[tokio::test]
async fn test_invalid_frame_gets_error_reply() {
    let (addr, _services) = serve().await;
    let mut socket = connect(addr, "").await;

    socket.send(Message::text("not json")).await.unwrap();
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("invalid message"));
}

#[tokio::test]
async fn test_closing_socket_unsubscribes() {
    let (addr, services) = serve().await;
    let mut socket = connect(addr, "?user_id=carol").await;
    assert_eq!(next_json(&mut socket).await["type"], "subscription_confirmed");
    assert_eq!(services.tracker.connection_count(), 1);

    socket.close(None).await.unwrap();
    drop(socket);

    tokio::time::timeout(Duration::from_secs(5), async {
        while services.tracker.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection was not unsubscribed");
}
