//! End-to-end scenarios driving two in-process `Connection`s against each
//! other over an in-memory loopback plugin, per the integration-test
//! pattern: one side's `send_data` feeds directly into the other side's
//! inbound handler.

use async_trait::async_trait;
use bytes::Bytes;
use interledger_stream_core::{
    Address, Connection, ConnectionConfig, ConnectionEvent, Plugin, PluginError, PluginResponse,
    Role,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct LoopbackPlugin {
    peer: Mutex<Option<Connection>>,
}

impl LoopbackPlugin {
    fn new() -> Arc<Self> {
        Arc::new(LoopbackPlugin { peer: Mutex::new(None) })
    }

    async fn set_peer(&self, peer: Connection) {
        *self.peer.lock().await = Some(peer);
    }
}

#[async_trait]
impl Plugin for LoopbackPlugin {
    async fn send_data(
        &self,
        prepare: interledger_packet::Prepare,
    ) -> Result<PluginResponse, PluginError> {
        let peer = self.peer.lock().await.clone().ok_or_else(|| {
            PluginError("loopback plugin has no peer connection wired up".to_string())
        })?;
        Ok(peer.handle_incoming(prepare).await)
    }
}

async fn link(
    client_plugin: &Arc<LoopbackPlugin>,
    server_plugin: &Arc<LoopbackPlugin>,
    client: &Connection,
    server: &Connection,
) {
    client_plugin.set_peer(server.clone()).await;
    server_plugin.set_peer(client.clone()).await;
}

#[tokio::test]
async fn opens_a_stream_and_delivers_data_end_to_end() {
    let shared_secret = Bytes::from(vec![7u8; 32]);
    let client_plugin = LoopbackPlugin::new();
    let server_plugin = LoopbackPlugin::new();

    let client_address = Address::new(b"test.client");
    let server_address = Address::new(b"test.server");
    let config = ConnectionConfig::default();

    let (client, mut client_events) = Connection::new(
        Role::Initiator,
        shared_secret.clone(),
        client_plugin.clone(),
        config.clone(),
        Some(server_address),
    );
    let (server, mut server_events) = Connection::new(
        Role::Responder,
        shared_secret,
        server_plugin.clone(),
        config,
        Some(client_address),
    );
    link(&client_plugin, &server_plugin, &client, &server).await;

    client.connect().await.expect("client connects");

    let stream_id = client.create_stream().await.expect("creates a stream");
    client
        .write_stream(stream_id, b"hello from the client")
        .await
        .expect("queues outbound data");

    let mut delivered = Vec::new();
    for _ in 0..50 {
        tokio::time::delay_for(Duration::from_millis(20)).await;
        let chunk = server.read_stream(stream_id, 4096).await.unwrap_or_default();
        if !chunk.is_empty() {
            delivered = chunk;
            break;
        }
    }
    let _ = server_events.try_recv();

    assert_eq!(&delivered, b"hello from the client");

    client.end().await.expect("graceful close completes");
    let _ = client_events.try_recv();
}

#[tokio::test]
async fn graceful_end_closes_both_sides() {
    let shared_secret = Bytes::from(vec![9u8; 32]);
    let client_plugin = LoopbackPlugin::new();
    let server_plugin = LoopbackPlugin::new();
    let config = ConnectionConfig::default();

    let (client, _client_events) = Connection::new(
        Role::Initiator,
        shared_secret.clone(),
        client_plugin.clone(),
        config.clone(),
        Some(Address::new(b"test.server")),
    );
    let (server, _server_events) = Connection::new(
        Role::Responder,
        shared_secret,
        server_plugin.clone(),
        config,
        Some(Address::new(b"test.client")),
    );
    link(&client_plugin, &server_plugin, &client, &server).await;

    client.connect().await.expect("client connects");
    client.end().await.expect("client ends gracefully");
}

#[tokio::test]
async fn idle_connection_times_out_and_destroys() {
    let shared_secret = Bytes::from(vec![3u8; 32]);
    let client_plugin = LoopbackPlugin::new();
    let server_plugin = LoopbackPlugin::new();
    let config = ConnectionConfig::builder().idle_timeout_ms(50).build();

    let (client, mut client_events) = Connection::new(
        Role::Initiator,
        shared_secret.clone(),
        client_plugin.clone(),
        config.clone(),
        Some(Address::new(b"test.server")),
    );
    let (server, _server_events) = Connection::new(
        Role::Responder,
        shared_secret,
        server_plugin.clone(),
        config,
        Some(Address::new(b"test.client")),
    );
    link(&client_plugin, &server_plugin, &client, &server).await;

    client.connect().await.expect("client connects");

    let mut saw_error = false;
    for _ in 0..50 {
        tokio::time::delay_for(Duration::from_millis(20)).await;
        if let Ok(ConnectionEvent::Error(_)) = client_events.try_recv() {
            saw_error = true;
            break;
        }
    }
    assert!(saw_error, "expected the idle timer to destroy the connection");
}
