//! WebSocket remote store
//!
//! Keeps one long-lived connection to the realtime server and reconnects
//! with exponential backoff. Listeners survive reconnects: every active
//! listen is issued again on the new connection and the server answers with
//! fresh snapshots. Disconnect hooks belong to the connection and are not
//! replayed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use super::{
    ConnectionStatus, ListenerHandle, RemoteError, RemoteEvent, RemoteStore, Snapshot, SnapshotSink,
};
use crate::paths::DataPath;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWrite = SplitSink<Socket, Message>;
type SocketRead = SplitStream<Socket>;

/// Configuration for the WebSocket store
#[derive(Debug, Clone)]
pub struct WsRemoteConfig {
    /// WebSocket URL of the realtime server
    pub url: String,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Limit for the WebSocket upgrade and, separately, for the server's
    /// welcome
    pub handshake_timeout: Duration,
}

impl WsRemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

enum Command {
    Listen {
        id: u64,
        path: DataPath,
        sink: SnapshotSink,
    },
    Unlisten {
        id: u64,
    },
    Write {
        path: DataPath,
        value: Value,
        on_disconnect: bool,
        reply: oneshot::Sender<Result<(), RemoteError>>,
    },
}

struct ActiveListen {
    path: DataPath,
    sink: SnapshotSink,
}

struct PendingWrite {
    path: DataPath,
    reply: oneshot::Sender<Result<(), RemoteError>>,
}

/// Client side of the realtime server
///
/// Dropping the store shuts the connection task down.
pub struct WsRemoteStore {
    command_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    next_listen: AtomicU64,
}

impl WsRemoteStore {
    /// Spawn the connection task; must be called inside a Tokio runtime
    pub fn connect(config: WsRemoteConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        tokio::spawn(connection_loop(config, command_rx, status_tx));

        Self {
            command_tx,
            status_rx,
            next_listen: AtomicU64::new(1),
        }
    }

    async fn write(&self, path: &DataPath, value: Value, on_disconnect: bool) -> Result<(), RemoteError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Write {
                path: path.clone(),
                value,
                on_disconnect,
                reply,
            })
            .map_err(|_| RemoteError::Closed)?;
        rx.await.map_err(|_| RemoteError::Closed)?
    }
}

#[async_trait]
impl RemoteStore for WsRemoteStore {
    fn attach(&self, path: &DataPath, sink: SnapshotSink) -> ListenerHandle {
        let id = self.next_listen.fetch_add(1, Ordering::SeqCst);
        let command = Command::Listen {
            id,
            path: path.clone(),
            sink,
        };
        if let Err(mpsc::error::SendError(Command::Listen { sink, .. })) = self.command_tx.send(command) {
            let _ = sink.send(RemoteEvent::Error(RemoteError::Closed));
        }
        ListenerHandle(id)
    }

    fn detach(&self, handle: ListenerHandle) {
        let _ = self.command_tx.send(Command::Unlisten { id: handle.0 });
    }

    async fn set(&self, path: &DataPath, value: Value) -> Result<(), RemoteError> {
        self.write(path, value, false).await
    }

    async fn run_on_disconnect(&self, path: &DataPath, value: Value) -> Result<(), RemoteError> {
        self.write(path, value, true).await
    }

    fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }
}

/// Why a connection ended
enum Exit {
    /// Store dropped; stop for good
    Shutdown,
    /// Server went away; reconnect
    Closed,
}

/// Main task: connect, serve, back off, repeat
async fn connection_loop(
    config: WsRemoteConfig,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let client_id = format!("campus-{}", &uuid::Uuid::new_v4().to_string()[..8]);
    let mut listens: BTreeMap<u64, ActiveListen> = BTreeMap::new();
    let mut reconnect_delay = config.initial_reconnect_delay;

    loop {
        let _ = status_tx.send(ConnectionStatus::Connecting);

        match connect_and_serve(&config, &client_id, &mut listens, &mut command_rx, &status_tx).await {
            Ok(Exit::Shutdown) => {
                let _ = status_tx.send(ConnectionStatus::Disconnected);
                debug!("Remote store dropped, connection task exiting");
                return;
            }
            Ok(Exit::Closed) => {
                info!("Connection to {} closed", config.url);
                reconnect_delay = config.initial_reconnect_delay;
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", config.url, e);
            }
        }

        let _ = status_tx.send(ConnectionStatus::Disconnected);

        // Wait before reconnecting; keep serving commands offline
        let sleep = tokio::time::sleep(reconnect_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = command_rx.recv() => match cmd {
                    None => return,
                    Some(cmd) => handle_offline(cmd, &mut listens),
                }
            }
        }
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
    }
}

fn handle_offline(cmd: Command, listens: &mut BTreeMap<u64, ActiveListen>) {
    match cmd {
        Command::Listen { id, path, sink } => {
            // Issued once the connection is back
            listens.insert(id, ActiveListen { path, sink });
        }
        Command::Unlisten { id } => {
            listens.remove(&id);
        }
        Command::Write { reply, .. } => {
            let _ = reply.send(Err(RemoteError::Offline));
        }
    }
}

async fn send_frame(write: &mut SocketWrite, message: &ClientMessage) -> Result<(), RemoteError> {
    let bytes = message.encode()?;
    write
        .send(Message::Binary(bytes))
        .await
        .map_err(|e| RemoteError::Transport(e.to_string()))
}

async fn wait_for_welcome(read: &mut SocketRead) -> Result<String, RemoteError> {
    while let Some(frame) = read.next().await {
        match frame.map_err(|e| RemoteError::Transport(e.to_string()))? {
            Message::Binary(data) => match ServerMessage::decode(&data)? {
                ServerMessage::Welcome { server_id, .. } => return Ok(server_id),
                ServerMessage::Error { message } => return Err(RemoteError::Protocol(message)),
                other => debug!("Ignoring {:?} before welcome", other),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(RemoteError::Transport("Connection closed during handshake".to_string()))
}

fn fail_pending(pending: &mut HashMap<u64, PendingWrite>) {
    for (_, write) in pending.drain() {
        let _ = write.reply.send(Err(RemoteError::Offline));
    }
}

/// Connect, replay listens, then pump commands and frames until the
/// connection ends
async fn connect_and_serve(
    config: &WsRemoteConfig,
    client_id: &str,
    listens: &mut BTreeMap<u64, ActiveListen>,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    status_tx: &watch::Sender<ConnectionStatus>,
) -> Result<Exit, RemoteError> {
    let connect = connect_async(config.url.as_str());
    let (socket, _) = tokio::time::timeout(config.handshake_timeout, connect)
        .await
        .map_err(|_| RemoteError::Transport("Timed out opening the connection".to_string()))?
        .map_err(|e| RemoteError::Transport(e.to_string()))?;
    let (mut write, mut read) = socket.split();

    send_frame(&mut write, &ClientMessage::join(client_id)).await?;
    let server_id = tokio::time::timeout(config.handshake_timeout, wait_for_welcome(&mut read))
        .await
        .map_err(|_| RemoteError::Transport("Timed out waiting for welcome".to_string()))??;

    info!("Connected to {} (server {})", config.url, server_id);
    let _ = status_tx.send(ConnectionStatus::Connected);

    for (id, listen) in listens.iter() {
        send_frame(
            &mut write,
            &ClientMessage::Listen {
                listen_id: *id,
                path: listen.path.to_string(),
            },
        )
        .await?;
    }
    if !listens.is_empty() {
        debug!("Re-issued {} listens", listens.len());
    }

    let mut pending: HashMap<u64, PendingWrite> = HashMap::new();
    let mut next_request: u64 = 1;

    let result = loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else {
                    let _ = write.close().await;
                    break Ok(Exit::Shutdown);
                };
                let sent = match cmd {
                    Command::Listen { id, path, sink } => {
                        let frame = ClientMessage::Listen { listen_id: id, path: path.to_string() };
                        listens.insert(id, ActiveListen { path, sink });
                        send_frame(&mut write, &frame).await
                    }
                    Command::Unlisten { id } => {
                        if listens.remove(&id).is_some() {
                            send_frame(&mut write, &ClientMessage::Unlisten { listen_id: id }).await
                        } else {
                            Ok(())
                        }
                    }
                    Command::Write { path, value, on_disconnect, reply } => {
                        let request_id = next_request;
                        next_request += 1;
                        let frame = if on_disconnect {
                            ClientMessage::OnDisconnect { request_id, path: path.to_string(), value }
                        } else {
                            ClientMessage::Set { request_id, path: path.to_string(), value }
                        };
                        pending.insert(request_id, PendingWrite { path, reply });
                        send_frame(&mut write, &frame).await
                    }
                };
                if let Err(e) = sent {
                    break Err(e);
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                        Ok(message) => handle_server_message(message, listens, &mut pending),
                        Err(e) => warn!("Dropping undecodable frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break Ok(Exit::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(RemoteError::Transport(e.to_string())),
                }
            }
        }
    };

    fail_pending(&mut pending);
    result
}

fn handle_server_message(
    message: ServerMessage,
    listens: &BTreeMap<u64, ActiveListen>,
    pending: &mut HashMap<u64, PendingWrite>,
) {
    match message {
        ServerMessage::Snapshot { listen_id, value, .. } => {
            // Snapshots for a listen we already dropped are stale
            if let Some(listen) = listens.get(&listen_id) {
                let snapshot = Snapshot::new(listen.path.clone(), value);
                let _ = listen.sink.send(RemoteEvent::Snapshot(snapshot));
            }
        }
        ServerMessage::ListenRevoked { listen_id, message } => {
            if let Some(listen) = listens.get(&listen_id) {
                warn!("Listen at {} revoked: {}", listen.path, message);
                let _ = listen.sink.send(RemoteEvent::Error(RemoteError::PermissionDenied {
                    path: listen.path.to_string(),
                }));
            }
        }
        ServerMessage::Ack { request_id } => {
            if let Some(write) = pending.remove(&request_id) {
                let _ = write.reply.send(Ok(()));
            }
        }
        ServerMessage::Nack {
            request_id,
            message,
            denied,
        } => {
            if let Some(write) = pending.remove(&request_id) {
                let error = if denied {
                    RemoteError::PermissionDenied {
                        path: write.path.to_string(),
                    }
                } else {
                    RemoteError::WriteRejected {
                        path: write.path.to_string(),
                        reason: message,
                    }
                };
                let _ = write.reply.send(Err(error));
            }
        }
        ServerMessage::Error { message } => warn!("Server error: {}", message),
        ServerMessage::Welcome { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn path(raw: &str) -> DataPath {
        DataPath::parse(raw).unwrap()
    }

    /// Serves the protocol on top of a memory store, one client at a time.
    /// Every accepted connection is reported on `connections`; dropping the
    /// matching `kill` sender closes it like a network failure.
    async fn spawn_server(
        backing: Arc<MemoryRemoteStore>,
    ) -> (String, mpsc::UnboundedReceiver<oneshot::Sender<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (kill_tx, kill_rx) = oneshot::channel();
                let _ = conn_tx.send(kill_tx);
                serve_client(backing.clone(), stream, kill_rx).await;
            }
        });

        (url, conn_rx)
    }

    async fn serve_client(backing: Arc<MemoryRemoteStore>, stream: TcpStream, mut kill: oneshot::Receiver<()>) {
        let socket = accept_async(stream).await.unwrap();
        let (mut write, mut read) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let mut handles: HashMap<u64, ListenerHandle> = HashMap::new();

        backing.simulate_reconnect();

        loop {
            tokio::select! {
                _ = &mut kill => break,
                Some(message) = out_rx.recv() => {
                    let bytes = message.encode().unwrap();
                    if write.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                frame = read.next() => {
                    let Some(Ok(Message::Binary(data))) = frame else { break };
                    let reply = match ClientMessage::decode(&data).unwrap() {
                        ClientMessage::Join { .. } => Some(ServerMessage::Welcome {
                            server_id: "test".to_string(),
                            selected_protocol_version: "1".to_string(),
                        }),
                        ClientMessage::Listen { listen_id, path } => {
                            let (tx, mut rx) = mpsc::unbounded_channel();
                            let out = out_tx.clone();
                            tokio::spawn(async move {
                                while let Some(event) = rx.recv().await {
                                    let message = match event {
                                        RemoteEvent::Snapshot(s) => ServerMessage::Snapshot {
                                            listen_id,
                                            path: s.path.to_string(),
                                            value: s.value,
                                        },
                                        RemoteEvent::Error(e) => ServerMessage::ListenRevoked {
                                            listen_id,
                                            message: e.to_string(),
                                        },
                                    };
                                    if out.send(message).is_err() {
                                        break;
                                    }
                                }
                            });
                            handles.insert(listen_id, backing.attach(&DataPath::parse(&path).unwrap(), tx));
                            None
                        }
                        ClientMessage::Unlisten { listen_id } => {
                            if let Some(handle) = handles.remove(&listen_id) {
                                backing.detach(handle);
                            }
                            None
                        }
                        ClientMessage::Set { request_id, path, value } => {
                            Some(match backing.set(&DataPath::parse(&path).unwrap(), value).await {
                                Ok(()) => ServerMessage::Ack { request_id },
                                Err(e) => ServerMessage::Nack {
                                    request_id,
                                    message: e.to_string(),
                                    denied: matches!(e, RemoteError::PermissionDenied { .. }),
                                },
                            })
                        }
                        ClientMessage::OnDisconnect { request_id, path, value } => {
                            backing.run_on_disconnect(&DataPath::parse(&path).unwrap(), value).await.unwrap();
                            Some(ServerMessage::Ack { request_id })
                        }
                    };
                    if let Some(reply) = reply {
                        let bytes = reply.encode().unwrap();
                        if write.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        for (_, handle) in handles {
            backing.detach(handle);
        }
        backing.simulate_disconnect();
    }

    fn fast_config(url: String) -> WsRemoteConfig {
        WsRemoteConfig {
            url,
            initial_reconnect_delay: Duration::from_millis(20),
            max_reconnect_delay: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(2),
        }
    }

    async fn next_snapshot(rx: &mut mpsc::UnboundedReceiver<RemoteEvent>) -> Snapshot {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for snapshot")
            .expect("listener channel closed");
        match event {
            RemoteEvent::Snapshot(s) => s,
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    async fn wait_status(rx: &mut watch::Receiver<ConnectionStatus>, want: ConnectionStatus) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for status")
            .unwrap();
    }

    #[tokio::test]
    async fn test_listen_and_write() {
        let backing = Arc::new(MemoryRemoteStore::new());
        let (url, _conns) = spawn_server(backing.clone()).await;
        let store = WsRemoteStore::connect(fast_config(url));

        let (tx, mut rx) = mpsc::unbounded_channel();
        store.attach(&path("Groups"), tx);
        assert!(!next_snapshot(&mut rx).await.exists());

        store
            .set(&path("Groups/g1"), json!({"name": "Study"}))
            .await
            .unwrap();
        let snapshot = next_snapshot(&mut rx).await;
        assert_eq!(snapshot.children().len(), 1);
        assert_eq!(backing.value(&path("Groups/g1/name")), Some(json!("Study")));
    }

    #[tokio::test]
    async fn test_rejected_write_reports_error() {
        let backing = Arc::new(MemoryRemoteStore::new());
        let (url, _conns) = spawn_server(backing.clone()).await;
        let store = WsRemoteStore::connect(fast_config(url));
        wait_status(&mut store.connection_status(), ConnectionStatus::Connected).await;

        backing.deny(&path("Attendance"));
        assert!(matches!(
            store.set(&path("Attendance/a1"), json!(1)).await,
            Err(RemoteError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_reconnect_reissues_listens_and_fires_hooks() {
        let backing = Arc::new(MemoryRemoteStore::new());
        let (url, mut conns) = spawn_server(backing.clone()).await;
        let store = WsRemoteStore::connect(fast_config(url));
        let mut status = store.connection_status();

        let (tx, mut rx) = mpsc::unbounded_channel();
        store.attach(&path("Users Online Status"), tx);
        next_snapshot(&mut rx).await;

        let me = path("Users Online Status/u1");
        store.set(&me, json!({"online": true})).await.unwrap();
        next_snapshot(&mut rx).await;
        store
            .run_on_disconnect(&me, json!({"online": false}))
            .await
            .unwrap();

        // Drop the first connection from the server side
        let kill = conns.recv().await.unwrap();
        drop(kill);
        wait_status(&mut status, ConnectionStatus::Disconnected).await;
        assert_eq!(backing.value(&me), Some(json!({"online": false})));

        wait_status(&mut status, ConnectionStatus::Connected).await;
        let snapshot = next_snapshot(&mut rx).await;
        assert_eq!(
            snapshot.value,
            Some(json!({"u1": {"online": false}}))
        );
    }

    #[tokio::test]
    async fn test_writes_fail_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let store = WsRemoteStore::connect(fast_config(url));
        assert_eq!(
            store.set(&path("x"), json!(1)).await,
            Err(RemoteError::Offline)
        );
    }

    #[tokio::test]
    async fn test_silent_server_times_out_connect() {
        // Accepts TCP but never answers the upgrade request
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut config = fast_config(url);
        config.handshake_timeout = Duration::from_millis(200);
        let store = WsRemoteStore::connect(config);

        let written = tokio::time::timeout(Duration::from_secs(3), store.set(&path("x"), json!(1)))
            .await
            .expect("write hung behind a stalled connect");
        assert_eq!(written, Err(RemoteError::Offline));
        assert_ne!(*store.connection_status().borrow(), ConnectionStatus::Connected);
    }
}
