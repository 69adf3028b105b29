//! WebSocket Mock Server for the realtime session protocol
//!
//! Every accepted connection is handed to the test as a [`MockConnection`]
//! that can push server events and read the client's JSON messages.

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// How long helpers wait before failing a test
pub const WAIT: Duration = Duration::from_secs(5);

/// Control messages from the test to a connection task
enum Command {
    Send(String),
    Close,
}

/// Server side of one client connection
pub struct MockConnection {
    commands: mpsc::UnboundedSender<Command>,
    received: mpsc::UnboundedReceiver<Value>,
    task: JoinHandle<()>,
}

impl MockConnection {
    /// Push one server event.
    pub fn send(&self, event: Value) {
        let _ = self.commands.send(Command::Send(event.to_string()));
    }

    /// Close with a close frame.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Drop the TCP connection without a close frame.
    pub fn kill(self) {
        self.task.abort();
    }

    /// Next client message, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Skip client messages until one of type `kind` arrives.
    pub async fn expect(&mut self, kind: &str) -> Value {
        while let Some(message) = self.recv().await {
            if message["type"] == kind {
                return message;
            }
        }
        panic!("Expected client message of type {kind}");
    }

    /// Whether the client sent a message of type `kind` within `wait`.
    pub async fn saw_within(&mut self, kind: &str, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.received.recv()).await {
                Ok(Some(message)) if message["type"] == kind => return true,
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return false,
            }
        }
    }
}

/// Listener on an ephemeral local port
pub struct MockRealtimeServer {
    pub url: String,
    connections: mpsc::UnboundedReceiver<MockConnection>,
    task: JoinHandle<()>,
}

impl MockRealtimeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                let (recv_tx, recv_rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, cmd_rx, recv_tx).await {
                        eprintln!("mock connection error: {e}");
                    }
                });
                let connection = MockConnection {
                    commands: cmd_tx,
                    received: recv_rx,
                    task,
                };
                if conn_tx.send(connection).is_err() {
                    break;
                }
            }
        });

        Self {
            url: format!("ws://{addr}/v1/realtime"),
            connections: conn_rx,
            task,
        }
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> MockConnection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .ok()
            .flatten()
            .expect("client did not connect")
    }
}

impl Drop for MockRealtimeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    received: mpsc::UnboundedSender<Value>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(text)) => write.send(Message::Text(text.into())).await?,
                Some(Command::Close) | None => {
                    write.send(Message::Close(None)).await?;
                    break;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        let _ = received.send(value);
                    }
                }
                Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    eprintln!("WebSocket error: {e}");
                    break;
                }
                _ => {}
            },
        }
    }
    Ok(())
}
