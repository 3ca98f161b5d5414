//! Local stand-ins for the bridge REST API and the rtcstats collector.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Serve `bodies` in order, one per request, repeating the last one.
pub async fn spawn_bridge(status: u16, bodies: Vec<String>) -> String {
    spawn_bridge_responses(bodies.into_iter().map(|body| (status, body)).collect()).await
}

/// Like [`spawn_bridge`], with a status code per response.
pub async fn spawn_bridge_responses(responses: Vec<(u16, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            let (status, body) = responses
                .get(served)
                .or_else(|| responses.last())
                .cloned()
                .unwrap_or((200, String::new()));
            served += 1;
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = sock.write_all(reply.as_bytes()).await;
            let _ = sock.shutdown().await;
        }
    });
    format!("http://{addr}")
}

/// Headers the collector saw during a successful handshake.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub protocol: Option<String>,
    pub origin: Option<String>,
}

/// Complete a server-side handshake, echoing the requested sub-protocol.
pub async fn accept_ws(sock: TcpStream, seen: Arc<Mutex<Handshake>>) -> WebSocketStream<TcpStream> {
    let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let protocol = header("Sec-WebSocket-Protocol");
        if let Some(p) = &protocol {
            resp.headers_mut()
                .insert("Sec-WebSocket-Protocol", p.parse().unwrap());
        }
        *seen.lock().unwrap() = Handshake {
            protocol,
            origin: header("Origin"),
        };
        Ok(resp)
    };
    tokio_tungstenite::accept_hdr_async(sock, callback).await.unwrap()
}

/// A collector that accepts every connection and forwards text frames as
/// parsed JSON.
pub async fn spawn_collector() -> (String, mpsc::UnboundedReceiver<Value>, Arc<Mutex<Handshake>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let seen = Arc::new(Mutex::new(Handshake::default()));
    let seen_task = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else { return };
            let mut ws = accept_ws(sock, Arc::clone(&seen_task)).await;
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(Ok(frame)) = ws.next().await {
                    if let Message::Text(text) = frame {
                        if let Ok(v) = serde_json::from_str::<Value>(&text) {
                            let _ = tx.send(v);
                        }
                    }
                }
            });
        }
    });
    (format!("ws://{addr}"), rx, seen)
}

/// Receive the next collector message or fail after two seconds.
pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for collector message")
        .expect("collector channel closed")
}
