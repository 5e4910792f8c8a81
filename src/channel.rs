//! Control channel to the worker.
//!
//! A message-framed WebSocket over loopback. The channel owns exactly one
//! connection object; reconnection policy lives with the owner (the app's
//! single-flight reconnect loop), never in here. `send` is fire-and-forget
//! and a no-op while disconnected: commands are never queued across a gap.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    protocol::{self, InboundMessage, OutboundMessage},
    session::ControlPort,
    trace,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// What the channel reports upward into the coordinator's event queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Inbound(InboundMessage),
    /// The connection dropped without a local `close()`. Emitted at most
    /// once per connection.
    Closed,
}

struct Inner {
    url: String,
    phase: Mutex<ChannelPhase>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    closing: AtomicBool,
    conn_seq: AtomicU64,
    data_dir: PathBuf,
}

#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<Inner>,
}

impl ControlChannel {
    pub fn new(data_dir: PathBuf, port: u16, events_tx: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: format!("ws://127.0.0.1:{port}"),
                phase: Mutex::new(ChannelPhase::Disconnected),
                writer_tx: Mutex::new(None),
                events_tx,
                closing: AtomicBool::new(false),
                conn_seq: AtomicU64::new(0),
                data_dir,
            }),
        }
    }

    pub fn phase(&self) -> ChannelPhase {
        *self.inner.phase.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ChannelPhase::Connected
    }

    /// Attempts to establish the connection up to `max_attempts` times with
    /// `delay` between attempts. Already-connected and concurrently-connecting
    /// calls return immediately; the single-flight guard is the caller's, this
    /// is just the backstop.
    pub async fn connect(&self, max_attempts: u32, delay: Duration) -> Result<()> {
        {
            let mut phase = self.inner.phase.lock().unwrap();
            if *phase != ChannelPhase::Disconnected {
                return Ok(());
            }
            *phase = ChannelPhase::Connecting;
        }
        self.inner.closing.store(false, Ordering::SeqCst);

        let mut last_err = String::new();
        for attempt in 1..=max_attempts.max(1) {
            match connect_async(self.inner.url.as_str()).await {
                Ok((ws, _resp)) => {
                    self.install(ws);
                    trace::event(
                        &self.inner.data_dir,
                        None,
                        "Channel",
                        "CH.connect",
                        "ok",
                        Some(serde_json::json!({"attempt": attempt})),
                    );
                    return Ok(());
                }
                Err(e) => {
                    last_err = e.to_string();
                    trace::event(
                        &self.inner.data_dir,
                        None,
                        "Channel",
                        "CH.connect_attempt",
                        "err",
                        Some(serde_json::json!({"attempt": attempt, "error": last_err})),
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        *self.inner.phase.lock().unwrap() = ChannelPhase::Disconnected;
        bail!(
            "E_CHANNEL_CONNECT: failed to reach worker at {} after {} attempts: {last_err}",
            self.inner.url,
            max_attempts.max(1)
        )
    }

    fn install(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let seq = self.inner.conn_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut sink, mut stream) = ws.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();

        *self.inner.writer_tx.lock().unwrap() = Some(writer_tx);
        *self.inner.phase.lock().unwrap() = ChannelPhase::Connected;

        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(msg) = protocol::decode_inbound(&text) {
                            if this.inner.events_tx.send(ChannelEvent::Inbound(msg)).is_err() {
                                break;
                            }
                        } else {
                            trace::event(
                                &this.inner.data_dir,
                                None,
                                "Channel",
                                "CH.frame_dropped",
                                "skipped",
                                Some(serde_json::json!({"len": text.len()})),
                            );
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {} // ping/pong/binary: nothing for us
                }
            }
            this.finalize(seq);
        });
    }

    /// Marks the connection gone and, unless it was an intentional local
    /// close, notifies the owner exactly once.
    fn finalize(&self, seq: u64) {
        if self.inner.conn_seq.load(Ordering::SeqCst) != seq {
            return;
        }
        {
            let mut phase = self.inner.phase.lock().unwrap();
            if *phase == ChannelPhase::Disconnected {
                return;
            }
            *phase = ChannelPhase::Disconnected;
        }
        *self.inner.writer_tx.lock().unwrap() = None;

        if self.inner.closing.load(Ordering::SeqCst) {
            trace::event(&self.inner.data_dir, None, "Channel", "CH.closed", "ok", None);
            return;
        }
        trace::event(
            &self.inner.data_dir,
            None,
            "Channel",
            "CH.closed_unexpected",
            "err",
            None,
        );
        let _ = self.inner.events_tx.send(ChannelEvent::Closed);
    }

    /// Fire-and-forget send. A disconnected channel drops the command; the
    /// coordinator's connectivity guard is responsible for not getting here
    /// mid-session.
    pub fn send(&self, msg: &OutboundMessage) {
        let g = self.inner.writer_tx.lock().unwrap();
        let Some(tx) = g.as_ref() else {
            trace::event(
                &self.inner.data_dir,
                None,
                "Channel",
                "CH.send_skipped",
                "skipped",
                Some(serde_json::json!({"reason": "disconnected"})),
            );
            return;
        };
        match protocol::encode_outbound(msg) {
            Ok(text) => {
                let _ = tx.send(Message::Text(text));
            }
            Err(e) => {
                trace::event(
                    &self.inner.data_dir,
                    None,
                    "Channel",
                    "CH.encode_failed",
                    "err",
                    Some(serde_json::json!({"error": e.to_string()})),
                );
            }
        }
    }

    /// Intentional close: suppresses the close notification and drops the
    /// writer so no further frames go out.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let tx = self.inner.writer_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(Message::Close(None));
        }
        *self.inner.phase.lock().unwrap() = ChannelPhase::Disconnected;
    }
}

impl ControlPort for ControlChannel {
    fn is_connected(&self) -> bool {
        ControlChannel::is_connected(self)
    }

    fn send(&self, msg: &OutboundMessage) {
        ControlChannel::send(self, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn channel_for(
        port: u16,
    ) -> (
        ControlChannel,
        mpsc::UnboundedReceiver<ChannelEvent>,
        tempfile::TempDir,
    ) {
        let td = tempfile::tempdir().expect("tempdir");
        let (tx, rx) = mpsc::unbounded_channel();
        (ControlChannel::new(td.path().to_path_buf(), port, tx), rx, td)
    }

    #[tokio::test]
    async fn bounded_connect_fails_when_nothing_listens() {
        // Bind-then-drop to get a port that refuses connections.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let (ch, _rx, _td) = channel_for(port).await;
        let err = ch
            .connect(2, Duration::from_millis(10))
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("E_CHANNEL_CONNECT"));
        assert!(!ch.is_connected());
    }

    #[tokio::test]
    async fn connects_and_delivers_inbound_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");
            ws.send(Message::Text(r#"{"type":"READY"}"#.to_string()))
                .await
                .expect("send ready");
            // An unknown frame must be dropped silently.
            ws.send(Message::Text(r#"{"type":"MYSTERY"}"#.to_string()))
                .await
                .expect("send mystery");
            // Read one frame back from the client, then hold the socket open.
            let frame = ws.next().await.expect("client frame").expect("frame ok");
            frame
        });

        let (ch, mut rx, _td) = channel_for(port).await;
        ch.connect(3, Duration::from_millis(10)).await.expect("connect");
        assert!(ch.is_connected());

        let ev = rx.recv().await.expect("event");
        assert_eq!(ev, ChannelEvent::Inbound(InboundMessage::Ready));

        ch.send(&OutboundMessage::Start { reason: None });
        let frame = server.await.expect("server join");
        assert_eq!(frame.into_text().expect("text"), r#"{"type":"START"}"#);
    }

    #[tokio::test]
    async fn unexpected_close_notifies_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let ws = accept_async(stream).await.expect("handshake");
            drop(ws); // server vanishes
        });

        let (ch, mut rx, _td) = channel_for(port).await;
        ch.connect(3, Duration::from_millis(10)).await.expect("connect");

        let ev = rx.recv().await.expect("event");
        assert_eq!(ev, ChannelEvent::Closed);
        assert!(!ch.is_connected());
        // No duplicate close notification.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn intentional_close_suppresses_notification() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");
            // Drain until the client goes away.
            while ws.next().await.is_some() {}
        });

        let (ch, mut rx, _td) = channel_for(port).await;
        ch.connect(3, Duration::from_millis(10)).await.expect("connect");
        ch.close();
        assert!(!ch.is_connected());

        // Give the reader task time to observe the close.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_while_disconnected_is_a_no_op() {
        let (ch, mut rx, _td) = channel_for(1).await;
        ch.send(&OutboundMessage::Quit);
        assert!(rx.try_recv().is_err());
        assert!(!ch.is_connected());
    }
}
