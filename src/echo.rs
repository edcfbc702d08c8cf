//! Echo loop for an upgraded WebSocket connection.
//!
//! One loop owns one connection and runs strictly in sequence:
//!
//! ```text
//! Open --recv(kind, payload)--> log --send(kind, payload)--> Open
//! Open --recv fails / peer close--> Closed
//! Open --send fails--> Closed
//! Open --shutdown token fires--> send Close(1001) --> Closed
//! ```
//!
//! The echo of message `n` is written before message `n + 1` is read.
//! Ping and pong frames are answered by the transport and never reach
//! the echo path.

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Classification of a WebSocket message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl MessageKind {
    pub fn of(message: &Message) -> Self {
        match message {
            Message::Text(_) => MessageKind::Text,
            Message::Binary(_) => MessageKind::Binary,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::Close(_) => MessageKind::Close,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageKind::Text => "text",
            MessageKind::Binary => "binary",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Close => "close",
        })
    }
}

/// I/O failure that ends a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EchoError {
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer sent a close frame or the stream ended.
    PeerClosed,
    /// Receiving or sending failed.
    Failed(EchoError),
    /// The server asked the session to stop.
    Shutdown,
}

/// Outcome of one echo loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Number of messages echoed back
    pub echoed: u64,
    pub end: SessionEnd,
}

/// Echo every text and binary message on `conn` until it fails, the peer
/// closes, or `shutdown` is cancelled.
///
/// Errors never escape: the returned [`Session`] says how the loop ended.
pub async fn run<C, E>(conn: &mut C, peer: SocketAddr, shutdown: &CancellationToken) -> Session
where
    C: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Unpin,
    E: fmt::Display,
{
    let mut echoed = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                }));
                if let Err(e) = conn.send(close).await {
                    debug!(peer = %peer, error = %e, "Failed to send close frame");
                }
                return Session { echoed, end: SessionEnd::Shutdown };
            }
            next = conn.next() => next,
        };

        let message = match next {
            Some(Ok(Message::Close(frame))) => {
                trace!(peer = %peer, ?frame, "Close frame received");
                return Session {
                    echoed,
                    end: SessionEnd::PeerClosed,
                };
            }
            Some(Ok(message @ (Message::Ping(_) | Message::Pong(_)))) => {
                trace!(peer = %peer, kind = %MessageKind::of(&message), "Control frame");
                continue;
            }
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                return Session {
                    echoed,
                    end: SessionEnd::Failed(EchoError::Receive(e.to_string())),
                };
            }
            None => {
                return Session {
                    echoed,
                    end: SessionEnd::PeerClosed,
                };
            }
        };

        info!(
            peer = %peer,
            kind = %MessageKind::of(&message),
            "{peer} sent: {}",
            payload_text(&message)
        );

        if let Err(e) = conn.send(message).await {
            return Session {
                echoed,
                end: SessionEnd::Failed(EchoError::Send(e.to_string())),
            };
        }
        echoed += 1;
    }
}

/// Payload rendered for the log line. Binary payloads are decoded lossily.
fn payload_text(message: &Message) -> Cow<'_, str> {
    match message {
        Message::Text(text) => Cow::Borrowed(text.as_str()),
        Message::Binary(data) | Message::Ping(data) | Message::Pong(data) => {
            String::from_utf8_lossy(data)
        }
        Message::Close(frame) => Cow::Borrowed(frame.as_ref().map_or("", |f| f.reason.as_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio_test::{assert_pending, assert_ready};

    const PEER: SocketAddr = SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
        40000,
    );

    /// Connection that replays scripted frames and records what is sent.
    #[derive(Default)]
    struct Scripted {
        incoming: VecDeque<Result<Message, &'static str>>,
        sent: Vec<Message>,
        fail_send: bool,
        /// Stay open (pending) instead of ending once the script runs out.
        hold_open: bool,
    }

    impl Scripted {
        fn new(incoming: Vec<Result<Message, &'static str>>) -> Self {
            Scripted {
                incoming: incoming.into(),
                ..Scripted::default()
            }
        }
    }

    impl Stream for Scripted {
        type Item = Result<Message, &'static str>;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            match self.incoming.pop_front() {
                Some(item) => Poll::Ready(Some(item)),
                None if self.hold_open => Poll::Pending,
                None => Poll::Ready(None),
            }
        }
    }

    impl Sink<Message> for Scripted {
        type Error = &'static str;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            if self.fail_send {
                return Err("broken pipe");
            }
            self.sent.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_echoes_in_order() {
        let messages = vec![
            Message::text("hello"),
            Message::text("world"),
            Message::binary(Bytes::from_static(&[0x00, 0xff, 0x10])),
            Message::text(""),
        ];
        let mut conn = Scripted::new(messages.iter().cloned().map(Ok).collect());

        let session = run(&mut conn, PEER, &CancellationToken::new()).await;

        assert_eq!(session.echoed, 4);
        assert_eq!(session.end, SessionEnd::PeerClosed);
        assert_eq!(conn.sent, messages);
    }

    #[tokio::test]
    async fn test_close_frame_ends_session() {
        let mut conn = Scripted::new(vec![
            Ok(Message::text("one")),
            Ok(Message::Close(None)),
            Ok(Message::text("never read")),
        ]);

        let session = run(&mut conn, PEER, &CancellationToken::new()).await;

        assert_eq!(session.end, SessionEnd::PeerClosed);
        assert_eq!(conn.sent, vec![Message::text("one")]);
        assert_eq!(conn.incoming.len(), 1);
    }

    #[tokio::test]
    async fn test_control_frames_not_echoed() {
        let mut conn = Scripted::new(vec![
            Ok(Message::Ping(Bytes::from_static(b"p"))),
            Ok(Message::text("data")),
            Ok(Message::Pong(Bytes::from_static(b"p"))),
        ]);

        let session = run(&mut conn, PEER, &CancellationToken::new()).await;

        assert_eq!(session.echoed, 1);
        assert_eq!(conn.sent, vec![Message::text("data")]);
    }

    #[tokio::test]
    async fn test_receive_error_ends_session() {
        let mut conn = Scripted::new(vec![
            Ok(Message::text("a")),
            Err("connection reset"),
            Ok(Message::text("b")),
        ]);

        let session = run(&mut conn, PEER, &CancellationToken::new()).await;

        assert_eq!(session.echoed, 1);
        assert_eq!(
            session.end,
            SessionEnd::Failed(EchoError::Receive("connection reset".to_string()))
        );
        assert_eq!(conn.sent, vec![Message::text("a")]);
    }

    #[tokio::test]
    async fn test_send_error_ends_session() {
        let mut conn = Scripted::new(vec![Ok(Message::text("a")), Ok(Message::text("b"))]);
        conn.fail_send = true;

        let session = run(&mut conn, PEER, &CancellationToken::new()).await;

        assert_eq!(session.echoed, 0);
        assert_eq!(
            session.end,
            SessionEnd::Failed(EchoError::Send("broken pipe".to_string()))
        );
        // Nothing is read after the failed send
        assert_eq!(conn.incoming.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_sends_going_away() {
        let mut conn = Scripted::new(Vec::new());
        conn.hold_open = true;
        let shutdown = CancellationToken::new();

        {
            let mut session = tokio_test::task::spawn(run(&mut conn, PEER, &shutdown));
            assert_pending!(session.poll());

            shutdown.cancel();
            assert!(session.is_woken());
            let session = assert_ready!(session.poll());
            assert_eq!(session.end, SessionEnd::Shutdown);
        }

        match conn.sent.as_slice() {
            [Message::Close(Some(frame))] => assert_eq!(frame.code, close_code::AWAY),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_close_failure_logged() {
        let logs = crate::log_capture::LogCapture::default();
        let _guard = logs.install(tracing::Level::DEBUG);

        let mut conn = Scripted::new(Vec::new());
        conn.hold_open = true;
        conn.fail_send = true;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let session = run(&mut conn, PEER, &shutdown).await;

        assert_eq!(session.end, SessionEnd::Shutdown);
        assert!(conn.sent.is_empty());

        let lines = logs.lines_containing("Failed to send close frame");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("peer=127.0.0.1:40000"));
        assert!(lines[0].contains("broken pipe"));
    }

    #[tokio::test]
    async fn test_logs_received_messages() {
        let logs = crate::log_capture::LogCapture::default();
        let _guard = logs.install(tracing::Level::INFO);

        let mut conn = Scripted::new(vec![
            Ok(Message::text("hello")),
            Ok(Message::Ping(Bytes::from_static(b"p"))),
            Ok(Message::text("world")),
        ]);

        run(&mut conn, PEER, &CancellationToken::new()).await;

        assert_eq!(
            logs.lines_containing(" sent: "),
            logs.lines_containing("127.0.0.1:40000 sent: ")
        );
        let lines = logs.lines_containing(" sent: ");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("127.0.0.1:40000 sent: hello"));
        assert!(lines[1].contains("127.0.0.1:40000 sent: world"));
    }

    #[test]
    fn test_message_kind() {
        assert_eq!(MessageKind::of(&Message::text("x")), MessageKind::Text);
        assert_eq!(
            MessageKind::of(&Message::binary(Bytes::new())),
            MessageKind::Binary
        );
        assert_eq!(MessageKind::of(&Message::Close(None)), MessageKind::Close);
        assert_eq!(MessageKind::Binary.to_string(), "binary");
    }

    #[test]
    fn test_payload_text() {
        assert_eq!(payload_text(&Message::text("hello")), "hello");
        assert_eq!(
            payload_text(&Message::binary(Bytes::from_static(b"hi\xff"))),
            "hi\u{fffd}"
        );
    }
}
