//! Multiplexed session management.
//!
//! One yamux session runs over each TCP connection. Every logical message
//! gets a fresh outbound sub-stream, and each inbound sub-stream carries
//! exactly one framed message. The yamux connection is owned by a driver
//! task; handles talk to it over channels, so sub-stream opens never race
//! the connection's internal I/O.

use std::collections::VecDeque;
use std::task::Poll;

use futures::future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use yamux::{Config, Connection, ConnectionError, Mode};

use crate::error::Error;

/// One sub-stream of a multiplexed session, carrying one framed message.
pub type SubStream = yamux::Stream;

type OpenReply = oneshot::Sender<Result<SubStream, Error>>;

/// Handle to a running multiplexed session.
///
/// The close signal resolves on explicit [`close`](MuxSession::close),
/// remote close, or fatal I/O error.
pub struct MuxSession {
    open_tx: mpsc::Sender<OpenReply>,
    closed: CancellationToken,
}

impl MuxSession {
    /// Wrap the dialing side of a connection.
    pub fn client<T>(io: T) -> (Self, mpsc::Receiver<SubStream>)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, Mode::Client)
    }

    /// Wrap the accepting side of a connection.
    pub fn server<T>(io: T) -> (Self, mpsc::Receiver<SubStream>)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, Mode::Server)
    }

    fn start<T>(io: T, mode: Mode) -> (Self, mpsc::Receiver<SubStream>)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Connection::new(io.compat(), Config::default(), mode);
        let (open_tx, open_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let closed = CancellationToken::new();

        tokio::spawn(drive(connection, open_rx, inbound_tx, closed.clone()));

        (Self { open_tx, closed }, inbound_rx)
    }

    /// Open a fresh outbound sub-stream.
    pub async fn open(&self) -> Result<SubStream, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.open_tx
            .send(reply_tx)
            .await
            .map_err(|_| Error::Shutdown)?;
        reply_rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is closed, for any reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

enum DriverEvent {
    Opened(Result<SubStream, ConnectionError>),
    Inbound(SubStream),
    RemoteClosed,
    Fatal(ConnectionError),
    HandleDropped,
}

/// Own the yamux connection: serve open requests, forward inbound
/// sub-streams, and keep the connection's I/O polled.
async fn drive<T>(
    mut connection: Connection<Compat<T>>,
    mut open_rx: mpsc::Receiver<OpenReply>,
    inbound_tx: mpsc::Sender<SubStream>,
    closed: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut waiting: VecDeque<OpenReply> = VecDeque::new();

    loop {
        let event = {
            let next = future::poll_fn(|cx| {
                loop {
                    match open_rx.poll_recv(cx) {
                        Poll::Ready(Some(reply)) => waiting.push_back(reply),
                        Poll::Ready(None) => return Poll::Ready(DriverEvent::HandleDropped),
                        Poll::Pending => break,
                    }
                }
                if !waiting.is_empty() {
                    if let Poll::Ready(opened) = connection.poll_new_outbound(cx) {
                        return Poll::Ready(DriverEvent::Opened(opened));
                    }
                }
                // Polling inbound also drives the connection's socket I/O.
                match connection.poll_next_inbound(cx) {
                    Poll::Ready(Some(Ok(stream))) => Poll::Ready(DriverEvent::Inbound(stream)),
                    Poll::Ready(Some(Err(e))) => Poll::Ready(DriverEvent::Fatal(e)),
                    Poll::Ready(None) => Poll::Ready(DriverEvent::RemoteClosed),
                    Poll::Pending => Poll::Pending,
                }
            });

            tokio::select! {
                _ = closed.cancelled() => break,
                event = next => event,
            }
        };

        match event {
            DriverEvent::Opened(opened) => {
                if let Some(reply) = waiting.pop_front() {
                    let _ = reply.send(opened.map_err(Error::Session));
                }
            }
            DriverEvent::Inbound(stream) => {
                if inbound_tx.send(stream).await.is_err() {
                    break;
                }
            }
            DriverEvent::RemoteClosed => break,
            DriverEvent::Fatal(e) => {
                tracing::debug!(error = %e, "session failed");
                break;
            }
            DriverEvent::HandleDropped => break,
        }
    }

    // Best-effort GoAway before dropping the socket.
    let _ = future::poll_fn(|cx| connection.poll_close(cx)).await;
    closed.cancel();

    while let Some(reply) = waiting.pop_front() {
        let _ = reply.send(Err(Error::Shutdown));
    }
}

#[cfg(test)]
mod tests {
    use futures::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn sub_stream_carries_bytes() {
        let (left, right) = tokio::io::duplex(4096);
        let (client, _client_inbound) = MuxSession::client(left);
        let (_server, mut server_inbound) = MuxSession::server(right);

        let mut outbound = client.open().await.unwrap();
        outbound.write_all(b"ping").await.unwrap();
        outbound.close().await.unwrap();

        let mut inbound = server_inbound.recv().await.unwrap();
        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");
    }

    #[tokio::test]
    async fn each_open_is_a_fresh_stream() {
        let (left, right) = tokio::io::duplex(4096);
        let (client, _client_inbound) = MuxSession::client(left);
        let (_server, mut server_inbound) = MuxSession::server(right);

        for message in [&b"one"[..], &b"two"[..]] {
            let mut outbound = client.open().await.unwrap();
            outbound.write_all(message).await.unwrap();
            outbound.close().await.unwrap();

            let mut inbound = server_inbound.recv().await.unwrap();
            let mut received = Vec::new();
            inbound.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, message);
        }
    }

    #[tokio::test]
    async fn close_resolves_both_sides() {
        let (left, right) = tokio::io::duplex(4096);
        let (client, _client_inbound) = MuxSession::client(left);
        let (server, _server_inbound) = MuxSession::server(right);

        client.close();
        client.closed().await;

        tokio::time::timeout(std::time::Duration::from_secs(1), server.closed())
            .await
            .expect("server side should observe the close");

        assert!(client.is_closed());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn open_after_close_fails() {
        let (left, _right) = tokio::io::duplex(4096);
        let (client, _inbound) = MuxSession::client(left);

        client.close();
        client.closed().await;

        assert!(client.open().await.is_err());
    }
}
