//! Byte-stream view of a message-oriented connection such as a WebSocket.

use bytes::{Buf, Bytes};
use futures::{ready, Sink, Stream};
use std::{
    error::Error as StdError,
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A message type [`MessageIo`] can carry bytes in.
pub trait Frame: Sized {
    /// Wraps outgoing bytes in one binary message.
    fn binary(payload: Bytes) -> Self;

    /// Application bytes carried by an incoming message.
    ///
    /// Control messages yield an empty payload and are skipped; `None` marks
    /// the end of the connection.
    fn into_payload(self) -> Option<Bytes>;
}

impl Frame for Bytes {
    fn binary(payload: Bytes) -> Self {
        payload
    }

    fn into_payload(self) -> Option<Bytes> {
        Some(self)
    }
}

impl Frame for Vec<u8> {
    fn binary(payload: Bytes) -> Self {
        payload.to_vec()
    }

    fn into_payload(self) -> Option<Bytes> {
        Some(Bytes::from(self))
    }
}

#[cfg(feature = "websocket")]
impl Frame for tokio_tungstenite::tungstenite::Message {
    fn binary(payload: Bytes) -> Self {
        Self::Binary(payload)
    }

    fn into_payload(self) -> Option<Bytes> {
        use tokio_tungstenite::tungstenite::Message;
        match self {
            Message::Binary(payload) => Some(payload),
            Message::Text(text) => Some(Bytes::copy_from_slice(text.as_bytes())),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Some(Bytes::new()),
            Message::Close(_) => None,
        }
    }
}

/// Adapts a message `Stream + Sink` into `AsyncRead + AsyncWrite`.
///
/// Every `poll_write` sends exactly one binary message. Reads hand out the
/// next non-empty message, spreading it over several reads when the caller's
/// buffer is smaller; empty and control messages never surface as data.
pub struct MessageIo<S> {
    inner: S,
    unread: Bytes,
    eof: bool,
}

impl<S> MessageIo<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            unread: Bytes::new(),
            eof: false,
        }
    }
}

fn io_error<E>(err: E) -> io::Error
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::Other, err)
}

impl<S, M, E> AsyncRead for MessageIo<S>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin,
    M: Frame,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.unread.is_empty() {
                let n = this.unread.len().min(buf.remaining());
                buf.put_slice(&this.unread[..n]);
                this.unread.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(message)) => match message.into_payload() {
                    Some(payload) => this.unread = payload,
                    None => this.eof = true,
                },
                Some(Err(err)) => return Poll::Ready(Err(io_error(err))),
                None => this.eof = true,
            }
        }
    }
}

impl<S, M, E> AsyncWrite for MessageIo<S>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin,
    M: Frame,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(io_error)?;
        Pin::new(&mut this.inner)
            .start_send(M::binary(Bytes::copy_from_slice(buf)))
            .map_err(io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(io_error)
    }
}
