use crate::{
    error::Error,
    types::{Request, Response, Seq},
};
use async_bincode::{
    tokio::{AsyncBincodeReader, AsyncBincodeWriter},
    AsyncDestination,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{oneshot, Mutex as AsyncMutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type Reply = Result<Vec<u8>, Error>;

/// Issues calls over the one stream this side opened and matches replies to callers.
///
/// Writes are serialized; waiting is not, so any number of calls can be
/// outstanding at once. Replies are read by [`CallEngine::read_responses`],
/// which must run for calls to complete.
pub(crate) struct CallEngine<W> {
    next_seq: AtomicU64,
    // `None` once the engine has shut down; no call may register after that.
    pending: PendingCalls,
    requests: AsyncMutex<AsyncBincodeWriter<W, Request, AsyncDestination>>,
    done: CancellationToken,
}

impl<W> CallEngine<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(writer: W, done: CancellationToken) -> Self {
        Self {
            next_seq: AtomicU64::new(0),
            pending: Mutex::new(Some(HashMap::new())),
            requests: AsyncMutex::new(AsyncBincodeWriter::from(writer).for_async()),
            done,
        }
    }

    pub(crate) async fn call(&self, method: &str, args: Vec<u8>) -> Reply {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().as_mut() {
            Some(pending) => pending.insert(seq, tx),
            None => return Err(Error::Closed),
        };
        // Removes the entry however this call ends, including when the
        // caller stops polling it.
        let _pending = PendingGuard {
            pending: &self.pending,
            seq,
        };

        let request = Request {
            seq,
            method: method.to_owned(),
            args,
        };
        trace!(seq, method, "sending request");
        if let Err(err) = self.requests.lock().await.send(request).await {
            let reason = err.to_string();
            debug!(seq, %reason, "writing request failed");
            self.shut_down(|| Error::Disconnected(reason.clone()));
            return Err(Error::Disconnected(reason));
        }

        tokio::select! {
            biased;
            reply = rx => reply.unwrap_or(Err(Error::Closed)),
            _ = self.done.cancelled() => Err(Error::Closed),
        }
    }

    /// Reads responses until the stream ends or `done` fires, then fails
    /// whatever is still pending.
    ///
    /// Returns the stream failure, if any; a shutdown through `done` is `Ok`.
    pub(crate) async fn read_responses<R>(&self, reader: R) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut responses = AsyncBincodeReader::<R, Response>::from(reader);
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = self.done.cancelled() => break Ok(()),
                next = responses.next() => next,
            };
            match next {
                Some(Ok(response)) => self.resolve(response),
                Some(Err(err)) => break Err(Error::Codec(err)),
                None => break Err(Error::Disconnected("stream closed by peer".to_owned())),
            }
        };

        match &outcome {
            Ok(()) => self.shut_down(|| Error::Closed),
            Err(err) => {
                let reason = err.to_string();
                self.shut_down(|| Error::Disconnected(reason.clone()));
            }
        }
        outcome
    }

    fn resolve(&self, Response { seq, result }: Response) {
        let waiter = self.pending.lock().as_mut().and_then(|p| p.remove(&seq));
        match waiter {
            // The caller may have given up waiting; nothing to do then.
            Some(tx) => {
                _ = tx.send(result.map_err(Error::Remote));
            }
            None => debug!(seq, "response for unknown call dropped"),
        }
    }

    /// Fails every pending call and refuses new ones.
    fn shut_down(&self, error: impl Fn() -> Error) {
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending calls");
        }
        for tx in pending.into_values() {
            _ = tx.send(Err(error()));
        }
    }
}

type PendingCalls = Mutex<Option<HashMap<Seq, oneshot::Sender<Reply>>>>;

struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    seq: Seq,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.lock().as_mut() {
            pending.remove(&self.seq);
        }
    }
}
