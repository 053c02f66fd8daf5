use crate::{
    dispatcher::Dispatcher,
    types::{Request, Response},
};
use async_bincode::tokio::{AsyncBincodeReader, AsyncBincodeWriter};
use futures::{SinkExt, StreamExt};
use std::{num::NonZeroUsize, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, Semaphore},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, trace};

/// Serves requests arriving on one stream until it ends, breaks, or `done` fires.
///
/// Each request runs in its own task so a slow call does not hold up the ones
/// behind it; `max_in_flight` bounds how many run at once, and reading pauses
/// while the bound is reached. Responses go out in completion order.
pub(crate) async fn serve<S>(
    stream: S,
    dispatcher: Arc<Dispatcher>,
    max_in_flight: Option<NonZeroUsize>,
    done: CancellationToken,
    tasks: TaskTracker,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut requests = AsyncBincodeReader::<_, Request>::from(read_half);
    let responses = Arc::new(Mutex::new(
        AsyncBincodeWriter::<_, Response, _>::from(write_half).for_async(),
    ));
    let slots = max_in_flight.map(|n| Arc::new(Semaphore::new(n.get())));

    loop {
        let request = tokio::select! {
            biased;
            _ = done.cancelled() => break,
            next = requests.next() => match next {
                Some(Ok(request)) => request,
                Some(Err(err)) => {
                    debug!(%err, "undecodable request, dropping stream");
                    break;
                }
                None => break,
            },
        };

        let permit = match &slots {
            Some(slots) => tokio::select! {
                _ = done.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            },
            None => None,
        };

        let dispatcher = dispatcher.clone();
        let responses = responses.clone();
        let done = done.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let Request { seq, method, args } = request;
            trace!(seq, %method, "dispatching");
            let result = tokio::select! {
                _ = done.cancelled() => return,
                result = dispatcher.call(&method, args) => result,
            };
            if let Err(err) = &result {
                debug!(seq, %method, %err, "call failed");
            }
            if let Err(err) = responses.lock().await.send(Response { seq, result }).await {
                debug!(seq, %err, "writing response");
            }
        });
    }

    // On shutdown the session goes away with every stream; only a stream that
    // ended on its own gets closed here.
    if done.is_cancelled() {
        return;
    }
    if let Err(err) = responses.lock().await.close().await {
        trace!(%err, "closing served stream");
    };
}
