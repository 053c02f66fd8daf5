use crate::{
    config::Config,
    dispatcher::{Dispatcher, RpcFunctionInfo, Service},
    error::{Error, Result},
    net::{client::CallEngine, server},
    types,
};
use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tokio_yamux::{Session, StreamHandle};
use tracing::{debug, info, warn};

/// Which end of the yamux session this side plays.
///
/// Only the multiplexer cares; either role can both call and serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// One side of a bidirectional RPC connection.
///
/// Handles are cheap to clone and share one connection. The connection shuts
/// down on [`close`](Endpoint::close), when the transport fails, or when the
/// last handle is dropped, whichever comes first.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

struct Inner {
    dispatcher: Arc<Dispatcher>,
    calls: Arc<CallEngine<WriteHalf<StreamHandle>>>,
    lifecycle: Arc<Lifecycle>,
    tasks: TaskTracker,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.lifecycle.close("endpoint dropped");
    }
}

/// Open until `close` first succeeds, then closing for good.
struct Lifecycle {
    done: CancellationToken,
    closing: AtomicBool,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            done: CancellationToken::new(),
            closing: AtomicBool::new(false),
        }
    }

    /// Starts shutdown. Only the first caller does anything and gets `true`.
    ///
    /// Firing `done` stops the accept loop, which drops the session and with
    /// it the transport and every stream. The call engine fails its pending
    /// calls when it sees `done`.
    fn close(&self, reason: &'static str) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(reason, "closing rpc endpoint");
        self.done.cancel();
        true
    }
}

impl Endpoint {
    /// Runs the yamux server role over `transport` with the default [`Config`].
    pub async fn server<T>(transport: T) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_config(transport, Role::Server, Config::default()).await
    }

    /// Runs the yamux client role over `transport` with the default [`Config`].
    pub async fn client<T>(transport: T) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_config(transport, Role::Client, Config::default()).await
    }

    pub async fn with_config<T>(transport: T, role: Role, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Builder::new().config(config).connect(transport, role).await
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    async fn start<T>(
        transport: T,
        role: Role,
        config: Config,
        dispatcher: Dispatcher,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = match role {
            Role::Client => Session::new_client(transport, config.session_config()),
            Role::Server => Session::new_server(transport, config.session_config()),
        };
        let mut control = session.control();

        let dispatcher = Arc::new(dispatcher);
        let lifecycle = Arc::new(Lifecycle::new());
        let tasks = TaskTracker::new();

        // The accept loop drives the session; it has to run before a stream
        // can be opened.
        tasks.spawn(accept_loop(
            session,
            dispatcher.clone(),
            config.clone(),
            lifecycle.clone(),
            tasks.clone(),
        ));

        let stream = open_call_stream(
            control.open_stream(),
            config.open_timeout,
            &lifecycle,
            &tasks,
        )
        .await?;

        let (reader, writer) = tokio::io::split(stream);
        let calls = Arc::new(CallEngine::new(writer, lifecycle.done.clone()));
        tasks.spawn({
            let calls = calls.clone();
            let lifecycle = lifecycle.clone();
            async move {
                if let Err(err) = calls.read_responses(reader).await {
                    warn!(%err, "call stream failed");
                    lifecycle.close("call stream failed");
                }
            }
        });

        debug!(?role, "rpc endpoint open");
        Ok(Self {
            inner: Arc::new(Inner {
                dispatcher,
                calls,
                lifecycle,
                tasks,
            }),
        })
    }

    /// Makes every method of `service` callable by the peer.
    ///
    /// Fails without registering anything if a name is malformed or taken.
    pub fn register(&self, service: Service) -> Result<()> {
        self.inner.dispatcher.register(service)?;
        Ok(())
    }

    /// Functions registered so far, by qualified name.
    pub fn methods(&self) -> Vec<RpcFunctionInfo> {
        self.inner.dispatcher.rpc_functions()
    }

    /// Calls `method` (`Service.Method`) on the peer and waits for its reply.
    ///
    /// There is no built-in timeout; wrap the call in `tokio::time::timeout` to
    /// bound it. Dropping the call while it waits for the reply is fine, but
    /// dropping it in the middle of sending the request can leave a partial
    /// frame on the stream.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let args = types::encode(args)?;
        let reply = match self.inner.calls.call(method, args).await {
            Ok(reply) => reply,
            Err(err @ Error::Disconnected(_)) => {
                self.inner.lifecycle.close("call stream failed");
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        Ok(types::decode(&reply)?)
    }

    /// Shuts the connection down and waits for every background task to finish.
    ///
    /// Safe to call any number of times, from any number of tasks.
    pub async fn close(&self) {
        self.inner.lifecycle.close("closed by application");
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Resolves once the endpoint starts shutting down, for whatever reason.
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let done = self.inner.lifecycle.done.clone();
        async move { done.cancelled().await }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.done.is_cancelled()
    }

    /// Number of background tasks (accept loop, stream servers, running
    /// handlers, reply reader) still alive.
    pub fn background_tasks(&self) -> usize {
        self.inner.tasks.len()
    }
}

/// Sets up an [`Endpoint`] before it touches the transport.
///
/// Services added here are callable from the moment the connection starts,
/// so a peer that calls right away never races their registration.
#[derive(Default)]
pub struct Builder {
    config: Config,
    services: Vec<Service>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    /// Registers the services, then starts the session over `transport`.
    ///
    /// A registration error is returned before the transport is used.
    pub async fn connect<T>(self, transport: T, role: Role) -> Result<Endpoint>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let dispatcher = Dispatcher::default();
        for service in self.services {
            dispatcher.register(service)?;
        }
        Endpoint::start(transport, role, self.config, dispatcher).await
    }
}

/// Waits for the outbound call stream.
///
/// Failing to get one is fatal: the endpoint shuts down and every task spawned
/// so far, the accept loop included, has finished by the time this returns.
async fn open_call_stream<F, S, E>(
    open: F,
    timeout: Duration,
    lifecycle: &Lifecycle,
    tasks: &TaskTracker,
) -> Result<S>
where
    F: Future<Output = Result<S, E>>,
    E: fmt::Debug,
{
    let failure = match tokio::time::timeout(timeout, open).await {
        Ok(Ok(stream)) => return Ok(stream),
        Ok(Err(err)) => format!("{err:?}"),
        Err(_) => "timed out".to_owned(),
    };
    warn!(%failure, "opening call stream failed");
    lifecycle.close("opening call stream failed");
    tasks.close();
    tasks.wait().await;
    Err(Error::Session(failure))
}

/// Hands each stream the peer opens to its own dispatch loop.
///
/// Polling the session here also drives all of its I/O. When the session
/// ends or fails the endpoint shuts down; when the endpoint shuts down the
/// session is dropped, closing the transport.
async fn accept_loop<T>(
    mut session: Session<T>,
    dispatcher: Arc<Dispatcher>,
    config: Config,
    lifecycle: Arc<Lifecycle>,
    tasks: TaskTracker,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = lifecycle.done.cancelled() => break,
            next = session.next() => next,
        };
        match next {
            Some(Ok(stream)) => {
                debug!("accepted stream");
                tasks.spawn(server::serve(
                    stream,
                    dispatcher.clone(),
                    config.max_in_flight,
                    lifecycle.done.clone(),
                    tasks.clone(),
                ));
            }
            Some(Err(err)) => {
                warn!(%err, "session failed");
                lifecycle.close("session failed");
                break;
            }
            None => {
                debug!("session ended");
                lifecycle.close("session ended");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::{tests::message_pipe, MessageIo};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    #[test]
    fn lifecycle_closes_once() {
        let lifecycle = Arc::new(Lifecycle::new());
        let wins = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                let wins = wins.clone();
                thread::spawn(move || {
                    if lifecycle.close("test") {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(lifecycle.done.is_cancelled());
    }

    fn running_accept_loop() -> (Lifecycle, TaskTracker) {
        let lifecycle = Lifecycle::new();
        let tasks = TaskTracker::new();
        let done = lifecycle.done.clone();
        tasks.spawn(async move { done.cancelled().await });
        (lifecycle, tasks)
    }

    #[tokio::test]
    async fn failing_to_open_the_call_stream_is_fatal() {
        let (lifecycle, tasks) = running_accept_loop();
        let refused = async { Err::<(), _>(std::io::Error::from(std::io::ErrorKind::BrokenPipe)) };

        let result = open_call_stream(refused, Duration::from_secs(5), &lifecycle, &tasks).await;
        assert!(matches!(result, Err(Error::Session(_))));
        assert!(lifecycle.done.is_cancelled());
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn opening_the_call_stream_times_out() {
        let (lifecycle, tasks) = running_accept_loop();
        let never = futures::future::pending::<std::result::Result<(), ()>>();

        let result = open_call_stream(never, Duration::from_millis(10), &lifecycle, &tasks).await;
        match result {
            Err(Error::Session(reason)) => assert_eq!(reason, "timed out"),
            other => panic!("expected a session error, got {other:?}"),
        }
        assert!(lifecycle.done.is_cancelled());
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn endpoint_over_a_dead_transport_does_not_linger() {
        let (transport, peer) = tokio::io::duplex(1024);
        drop(peer);
        let config = Config {
            open_timeout: Duration::from_millis(200),
            ..Config::default()
        };

        // The session may or may not hand out a stream before noticing the
        // transport is gone; either way the endpoint ends up shut down.
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            Endpoint::with_config(transport, Role::Client, config),
        )
        .await
        .unwrap();
        match outcome {
            Err(err) => assert!(matches!(err, Error::Session(_)), "{err}"),
            Ok(endpoint) => {
                tokio::time::timeout(Duration::from_secs(5), endpoint.done())
                    .await
                    .unwrap();
                endpoint.close().await;
                assert_eq!(endpoint.background_tasks(), 0);
            }
        }
    }

    #[tokio::test]
    async fn calls_over_a_message_transport_with_keepalives() {
        let (near, far) = message_pipe();
        // Stray empty messages ahead of the session handshake.
        far.inject(b"");
        near.inject(b"");

        let (server, client) = tokio::join!(
            Endpoint::server(MessageIo::new(near)),
            Endpoint::client(MessageIo::new(far)),
        );
        let (server, client) = (server.unwrap(), client.unwrap());
        server
            .register(Service::new("Text").method("Upper", |s: String| async move {
                Ok::<_, String>(s.to_uppercase())
            }))
            .unwrap();

        let reply: String = tokio::time::timeout(
            Duration::from_secs(5),
            client.call("Text.Upper", "hello"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply, "HELLO");

        client.close().await;
        server.close().await;
    }
}
