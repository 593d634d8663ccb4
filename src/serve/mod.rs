use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::{Builder, Http1Builder, Http2Builder},
};
use tokio::{net::TcpListener, sync::Notify};

use crate::service::{MakeService, Service};

#[derive(Debug, Default)]
struct NotifyOnce {
    notified: AtomicBool,
    notify: Notify,
}

impl NotifyOnce {
    pub(crate) fn notify_waiters(&self) {
        self.notified.store(true, Ordering::SeqCst);

        self.notify.notify_waiters();
    }

    pub(crate) fn is_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }

    pub(crate) async fn notified(&self) {
        let future = self.notify.notified();

        if !self.notified.load(Ordering::SeqCst) {
            future.await;
        }
    }
}

#[derive(Default)]
struct HandleInner {
    conn_count: AtomicUsize,
    shutdown: NotifyOnce,
    kill: Notify,
}

/// Remote control for a running [`Server`].
#[derive(Clone, Default)]
pub struct Handle(Arc<HandleInner>);

struct Watcher(Handle);

impl Watcher {
    fn inner(&self) -> &HandleInner {
        &self.0 .0
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let count = self.inner().conn_count.fetch_sub(1, Ordering::SeqCst);

        // if count == 1, the new count is 0, so if shutdown is requested
        // we should kill the server ASAP.
        if count == 1 && self.inner().shutdown.is_notified() {
            self.inner().kill.notify_waiters();
        }
    }
}

impl Handle {
    /// Initiates a graceful shutdown of the server: the listener closes and
    /// open connections are asked to finish.
    pub fn shutdown(&self) {
        self.0.shutdown.notify_waiters();
    }

    /// Immediately stops the server, dropping all active connections.
    pub fn kill(&self) {
        self.0.kill.notify_waiters();
    }

    pub fn shutdown_on<F>(self, signal: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            signal.await;
            self.shutdown();
        });
    }

    fn shutdown_notified(&self) -> impl Future<Output = ()> + '_ {
        self.0.shutdown.notified()
    }

    fn kill_notified(&self) -> impl Future<Output = ()> + '_ {
        self.0.kill.notified()
    }

    fn watcher(&self) -> Watcher {
        self.0.conn_count.fetch_add(1, Ordering::SeqCst);
        Watcher(self.clone())
    }

    async fn wait_internal(&self) {
        if self.0.conn_count.load(Ordering::SeqCst) == 0 {
            self.kill(); // no connections, kill immediately
            return;
        }

        self.kill_notified().await;
    }

    pub async fn wait(&self) {
        self.kill_notified().await
    }
}

/// HTTP server.
#[must_use]
pub struct Server {
    builder: Builder<TokioExecutor>,
    listener: Listener,
    handle: Handle,
}

#[derive(Debug)]
enum Listener {
    Bind(SocketAddr),
    Std(std::net::TcpListener),
}

impl Server {
    /// Create a server that will bind to the provided address.
    pub fn bind(addr: SocketAddr) -> Self {
        Self {
            builder: Builder::new(TokioExecutor::new()),
            listener: Listener::Bind(addr),
            handle: Handle::default(),
        }
    }

    /// Create a server from an existing `std::net::TcpListener`.
    pub fn from_tcp(listener: std::net::TcpListener) -> Self {
        Self {
            builder: Builder::new(TokioExecutor::new()),
            listener: Listener::Std(listener),
            handle: Handle::default(),
        }
    }

    /// Returns a mutable reference to the Http builder.
    pub fn http_builder(&mut self) -> &mut Builder<TokioExecutor> {
        &mut self.builder
    }

    pub fn http1(&mut self) -> Http1Builder<TokioExecutor> {
        self.builder.http1()
    }

    pub fn http2(&mut self) -> Http2Builder<TokioExecutor> {
        self.builder.http2()
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Accepts connections and serves them until the handle requests
    /// shutdown, then waits for open connections to drain.
    pub async fn serve<M, B>(self, make_service: M) -> io::Result<()>
    where
        // M "creates" a service under the given client address
        M: MakeService<SocketAddr, http::Request<Incoming>>,
        M::Service: Clone
            + Service<
                http::Request<Incoming>,
                Response = http::Response<B>,
                Error: core::error::Error + Send + Sync + 'static,
            > + 'static,
        B: http_body::Body<Data: Send, Error: core::error::Error + Send + Sync + 'static>
            + Send
            + 'static,
    {
        let Self { builder, listener, handle } = self;

        let builder = Arc::new(builder);

        let listener = match listener {
            Listener::Bind(addr) => TcpListener::bind(addr).await?,
            Listener::Std(std_listener) => {
                std_listener.set_nonblocking(true)?;
                TcpListener::from_std(std_listener)?
            }
        };

        let mut shutdown = std::pin::pin!(handle.shutdown_notified());

        loop {
            let (stream, socket_addr) = tokio::select! {
                biased;

                _ = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::warn!("accept error: {err}");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            let service = make_service.make_service(socket_addr);
            let watcher = handle.watcher();
            let builder = builder.clone();

            // spawn new task to handle real HTTP connection
            tokio::spawn(async move {
                let mut conn = std::pin::pin!(builder.serve_connection(
                    TokioIo::new(stream),
                    hyper::service::service_fn(move |mut req| {
                        req.extensions_mut().insert(socket_addr);

                        // in practice, this is a single `Arc` clone
                        let service = service.clone();
                        async move { service.call(req).await }
                    }),
                ));

                let mut kill = std::pin::pin!(watcher.0.kill_notified());

                loop {
                    tokio::select! {
                        biased;

                        _ = &mut kill => break,

                        res = conn.as_mut() => {
                            if let Err(err) = res {
                                // hyper errors are routine connection noise
                                if let Err(err) = err.downcast::<hyper::Error>() {
                                    log::error!("connection error: {err:?}");
                                }
                            }

                            break; // connection has completed
                        },

                        _ = watcher.0.shutdown_notified() => {
                            // tell the connection to shutdown gracefully, then continue
                            conn.as_mut().graceful_shutdown();

                            continue;
                        }
                    }
                }
            });
        }

        handle.wait_internal().await;

        Ok(())
    }
}
