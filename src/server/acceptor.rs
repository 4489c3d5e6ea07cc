//! The listening socket(s), signal-driven shutdown, and round-robin
//! dispatch of accepted connections across a fixed worker pool.

use crate::{
    http::{request::Request, response::Response},
    limits::{ConnLimits, Config, ReqLimits, RespLimits, WsLimits},
    server::connection::HttpWorker,
    ws::frame::WsHandler,
    Handled,
};
use crossbeam::channel::{unbounded, Sender};
use mio::net::TcpStream as MioTcpStream;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::TcpListener as StdTcpListener,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

/// Processes one parsed HTTP request and produces a response.
///
/// # Examples
/// ```
/// use nimbus_http::{Handler, Request, Response, Handled, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     fn handle(&self, _req: &Request, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::Ok).body("Hello world!")
///     }
/// }
/// ```
pub trait Handler: Sync + Send + 'static {
    /// Processes a request and returns [`Handled`] once the response is finalised.
    fn handle(&self, request: &Request, response: &mut Response) -> Handled;
}

/// A built, ready-to-launch server: a fixed pool of HTTP worker threads plus
/// one dedicated WebSocket event-loop thread, already spawned and waiting
/// on their dispatch channels.
pub struct Server {
    listeners: Vec<StdTcpListener>,
    conn_limits: ConnLimits,

    worker_txs: Vec<Sender<MioTcpStream>>,
    worker_handles: Vec<thread::JoinHandle<()>>,
    ws_handle: thread::JoinHandle<()>,

    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Starts a new builder. `H` is the handler type that will process
    /// every request; set it with [`ServerBuilder::handler`].
    #[inline]
    pub fn builder<H: Handler>() -> ServerBuilder<H> {
        ServerBuilder {
            handler: None,
            ws_handler: None,
            config: None,
            conn_limits: None,
            req_limits: None,
            resp_limits: None,
            ws_limits: None,
        }
    }

    /// Installs the `SIGINT`/`SIGTERM` shutdown handler, runs the accept
    /// loop(s) on the calling thread, and blocks until every worker and the
    /// WebSocket loop have drained their in-flight connections and exited.
    pub fn launch(self) -> io::Result<()> {
        let shutdown = self.shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received, draining connections");
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| io::Error::other(e.to_string()))?;

        let next_worker = Arc::new(AtomicUsize::new(0));
        let mut accept_handles = Vec::with_capacity(self.listeners.len());

        for listener in self.listeners {
            listener.set_nonblocking(true)?;
            let worker_txs = self.worker_txs.clone();
            let next_worker = next_worker.clone();
            let conn_limits = self.conn_limits.clone();
            let shutdown = self.shutdown.clone();

            accept_handles.push(thread::spawn(move || {
                accept_loop(listener, &worker_txs, &next_worker, &conn_limits, &shutdown);
            }));
        }

        for handle in accept_handles {
            let _ = handle.join();
        }

        drop(self.worker_txs);
        for handle in self.worker_handles {
            let _ = handle.join();
        }
        let _ = self.ws_handle.join();

        Ok(())
    }
}

fn accept_loop(
    listener: StdTcpListener,
    worker_txs: &[Sender<MioTcpStream>],
    next_worker: &AtomicUsize,
    conn_limits: &ConnLimits,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = configure_accepted(&stream, conn_limits) {
                    log::warn!("failed to configure accepted socket: {e}");
                    continue;
                }

                let mio_stream = MioTcpStream::from_std(stream);

                let idx = next_worker.fetch_add(1, Ordering::Relaxed) % worker_txs.len();
                if worker_txs[idx].send(mio_stream).is_err() {
                    log::warn!("worker {idx} dispatch channel closed");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(std::time::Duration::from_millis(5));
            }
            Err(e) => log::warn!("accept failed: {e}"),
        }
    }
}

fn configure_accepted(stream: &std::net::TcpStream, limits: &ConnLimits) -> io::Result<()> {
    let socket = socket2::SockRef::from(stream);
    socket.set_keepalive(true)?;
    socket.set_nonblocking(true)?;
    socket.set_write_timeout(Some(limits.socket_send_timeout))?;
    socket.set_read_timeout(Some(limits.socket_recv_timeout))?;
    Ok(())
}

/// Builder for configuring and spawning a [`Server`].
pub struct ServerBuilder<H: Handler> {
    handler: Option<Arc<H>>,
    ws_handler: Option<Arc<dyn WsHandler>>,

    config: Option<Config>,
    conn_limits: Option<ConnLimits>,
    req_limits: Option<ReqLimits>,
    resp_limits: Option<RespLimits>,
    ws_limits: Option<WsLimits>,
}

impl<H: Handler> ServerBuilder<H> {
    /// Sets the request handler. **Required.**
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Installs callbacks for upgraded WebSocket connections. Optional —
    /// without it, upgraded connections are still drained (pings answered,
    /// frames discarded) but no application code is notified.
    #[inline(always)]
    pub fn ws_handler<W: WsHandler>(mut self, handler: W) -> Self {
        self.ws_handler = Some(Arc::new(handler));
        self
    }

    /// Overrides server topology (bind address, worker/accept thread counts).
    #[inline(always)]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides connection-level limits and timeouts.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.conn_limits = Some(limits);
        self
    }

    /// Overrides request parsing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.req_limits = Some(limits);
        self
    }

    /// Overrides response buffer limits.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.resp_limits = Some(limits);
        self
    }

    /// Overrides WebSocket frame buffer limits.
    #[inline(always)]
    pub fn ws_limits(mut self, limits: WsLimits) -> Self {
        self.ws_limits = Some(limits);
        self
    }

    /// Binds the listening socket(s) and spawns the worker pool and the
    /// WebSocket event loop.
    ///
    /// # Panics
    /// Panics if [`handler`](Self::handler) was never called.
    #[track_caller]
    pub fn build(self) -> io::Result<Server> {
        let handler = self.handler.expect("The `handler` method must be called to create");
        let config = self.config.unwrap_or_default();
        let conn_limits = self.conn_limits.unwrap_or_default();
        let req_limits = self.req_limits.unwrap_or_default().precalculate();
        let resp_limits = self.resp_limits.unwrap_or_default();
        let ws_limits = self.ws_limits.unwrap_or_default();

        let mut listeners = Vec::with_capacity(config.accept_thread_count.max(1));
        for _ in 0..config.accept_thread_count.max(1) {
            listeners.push(bind_reuseport(config.bind_addr, config.port)?);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (ws_tx, ws_rx) = unbounded();

        let mut worker_txs = Vec::with_capacity(config.worker_count.max(1));
        let mut worker_handles = Vec::with_capacity(config.worker_count.max(1));

        for id in 0..config.worker_count.max(1) {
            let (tx, rx) = unbounded();
            worker_txs.push(tx);

            let handler = handler.clone();
            let conn_limits = conn_limits.clone();
            let req_limits = req_limits.clone();
            let resp_limits = resp_limits.clone();
            let ws_tx = ws_tx.clone();
            let shutdown = shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("nimbus-http-worker-{id}"))
                .stack_size(config.worker_stack_size)
                .spawn(move || {
                    let mut worker = match HttpWorker::new(
                        handler,
                        conn_limits,
                        req_limits,
                        resp_limits,
                        1024,
                        ws_tx,
                    ) {
                        Ok(w) => w,
                        Err(e) => {
                            log::error!("worker {id} failed to start: {e}");
                            return;
                        }
                    };
                    worker.run(&rx, &shutdown);
                })?;
            worker_handles.push(handle);
        }

        let ws_handler = self.ws_handler;
        let ws_shutdown = shutdown.clone();
        let ws_poll_timeout = conn_limits.poll_timeout;
        let ws_handle = thread::Builder::new()
            .name("nimbus-http-ws".to_string())
            .spawn(move || {
                crate::ws::event_loop::run(ws_rx, ws_handler, ws_limits, ws_poll_timeout, &ws_shutdown);
            })?;

        drop(ws_tx);

        Ok(Server {
            listeners,
            conn_limits,
            worker_txs,
            worker_handles,
            ws_handle,
            shutdown,
        })
    }
}

impl<H: Handler> Default for ServerBuilder<H> {
    fn default() -> Self {
        Server::builder()
    }
}

fn bind_reuseport(bind_addr: [u8; 4], port: u16) -> io::Result<StdTcpListener> {
    let addr = std::net::SocketAddr::from((bind_addr, port));

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(not(windows))]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{limits::ReqLimits, StatusCode};

    struct Echo;

    impl Handler for Echo {
        fn handle(&self, _req: &Request, resp: &mut Response) -> Handled {
            resp.status(StatusCode::Ok).body("ok")
        }
    }

    #[test]
    fn builder_requires_handler() {
        // `build()` without `.handler(...)` is a programmer error, not a
        // runtime one — verified via `.handler` being the only way to
        // populate the field the panic message names.
        let builder = Server::builder::<Echo>();
        assert!(builder.handler.is_none());
    }

    #[test]
    fn bind_reuseport_binds_an_ephemeral_port() {
        let listener = bind_reuseport([127, 0, 0, 1], 0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[test]
    fn builder_defaults_apply_when_unset() {
        let builder: ServerBuilder<Echo> = Server::builder();
        assert!(builder.config.is_none());

        let req_limits = builder.req_limits.unwrap_or_default();
        assert_eq!(req_limits.header_count, ReqLimits::default().header_count);
    }
}
