//! Public server façade: owns the acceptor (on the base loop), the worker
//! pool, and the name → connection table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::loop_thread::{EventLoopThreadPool, ThreadInitCallback};
use crate::socket;

/// Whether the listener requests `SO_REUSEPORT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerOption {
    NoReusePort,
    ReusePort,
}

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<ThreadInitCallback>,
}

struct ServerInner {
    base_loop: LoopHandle,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    // Mutated only on the base loop.
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    next_conn_id: AtomicU64,
    started: AtomicU32,
    callbacks: Mutex<ServerCallbacks>,
}

/// A TCP server bound to one listening address.
///
/// Construct it on the thread driving the base loop, configure callbacks and
/// the worker count, then call [`start`](TcpServer::start) and run the base
/// loop. Dropping the server schedules a final destroy pass for every open
/// connection and tears the worker pool down.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn new(
        base_loop: &EventLoop,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        option: ServerOption,
    ) -> Result<TcpServer, Error> {
        let base_handle = base_loop.handle();
        let name = name.into();
        let acceptor = Acceptor::new(
            base_handle.clone(),
            listen_addr,
            option == ServerOption::ReusePort,
        )?;

        let inner = Arc::new(ServerInner {
            base_loop: base_handle.clone(),
            ip_port: listen_addr.to_string(),
            pool: Mutex::new(EventLoopThreadPool::new(base_handle, name.clone())),
            name,
            acceptor,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicU32::new(0),
            callbacks: Mutex::new(ServerCallbacks::default()),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(move |sockfd, peer_addr| {
                match weak.upgrade() {
                    Some(inner) => ServerInner::new_connection(&inner, sockfd, peer_addr),
                    None => unsafe {
                        libc::close(sockfd);
                    },
                }
            });

        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    /// The bound listen address, with the kernel-assigned port when the
    /// server was created with port 0.
    pub fn listen_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.acceptor.local_addr()
    }

    /// Number of worker loops; 0 keeps everything on the base loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, cb: impl Fn(&EventLoop) + Send + Sync + 'static) {
        self.inner.callbacks.lock().thread_init = Some(Arc::new(cb));
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static) {
        self.inner.callbacks.lock().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, &mut crate::buffer::Buffer, std::time::SystemTime)
            + Send
            + Sync
            + 'static,
    ) {
        self.inner.callbacks.lock().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    /// Start the worker pool and schedule the listen call on the base loop.
    /// Idempotent: only the first call does anything.
    pub fn start(&self) {
        if self.inner.started.fetch_add(1, Ordering::AcqRel) == 0 {
            let init_cb = self.inner.callbacks.lock().thread_init.clone();
            self.inner.pool.lock().start(init_cb);

            let acceptor = self.inner.acceptor.clone();
            self.inner.base_loop.run_in_loop(move || acceptor.listen());
            tracing::info!(name = %self.inner.name, addr = %self.inner.ip_port, "server started");
        }
    }
}

impl ServerInner {
    /// Runs on the base loop whenever the acceptor hands over a connection.
    fn new_connection(inner: &Arc<ServerInner>, sockfd: RawFd, peer_addr: SocketAddr) {
        let io_loop = inner.pool.lock().get_next_loop();
        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", inner.name, inner.ip_port, conn_id);
        tracing::info!(
            server = %inner.name,
            conn = %conn_name,
            peer = %peer_addr,
            "new connection"
        );

        let local_addr = match socket::local_addr_of(sockfd) {
            Ok(addr) => addr,
            Err(err) => {
                tracing::error!(%err, "getsockname failed");
                SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
            }
        };

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            sockfd,
            local_addr,
            peer_addr,
        );
        {
            let cbs = inner.callbacks.lock();
            conn.set_connection_callback(cbs.connection.clone());
            conn.set_message_callback(cbs.message.clone());
            conn.set_write_complete_callback(cbs.write_complete.clone());
        }
        let weak = Arc::downgrade(inner);
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::remove_connection(&inner, conn.clone());
            }
        }));

        inner.connections.lock().insert(conn_name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Entered from any worker loop via the connection's close callback;
    /// routes to the base loop, which owns the table.
    fn remove_connection(inner: &Arc<ServerInner>, conn: TcpConnectionPtr) {
        let inner = inner.clone();
        let base_loop = inner.base_loop.clone();
        base_loop.run_in_loop(move || ServerInner::remove_connection_in_loop(&inner, &conn));
    }

    fn remove_connection_in_loop(inner: &Arc<ServerInner>, conn: &TcpConnectionPtr) {
        tracing::info!(server = %inner.name, conn = %conn.name(), "removing connection");
        inner.connections.lock().remove(conn.name());
        // queue, not run: the worker loop must finish its current dispatch
        // pass before the channel is pulled out from under it.
        let conn = conn.clone();
        let worker = conn.loop_handle().clone();
        worker.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        tracing::info!(name = %self.name, "server shutting down");
        let remaining: Vec<TcpConnectionPtr> =
            self.connections.get_mut().drain().map(|(_, conn)| conn).collect();
        for conn in remaining {
            let worker = conn.loop_handle().clone();
            worker.run_in_loop(move || conn.connect_destroyed());
        }
        // Dropping the pool afterwards quits and joins every worker, so the
        // destroy passes above run before the loops exit.
    }
}
