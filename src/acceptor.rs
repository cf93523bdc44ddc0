//! Listening socket bound to the base loop.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::metrics;
use crate::socket;

const LISTEN_BACKLOG: libc::c_int = 1024;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr) + Send>;

/// Owns the listening socket and its channel on the base loop. Raises the
/// new-connection callback with the accepted fd and peer address; the
/// callback takes ownership of the fd.
pub(crate) struct Acceptor {
    loop_handle: LoopHandle,
    listen_socket: Arc<socket2::Socket>,
    channel: Arc<Channel>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
    /// Reserved placeholder fd, sacrificed to drain the queue when accept
    /// hits the process fd limit.
    idle_fd: Mutex<Option<OwnedFd>>,
}

fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::open(
            c"/dev/null".as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl Acceptor {
    pub(crate) fn new(
        loop_handle: LoopHandle,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> Result<Arc<Acceptor>, Error> {
        let listen_socket = socket::create_listener(listen_addr, reuse_port)
            .map_err(|source| Error::Bind { addr: listen_addr, source })?;
        let idle_fd = open_idle_fd()?;
        let channel = Arc::new(Channel::new(loop_handle.clone(), listen_socket.as_raw_fd()));

        let acceptor = Arc::new(Acceptor {
            loop_handle,
            listen_socket: Arc::new(listen_socket),
            channel,
            new_connection_callback: Mutex::new(None),
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(Some(idle_fd)),
        });

        let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_receive_time| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(
        &self,
        cb: impl FnMut(RawFd, SocketAddr) + Send + 'static,
    ) {
        *self.new_connection_callback.lock() = Some(Box::new(cb));
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// The address actually bound, with the kernel-assigned port when the
    /// caller asked for port 0.
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        socket::local_addr_of(self.listen_socket.as_raw_fd())
    }

    /// Start listening and enable read-interest. Runs on the base loop.
    pub(crate) fn listen(self: &Arc<Self>) {
        assert!(self.loop_handle.is_in_loop_thread());
        self.listening.store(true, Ordering::Release);
        if let Err(err) = self.listen_socket.listen(LISTEN_BACKLOG) {
            tracing::error!(%err, "listen failed");
            panic!("listen failed: {err}");
        }
        self.channel.enable_reading();
        tracing::info!(fd = self.channel.fd(), "listening");
    }

    fn handle_read(self: &Arc<Self>) {
        debug_assert!(self.listening());
        match socket::accept(self.listen_socket.as_raw_fd()) {
            Ok((fd, peer_addr)) => {
                metrics::CONNECTIONS_ACCEPTED.increment();
                let mut cb = self.new_connection_callback.lock();
                if let Some(cb) = cb.as_mut() {
                    cb(fd, peer_addr);
                } else {
                    unsafe { libc::close(fd) };
                }
            }
            Err(err) => match err.raw_os_error() {
                Some(libc::EAGAIN) => {}
                Some(libc::EMFILE) => {
                    tracing::error!("accept: process out of file descriptors");
                    self.recover_from_emfile();
                }
                _ => tracing::error!(%err, "accept failed"),
            },
        }
    }

    /// Close the placeholder, accept-and-drop the pending connection so the
    /// listener does not spin on a permanently-ready queue, then re-reserve
    /// the placeholder.
    fn recover_from_emfile(&self) {
        let mut idle = self.idle_fd.lock();
        let Some(placeholder) = idle.take() else {
            return;
        };
        drop(placeholder);
        if let Ok((fd, peer_addr)) = socket::accept(self.listen_socket.as_raw_fd()) {
            tracing::warn!(%peer_addr, "dropping connection: fd limit reached");
            unsafe { libc::close(fd) };
        }
        match open_idle_fd() {
            Ok(fd) => *idle = Some(fd),
            Err(err) => tracing::error!(%err, "failed to re-reserve idle fd"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // The channel and listening fd must be dismantled on the base loop;
        // the task keeps the socket alive until the channel is gone.
        let channel = self.channel.clone();
        let listen_socket = self.listen_socket.clone();
        self.loop_handle.run_in_loop(move || {
            channel.disable_all();
            channel.remove();
            drop(listen_socket);
        });
    }
}
