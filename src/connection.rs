//! Per-connection state machine.
//!
//! A connection is created on the worker loop chosen by the pool, and every
//! state transition, buffer mutation, and channel operation afterwards runs
//! on that loop. `send` and `shutdown` may be called from any thread; they
//! marshal onto the owner loop.
//!
//! ```text
//! Connecting --connect_established--> Connected
//! Connected --shutdown--> Disconnecting
//! Connected --peer close / error--> Disconnected
//! Disconnecting --output drained--> (write half closed) --peer close--> Disconnected
//! ```

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::metrics;
use crate::socket::Socket;

pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Fired on both the up and the down transition; inspect
/// [`TcpConnection::connected`] to distinguish.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Fired on every successful read with the input buffer and receive time.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, SystemTime) + Send + Sync>;
/// Fired when the output buffer empties after having been non-empty, and for
/// sends fully absorbed by the direct write.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Fired on upward crossings of the configured outbound-buffer mark.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    loop_handle: LoopHandle,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    // Buffers are only touched on the owner loop; the mutexes are
    // uncontended and exist to make the handle shareable.
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    /// Wrap an accepted, already-nonblocking fd. The connection starts in
    /// `Connecting`; the server schedules [`connect_established`] on the
    /// owner loop.
    ///
    /// [`connect_established`]: TcpConnection::connect_established
    pub(crate) fn new(
        loop_handle: LoopHandle,
        name: String,
        sockfd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let socket = Socket::from_raw(sockfd);
        if let Err(err) = socket.set_keep_alive(true) {
            tracing::warn!(name = %name, %err, "failed to enable keepalive");
        }

        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let channel = Arc::new(Channel::new(loop_handle.clone(), sockfd));

            let owner = weak.clone();
            channel.set_read_callback(move |receive_time| {
                if let Some(conn) = owner.upgrade() {
                    conn.handle_read(receive_time);
                }
            });
            let owner = weak.clone();
            channel.set_write_callback(move || {
                if let Some(conn) = owner.upgrade() {
                    conn.handle_write();
                }
            });
            let owner = weak.clone();
            channel.set_close_callback(move || {
                if let Some(conn) = owner.upgrade() {
                    conn.handle_close();
                }
            });
            let owner = weak.clone();
            channel.set_error_callback(move || {
                if let Some(conn) = owner.upgrade() {
                    conn.handle_error();
                }
            });

            TcpConnection {
                loop_handle,
                name,
                state: AtomicU8::new(State::Connecting as u8),
                socket,
                channel,
                local_addr,
                peer_addr,
                input_buffer: Mutex::new(Buffer::new()),
                output_buffer: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                callbacks: Mutex::new(Callbacks::default()),
            }
        });
        tracing::debug!(name = %conn.name, fd = sockfd, "connection created");
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Handle of the loop this connection lives on.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        if let Err(err) = self.socket.set_tcp_nodelay(on) {
            tracing::warn!(name = %self.name, %err, "failed to set TCP_NODELAY");
        }
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
        self.callbacks.lock().high_water_mark = Some(Arc::new(cb));
    }

    pub(crate) fn set_connection_callback(&self, cb: Option<ConnectionCallback>) {
        self.callbacks.lock().connection = cb;
    }

    pub(crate) fn set_message_callback(&self, cb: Option<MessageCallback>) {
        self.callbacks.lock().message = cb;
    }

    pub(crate) fn set_write_complete_callback(&self, cb: Option<WriteCompleteCallback>) {
        self.callbacks.lock().write_complete = cb;
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().close = Some(cb);
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Send bytes to the peer. Safe from any thread: off the owner loop the
    /// data is copied and marshalled, so the caller's buffer need not
    /// outlive the call.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.loop_handle.queue_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if self.state() == State::Disconnected {
            tracing::warn!(name = %self.name, "send on disconnected connection, dropping");
            return;
        }

        let mut output = self.output_buffer.lock();
        let mut nwrote = 0usize;
        let mut fault_error = false;

        // Nothing queued and write-interest off: try the direct write first.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            let n = unsafe {
                libc::write(
                    self.channel.fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n >= 0 {
                nwrote = n as usize;
                metrics::BYTES_SENT.add(nwrote as u64);
                if nwrote == data.len() {
                    if let Some(cb) = self.callbacks.lock().write_complete.clone() {
                        let conn = self.clone();
                        self.loop_handle.queue_in_loop(move || cb(&conn));
                    }
                }
            } else {
                // n < 0 is zero progress, EWOULDBLOCK included: the whole
                // payload goes to the output buffer below.
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => {}
                    Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
                        tracing::error!(name = %self.name, %err, "send failed");
                        fault_error = true;
                    }
                    _ => tracing::error!(name = %self.name, %err, "send failed"),
                }
            }
        }

        let remaining = data.len() - nwrote;
        if !fault_error && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len < mark && old_len + remaining >= mark {
                if let Some(cb) = self.callbacks.lock().high_water_mark.clone() {
                    let conn = self.clone();
                    let queued = old_len + remaining;
                    self.loop_handle.queue_in_loop(move || cb(&conn, queued));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close the write side once the output buffer drains. Only a
    /// `Connected` connection transitions; repeated calls are no-ops.
    pub fn shutdown(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.clone();
            self.loop_handle.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        // Write-interest still on means the output buffer holds data; the
        // half-close happens when handle_write drains it.
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                tracing::error!(name = %self.name, %err, "shutdown(SHUT_WR) failed");
            }
        }
    }

    /// Runs on the owner loop once the server has registered the
    /// connection: ties the channel, enables read-interest, and fires the up
    /// transition.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        assert!(self.loop_handle.is_in_loop_thread());
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        self.channel.tie(self.clone() as Arc<dyn Any + Send + Sync>);
        self.channel.enable_reading();
        metrics::CONNECTIONS_ACTIVE.increment();

        let cb = self.callbacks.lock().connection.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Final pass, scheduled on the owner loop when the server drops its
    /// table entry: disables all interest, removes the channel from the
    /// poller, and releases the callback storage so closures capturing the
    /// connection cannot keep it alive.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        assert!(self.loop_handle.is_in_loop_thread());
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            metrics::CONNECTIONS_ACTIVE.decrement();

            let cb = self.callbacks.lock().connection.clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        self.channel.remove();
        *self.callbacks.lock() = Callbacks::default();
        tracing::debug!(name = %self.name, "connection destroyed");
    }

    fn handle_read(self: &Arc<Self>, receive_time: SystemTime) {
        let mut input = self.input_buffer.lock();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                metrics::BYTES_RECEIVED.add(n as u64);
                let cb = self.callbacks.lock().message.clone();
                match cb {
                    Some(cb) => cb(self, &mut *input, receive_time),
                    // No consumer wired: discard instead of growing forever.
                    None => input.retrieve_all(),
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                drop(input);
                tracing::error!(name = %self.name, %err, "read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.is_writing() {
            tracing::trace!(name = %self.name, "write readiness on idle channel, ignoring");
            return;
        }
        let mut output = self.output_buffer.lock();
        match output.write_fd(self.channel.fd()) {
            Ok(n) if n > 0 => {
                metrics::BYTES_SENT.add(n as u64);
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    if let Some(cb) = self.callbacks.lock().write_complete.clone() {
                        let conn = self.clone();
                        self.loop_handle.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == State::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop();
                    }
                }
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => tracing::error!(name = %self.name, %err, "write failed"),
        }
    }

    fn handle_close(self: &Arc<Self>) {
        tracing::debug!(name = %self.name, state = ?self.state(), "connection closing");
        let was_active = matches!(self.state(), State::Connected | State::Disconnecting);
        self.set_state(State::Disconnected);
        self.channel.disable_all();
        if was_active {
            metrics::CONNECTIONS_ACTIVE.decrement();
        }

        let (connection_cb, close_cb) = {
            let cbs = self.callbacks.lock();
            (cbs.connection.clone(), cbs.close.clone())
        };
        // Hold a strong reference across both callbacks; the close callback
        // (the server's removal path) may drop the last table entry.
        let guard = self.clone();
        if let Some(cb) = connection_cb {
            cb(&guard);
        }
        if let Some(cb) = close_cb {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        let mut optval: libc::c_int = 0;
        let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let err = if unsafe {
            libc::getsockopt(
                self.channel.fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut optval as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        } < 0
        {
            io::Error::last_os_error()
        } else {
            io::Error::from_raw_os_error(optval)
        };
        tracing::error!(name = %self.name, %err, "connection error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_thread::EventLoopThread;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::time::Duration;

    /// A tiny non-blocking pipe whose write end stands in for a socket the
    /// peer refuses to drain.
    fn nonblocking_pipe() -> (OwnedFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        unsafe { libc::fcntl(fds[1], libc::F_SETPIPE_SZ, 4096) };
        (unsafe { OwnedFd::from_raw_fd(fds[0]) }, fds[1])
    }

    /// Pack the pipe until even a single byte returns EAGAIN, so the next
    /// direct write makes zero progress.
    fn fill_pipe(fd: RawFd) {
        let junk = [0u8; 1024];
        loop {
            let n = unsafe { libc::write(fd, junk.as_ptr() as *const libc::c_void, junk.len()) };
            if n < 0 {
                break;
            }
        }
        let byte = [0u8; 1];
        loop {
            let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
            if n < 0 {
                break;
            }
        }
    }

    /// Wait until everything queued so far has run on the loop.
    fn sync_with_loop(handle: &LoopHandle) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        handle.run_in_loop(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    fn test_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn destroy(handle: &LoopHandle, conn: &TcpConnectionPtr) {
        let conn = conn.clone();
        handle.run_in_loop(move || conn.connect_destroyed());
    }

    #[test]
    fn high_water_mark_fires_on_upward_crossing_only() {
        let mut lt = EventLoopThread::new(None, "hwm-test");
        let handle = lt.start_loop();
        let (read_end, write_fd) = nonblocking_pipe();
        fill_pipe(write_fd);

        let conn = TcpConnection::new(
            handle.clone(),
            "hwm#1".to_string(),
            write_fd,
            test_addr(),
            test_addr(),
        );
        let (tx, rx) = crossbeam_channel::unbounded();
        conn.set_high_water_mark_callback(move |_conn, queued| tx.send(queued).unwrap(), 1024);

        let c = conn.clone();
        handle.run_in_loop(move || c.connect_established());
        sync_with_loop(&handle);

        // 512 queued: below the mark, no callback.
        conn.send(&[b'a'; 512]);
        sync_with_loop(&handle);
        assert!(rx.try_recv().is_err());

        // 512 -> 1112 crosses 1024 upward: exactly one callback with the
        // total queued at the crossing.
        conn.send(&[b'b'; 600]);
        sync_with_loop(&handle);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1112);
        assert!(rx.try_recv().is_err());

        // Already above the mark: no further callback.
        conn.send(&[b'c'; 200]);
        sync_with_loop(&handle);
        assert!(rx.try_recv().is_err());

        destroy(&handle, &conn);
        sync_with_loop(&handle);
        drop(read_end);
    }

    #[test]
    fn write_complete_fires_once_per_drain_cycle() {
        let mut lt = EventLoopThread::new(None, "wc-test");
        let handle = lt.start_loop();
        let (read_end, write_fd) = nonblocking_pipe();
        fill_pipe(write_fd);

        let conn = TcpConnection::new(
            handle.clone(),
            "wc#1".to_string(),
            write_fd,
            test_addr(),
            test_addr(),
        );
        let (tx, rx) = crossbeam_channel::unbounded();
        let on_complete: WriteCompleteCallback = Arc::new(move |_conn: &TcpConnectionPtr| {
            tx.send(()).unwrap();
        });
        conn.set_write_complete_callback(Some(on_complete));

        let c = conn.clone();
        handle.run_in_loop(move || c.connect_established());
        sync_with_loop(&handle);

        // Blocked behind the full pipe: the cycle is open, no callback yet.
        conn.send(&[b'x'; 2000]);
        sync_with_loop(&handle);
        assert!(rx.try_recv().is_err());

        // Drain the read side until the loop flushes the output buffer.
        let mut scratch = [0u8; 4096];
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if rx.try_recv().is_ok() {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "write complete never fired"
            );
            let n = unsafe {
                libc::read(
                    read_end.as_raw_fd(),
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                )
            };
            if n < 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        // One drain cycle, one callback.
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        destroy(&handle, &conn);
        sync_with_loop(&handle);
        drop(read_end);
    }

    #[test]
    fn send_after_disconnect_is_dropped() {
        let mut lt = EventLoopThread::new(None, "drop-test");
        let handle = lt.start_loop();
        let (read_end, write_fd) = nonblocking_pipe();

        let conn = TcpConnection::new(
            handle.clone(),
            "drop#1".to_string(),
            write_fd,
            test_addr(),
            test_addr(),
        );
        let c = conn.clone();
        handle.run_in_loop(move || c.connect_established());
        destroy(&handle, &conn);
        sync_with_loop(&handle);

        assert!(conn.disconnected());
        // State gate: nothing is queued and nothing panics.
        conn.send(b"too late");
        sync_with_loop(&handle);
        drop(read_end);
    }
}
