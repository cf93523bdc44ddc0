//! Outbound buffering under a slow peer: high-water-mark crossings and
//! write-complete cycles over real sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use multio::{EventLoop, LoopHandle, ServerOption, TcpServer};

/// Large enough that a single non-blocking write cannot be fully absorbed
/// by the kernel send buffer.
const PAYLOAD_LEN: usize = 16 * 1024 * 1024;
const HIGH_WATER_MARK: usize = 1024 * 1024;

fn payload() -> Vec<u8> {
    (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect()
}

enum Event {
    HighWater(usize),
    WriteComplete,
}

struct BlastServer {
    base: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl Drop for BlastServer {
    fn drop(&mut self) {
        self.base.quit();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// A server that answers the first message with one enormous send.
fn start_blast_server(events: crossbeam_channel::Sender<Event>) -> BlastServer {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let (ready_tx, ready_rx) = unbounded();
    let thread = thread::spawn(move || {
        let base_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            &base_loop,
            "127.0.0.1:0".parse().unwrap(),
            "blast",
            ServerOption::NoReusePort,
        )
        .unwrap();
        server.set_thread_num(1);

        let hwm_events = events.clone();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                let hwm_events = hwm_events.clone();
                conn.set_high_water_mark_callback(
                    move |_conn, queued| {
                        let _ = hwm_events.send(Event::HighWater(queued));
                    },
                    HIGH_WATER_MARK,
                );
            }
        });
        server.set_message_callback(move |conn, buf, _receive_time| {
            buf.retrieve_all();
            conn.send(&payload());
        });
        let wc_events = events.clone();
        server.set_write_complete_callback(move |_conn| {
            let _ = wc_events.send(Event::WriteComplete);
        });

        server.start();
        ready_tx
            .send((base_loop.handle(), server.listen_addr().unwrap()))
            .unwrap();
        base_loop.run();
        drop(server);
    });
    let (base, addr) = ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    BlastServer {
        base,
        thread: Some(thread),
        addr,
    }
}

fn drain_events(events: &Receiver<Event>) -> (Vec<usize>, usize) {
    let mut high_water = Vec::new();
    let mut write_completes = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::HighWater(n) => high_water.push(n),
            Event::WriteComplete => write_completes += 1,
        }
    }
    (high_water, write_completes)
}

#[test]
fn slow_reader_crosses_mark_once_then_drains() {
    let (tx, events) = unbounded();
    let server = start_blast_server(tx);

    let mut client = TcpStream::connect(server.addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client.write_all(b"go").unwrap();

    // Leave the payload unread long enough for the server's direct write to
    // stall and the remainder to pile into the output buffer.
    let crossing = events
        .recv_timeout(Duration::from_secs(10))
        .expect("high-water mark never crossed");
    let queued = match crossing {
        Event::HighWater(queued) => queued,
        Event::WriteComplete => panic!("write completed before the mark was crossed"),
    };
    assert!(
        queued >= HIGH_WATER_MARK,
        "crossing reported below the mark: {queued}"
    );

    // Now read everything back and verify nothing was reordered or lost.
    let expected = payload();
    let mut received = Vec::with_capacity(PAYLOAD_LEN);
    let mut chunk = vec![0u8; 256 * 1024];
    while received.len() < PAYLOAD_LEN {
        let n = client.read(&mut chunk).expect("payload read stalled");
        assert!(n > 0, "premature EOF after {} bytes", received.len());
        received.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(received.len(), PAYLOAD_LEN);
    assert_eq!(received, expected);

    // The buffer drained exactly once, so one write-complete and no
    // downward-crossing callback.
    thread::sleep(Duration::from_millis(200));
    let (more_high_water, write_completes) = drain_events(&events);
    assert!(
        more_high_water.is_empty(),
        "high-water mark fired on a downward crossing"
    );
    assert_eq!(write_completes, 1, "one drain cycle, one write-complete");
}

#[test]
fn fast_reader_sees_inline_write_complete() {
    let (tx, events) = unbounded();
    let server = start_blast_server(tx);

    let mut client = TcpStream::connect(server.addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client.write_all(b"go").unwrap();

    let mut received = 0usize;
    let mut chunk = vec![0u8; 256 * 1024];
    while received < PAYLOAD_LEN {
        let n = client.read(&mut chunk).expect("payload read stalled");
        assert!(n > 0);
        received += n;
    }

    // Whether the payload went out inline or through the output buffer, the
    // completion callback fires exactly once.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let mut write_completes = 0;
    while std::time::Instant::now() < deadline && write_completes == 0 {
        if let Ok(Event::WriteComplete) = events.recv_timeout(Duration::from_millis(100)) {
            write_completes += 1;
        }
    }
    assert_eq!(write_completes, 1);
}
