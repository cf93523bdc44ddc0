//! Runtime metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total connections accepted by the listener"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Currently established connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "bytes_received", description = "Total bytes read off sockets")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to sockets")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "loop_wakeups",
    description = "Cross-thread wakeups delivered to event loops"
)]
pub static LOOP_WAKEUPS: Counter = Counter::new();
