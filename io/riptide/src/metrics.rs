//! Library metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently established connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "bytes_received", description = "Total bytes read from sockets")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to sockets")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "accept_errors",
    description = "Accept failures, including EMFILE events"
)]
pub static ACCEPT_ERRORS: Counter = Counter::new();

#[metric(
    name = "connect_retries",
    description = "Client connect attempts rescheduled with back-off"
)]
pub static CONNECT_RETRIES: Counter = Counter::new();

#[metric(name = "timers_fired", description = "Timer callbacks executed")]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(
    name = "loop_wakeups",
    description = "Cross-thread eventfd wakeups delivered to loops"
)]
pub static LOOP_WAKEUPS: Counter = Counter::new();
