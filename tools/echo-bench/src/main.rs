//! Echo throughput benchmark.
//!
//! Serve mode runs a riptide echo server; bench mode opens a set of
//! ping-pong connections against it and reports round trips per second.
//!
//! ```text
//! echo-bench serve --addr 127.0.0.1:7878 --threads 4
//! echo-bench run   --addr 127.0.0.1:7878 --connections 50 --size 128 --seconds 10
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use riptide::{EventLoop, ServerConfig, TcpClient, TcpServer};

#[derive(Parser)]
#[command(name = "echo-bench", about = "Echo throughput benchmark for riptide")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the echo server.
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1:7878")]
        addr: SocketAddr,
        /// I/O loop threads.
        #[arg(long, default_value_t = 4)]
        threads: usize,
    },
    /// Run the load generator.
    Run {
        /// Server address.
        #[arg(long, default_value = "127.0.0.1:7878")]
        addr: SocketAddr,
        /// Concurrent ping-pong connections.
        #[arg(long, default_value_t = 10)]
        connections: usize,
        /// Payload size in bytes.
        #[arg(long, default_value_t = 128)]
        size: usize,
        /// Benchmark duration in seconds.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn main() {
    init_logging();
    match Cli::parse().command {
        Command::Serve { addr, threads } => serve(addr, threads),
        Command::Run {
            addr,
            connections,
            size,
            seconds,
        } => run(addr, connections, size, seconds),
    }
}

fn serve(addr: SocketAddr, threads: usize) {
    let event_loop = EventLoop::new().expect("failed to create event loop");
    let config = ServerConfig {
        threads,
        ..Default::default()
    };
    let server = TcpServer::new(event_loop.handle().clone(), addr, "echo-bench", config)
        .expect("failed to bind");
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    }));
    server.start();
    tracing::info!("serving echo on {}", server.local_addr());
    event_loop.run();
}

fn run(addr: SocketAddr, connections: usize, size: usize, seconds: u64) {
    let event_loop = EventLoop::new().expect("failed to create event loop");
    let loop_handle = event_loop.handle().clone();

    let round_trips = Arc::new(AtomicU64::new(0));
    let connected = Arc::new(AtomicU64::new(0));
    let payload = Arc::new(vec![b'x'; size]);

    let mut clients = Vec::with_capacity(connections);
    for i in 0..connections {
        let client = TcpClient::new(loop_handle.clone(), addr, &format!("bench-{i}"));

        client.set_connection_callback(Arc::new({
            let payload = payload.clone();
            let connected = connected.clone();
            move |conn| {
                if conn.is_connected() {
                    connected.fetch_add(1, Ordering::Relaxed);
                    conn.send(&payload);
                } else {
                    connected.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }));
        client.set_message_callback(Arc::new({
            let round_trips = round_trips.clone();
            let size = size;
            move |conn, buf, _when| {
                // One round trip = one full payload echoed back.
                while buf.readable_bytes() >= size {
                    let data = buf.retrieve_as_bytes(size);
                    round_trips.fetch_add(1, Ordering::Relaxed);
                    conn.send(&data);
                }
            }
        }));

        client.connect();
        clients.push(client);
    }

    let started = Instant::now();
    {
        let loop_handle = loop_handle.clone();
        event_loop
            .handle()
            .run_after(Duration::from_secs(seconds), move || loop_handle.quit());
    }
    event_loop.run();

    let elapsed = started.elapsed();
    let trips = round_trips.load(Ordering::Relaxed);
    let rate = trips as f64 / elapsed.as_secs_f64();
    let throughput = rate * size as f64 / (1024.0 * 1024.0);
    println!(
        "{connections} connections x {size} B: {trips} round trips in {:.2?} ({rate:.0}/s, {throughput:.2} MiB/s each way)",
        elapsed
    );

    drop(clients);
}
