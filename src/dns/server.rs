//! UDP server loops driving a `DnsRelay`

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use derive_more::{Display, Error, From};
use socket2::{Domain, Protocol, Socket, Type};

use crate::dns::buffer::MAX_PACKET_SIZE;
use crate::dns::context::LoopMode;
use crate::dns::relay::{DnsRelay, Outgoing};

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ServerError>;

macro_rules! ignore_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(_) => {}
            Err(e) => {
                log::info!("{}: {:?}", $message, e);
            }
        };
    };
}

/// Pause between rounds of the polling loop when both sockets were idle
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How often the event driven loop wakes up on its own to check for
/// shutdown and run the cache sweep
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Binds the client facing socket with `SO_REUSEADDR` set
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

fn bind_upstream(upstream: SocketAddr) -> std::io::Result<UdpSocket> {
    match upstream {
        SocketAddr::V4(_) => UdpSocket::bind(("0.0.0.0", 0)),
        SocketAddr::V6(_) => UdpSocket::bind(("::", 0)),
    }
}

/// The relay server
///
/// Owns the relay and both of its sockets: the listener that clients send
/// queries to, and an ephemeral socket used to talk to the upstream
/// resolver. Datagrams are handled one at a time on a single thread, so the
/// relay needs no locking.
pub struct RelayServer {
    relay: DnsRelay,
    listener: UdpSocket,
    upstream_socket: UdpSocket,
    upstream: SocketAddr,
    shutdown: Arc<AtomicBool>,
}

impl RelayServer {
    pub fn bind(relay: DnsRelay, listen: SocketAddr, upstream: SocketAddr) -> Result<RelayServer> {
        let listener = bind_listener(listen)?;
        let upstream_socket = bind_upstream(upstream)?;

        log::info!(
            "Listening on {}, forwarding to {}",
            listener.local_addr()?,
            upstream
        );

        Ok(RelayServer {
            relay,
            listener,
            upstream_socket,
            upstream,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Setting the returned flag makes the loop return at its next round
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Runs the server on the current thread until shut down
    pub fn run(self, mode: LoopMode) -> Result<()> {
        match mode {
            LoopMode::Polling => self.run_polling(),
            LoopMode::EventDriven => self.run_event_driven(),
        }
    }

    /// Runs the server on a thread of its own
    pub fn spawn(self, mode: LoopMode) -> std::io::Result<JoinHandle<Result<()>>> {
        Builder::new()
            .name("dnsrelay-server".into())
            .spawn(move || self.run(mode))
    }

    fn run_polling(mut self) -> Result<()> {
        log::info!("Running in polling mode");

        self.listener.set_nonblocking(true)?;
        self.upstream_socket.set_nonblocking(true)?;

        let mut buf = [0u8; MAX_PACKET_SIZE];

        while !self.shutdown.load(Ordering::Acquire) {
            let mut busy = false;

            loop {
                match self.listener.recv_from(&mut buf) {
                    Ok((len, src)) => {
                        busy = true;
                        let out = self.relay.handle_query(&buf[..len], src);
                        self.send(out);
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::info!("Failed to read from client socket: {:?}", e);
                        break;
                    }
                }
            }

            loop {
                match self.upstream_socket.recv_from(&mut buf) {
                    Ok((len, src)) => {
                        busy = true;
                        if src != self.upstream {
                            log::debug!("Ignoring datagram from unexpected source {}", src);
                            continue;
                        }
                        let out = self.relay.handle_upstream(&buf[..len]);
                        self.send(out);
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::info!("Failed to read from upstream socket: {:?}", e);
                        break;
                    }
                }
            }

            self.relay.clean_expired();

            if !busy {
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        log::info!("Server stopped");

        Ok(())
    }

    fn send(&self, out: Option<Outgoing>) {
        match out {
            Some(Outgoing::Client(addr, data)) => {
                ignore_or_report!(
                    self.listener.send_to(&data, addr),
                    "Failed to send response packet"
                );
            }
            Some(Outgoing::Upstream(data)) => {
                ignore_or_report!(
                    self.upstream_socket.send_to(&data, self.upstream),
                    "Failed to forward query"
                );
            }
            None => {}
        }
    }

    fn run_event_driven(self) -> Result<()> {
        log::info!("Running in event driven mode");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(self.event_loop())
    }

    async fn event_loop(self) -> Result<()> {
        let RelayServer {
            mut relay,
            listener,
            upstream_socket,
            upstream,
            shutdown,
        } = self;

        listener.set_nonblocking(true)?;
        upstream_socket.set_nonblocking(true)?;

        let listener = tokio::net::UdpSocket::from_std(listener)?;
        let upstream_socket = tokio::net::UdpSocket::from_std(upstream_socket)?;

        let mut client_buf = [0u8; MAX_PACKET_SIZE];
        let mut upstream_buf = [0u8; MAX_PACKET_SIZE];
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);

        loop {
            let out = tokio::select! {
                res = listener.recv_from(&mut client_buf) => {
                    match res {
                        Ok((len, src)) => relay.handle_query(&client_buf[..len], src),
                        Err(e) => {
                            log::info!("Failed to read from client socket: {:?}", e);
                            None
                        }
                    }
                }
                res = upstream_socket.recv_from(&mut upstream_buf) => {
                    match res {
                        Ok((len, src)) if src == upstream => relay.handle_upstream(&upstream_buf[..len]),
                        Ok((_, src)) => {
                            log::debug!("Ignoring datagram from unexpected source {}", src);
                            None
                        }
                        Err(e) => {
                            log::info!("Failed to read from upstream socket: {:?}", e);
                            None
                        }
                    }
                }
                _ = housekeeping.tick() => {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    relay.clean_expired();
                    None
                }
            };

            match out {
                Some(Outgoing::Client(addr, data)) => {
                    ignore_or_report!(
                        listener.send_to(&data, addr).await,
                        "Failed to send response packet"
                    );
                }
                Some(Outgoing::Upstream(data)) => {
                    ignore_or_report!(
                        upstream_socket.send_to(&data, upstream).await,
                        "Failed to forward query"
                    );
                }
                None => {}
            }
        }

        log::info!("Server stopped");

        Ok(())
    }
}
