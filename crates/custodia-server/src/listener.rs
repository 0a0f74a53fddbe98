//! Dual-stack TLS listener.
//!
//! Every bound socket gets its own accept loop. Accepted connections go
//! through the TLS handshake before any byte is read as protocol, then run as
//! an independent [`Session`] task.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use custodia_shared::protocol::Reply;

use crate::config::ServerConfig;
use crate::framing::Connection;
use crate::session::{ServerContext, Session};

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("cannot resolve bind host '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("bind host '{0}' resolved to no address")]
    NoAddress(String),

    #[error("could not bind {host}:{port} ({})", describe_attempts(.attempts))]
    Unavailable {
        host: String,
        port: u16,
        attempts: Vec<(SocketAddr, io::Error)>,
    },
}

fn describe_attempts(attempts: &[(SocketAddr, io::Error)]) -> String {
    attempts
        .iter()
        .map(|(addr, e)| format!("{addr}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Bind targets
// ---------------------------------------------------------------------------

/// Socket addresses to bind for `host`. Wildcards and loopback aliases expand
/// to one address per family.
pub fn bind_targets(host: &str, port: u16) -> Result<Vec<SocketAddr>, BindError> {
    let host = host.trim();
    let unbracketed = host.trim_start_matches('[').trim_end_matches(']');

    let ips: Vec<IpAddr> = match unbracketed {
        "" | "*" | "0.0.0.0" | "::" => vec![
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        ],
        "localhost" | "127.0.0.1" | "::1" => vec![
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ],
        other => match other.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => {
                let mut resolved = Vec::new();
                let addrs = (other, port)
                    .to_socket_addrs()
                    .map_err(|source| BindError::Resolve {
                        host: other.to_string(),
                        source,
                    })?;
                for addr in addrs {
                    if !resolved.contains(&addr.ip()) {
                        resolved.push(addr.ip());
                    }
                }
                resolved
            }
        },
    };

    if ips.is_empty() {
        return Err(BindError::NoAddress(host.to_string()));
    }
    Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
}

fn bind_socket(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        // Keep the families on separate sockets.
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

// ---------------------------------------------------------------------------
// Connect-notice cache
// ---------------------------------------------------------------------------

/// Bounded set of client IPs already announced at `info` level. The oldest
/// entry is evicted once `capacity` is reached.
pub struct SeenPeers {
    capacity: usize,
    inner: Mutex<(HashSet<IpAddr>, VecDeque<IpAddr>)>,
}

impl SeenPeers {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Record `ip`; `true` the first time it is seen (or after eviction).
    pub fn observe(&self, ip: IpAddr) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let (set, order) = &mut *guard;
        if set.contains(&ip) {
            return false;
        }
        if order.len() >= self.capacity {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
        set.insert(ip);
        order.push_back(ip);
        true
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.0.contains(ip)
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub handshake_timeout: Duration,
    /// 0 = unlimited.
    pub max_sessions: usize,
    pub seen_peers_capacity: usize,
}

impl ListenerOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            max_sessions: config.max_sessions,
            seen_peers_capacity: config.seen_peers_capacity,
        }
    }
}

struct Shared {
    acceptor: TlsAcceptor,
    ctx: Arc<ServerContext>,
    handshake_timeout: Duration,
    permits: Option<Arc<Semaphore>>,
    seen: Arc<SeenPeers>,
}

/// Running listener. Dropping it without [`ListenerHandle::shutdown`] also
/// stops the accept loops; sessions already running finish on their own.
pub struct ListenerHandle {
    addrs: Vec<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    seen: Arc<SeenPeers>,
}

impl ListenerHandle {
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn seen_peers(&self) -> &SeenPeers {
        &self.seen
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for every accept loop to stop.
    pub async fn join(self) {
        join_all(self.tasks).await;
    }
}

/// Bind `host:port` and start accepting. Must be called inside a Tokio
/// runtime. Fails only when no address could be bound at all.
pub fn start(
    host: &str,
    port: u16,
    acceptor: TlsAcceptor,
    ctx: Arc<ServerContext>,
    opts: ListenerOptions,
) -> Result<ListenerHandle, BindError> {
    let targets = bind_targets(host, port)?;

    let mut listeners = Vec::new();
    let mut attempts = Vec::new();
    let mut port = port;
    for target in targets {
        let addr = SocketAddr::new(target.ip(), port);
        let bound = bind_socket(addr).and_then(TcpListener::from_std);
        match bound {
            Ok(listener) => {
                let local = listener.local_addr().unwrap_or(addr);
                // An ephemeral port is shared by the remaining families.
                port = local.port();
                info!(addr = %local, "Listening");
                listeners.push((local, listener));
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "Could not bind address");
                attempts.push((addr, e));
            }
        }
    }

    if listeners.is_empty() {
        return Err(BindError::Unavailable {
            host: host.to_string(),
            port,
            attempts,
        });
    }

    let seen = Arc::new(SeenPeers::new(opts.seen_peers_capacity));
    let shared = Arc::new(Shared {
        acceptor,
        ctx,
        handshake_timeout: opts.handshake_timeout,
        permits: (opts.max_sessions > 0).then(|| Arc::new(Semaphore::new(opts.max_sessions))),
        seen: seen.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut addrs = Vec::with_capacity(listeners.len());
    let mut tasks = Vec::with_capacity(listeners.len());
    for (addr, listener) in listeners {
        addrs.push(addr);
        tasks.push(tokio::spawn(accept_loop(
            listener,
            addr,
            shared.clone(),
            shutdown_rx.clone(),
        )));
    }

    Ok(ListenerHandle {
        addrs,
        shutdown_tx,
        tasks,
        seen,
    })
}

async fn accept_loop(
    listener: TcpListener,
    local: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, shared.clone()));
                }
                Err(e) => {
                    warn!(addr = %local, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    info!(addr = %local, "Listener stopped");
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    if shared.seen.observe(peer.ip()) {
        info!(peer = %peer, "New client connected");
    } else {
        debug!(peer = %peer, "Client connected");
    }
    let _ = stream.set_nodelay(true);

    let tls = match tokio::time::timeout(shared.handshake_timeout, shared.acceptor.accept(stream))
        .await
    {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, timeout = ?shared.handshake_timeout, "TLS handshake timed out");
            return;
        }
    };

    let _permit = match &shared.permits {
        None => None,
        Some(permits) => match permits.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!(peer = %peer, "Session limit reached, refusing connection");
                let mut conn = Connection::new(tls, shared.handshake_timeout);
                let _ = conn.send_reply(&Reply::error("servidor ocupado")).await;
                conn.shutdown().await;
                return;
            }
        },
    };

    Session::new(tls, shared.ctx.clone(), peer.to_string())
        .run()
        .await;
    debug!(peer = %peer, "Connection closed");
}
