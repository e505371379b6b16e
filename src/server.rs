//! Listener and per-connection dispatch.
//!
//! A [`Connector`] owns the listening socket, a [`ThreadPool`] and the shared
//! [`ConnectorContext`]. Each accepted connection becomes one job on the pool, which runs the
//! configured processor until the connection ends. A shutdown packet, or a call to
//! [`ShutdownHandle::shutdown`], stops the accept loop. The connector then stops reading from
//! every open connection, so each one ends once its response in progress is written, and
//! [`Connector::listen`] returns after the workers are done.
use std::{
    collections::HashMap,
    fs, io,
    net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::{ConfigError, ConnectorConfig, ListenAddress, ProtocolKind},
    exchange::{Adapter, ExchangePair},
    http11::Http11Processor,
    pool::ObjectPool,
    protocol::{AjpProcessor, PacketCodec, ReceiveOutcome, Transport, error::ConnectorError},
    thread::ThreadPool,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("[config] {0}")]
    Config(#[from] ConfigError),

    #[error("[io] {0}")]
    Io(#[from] io::Error),
}

/// State shared by every connection of one connector.
pub struct ConnectorContext {
    config: ConnectorConfig,
    codec: PacketCodec,
    exchanges: Arc<ObjectPool<ExchangePair>>,
    buffers: Arc<ObjectPool<Vec<u8>>>,
    adapter: Arc<dyn Adapter>,
}

impl ConnectorContext {
    pub fn new(config: ConnectorConfig, adapter: Arc<dyn Adapter>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            codec: PacketCodec::new(config.packet_size),
            exchanges: Arc::new(ObjectPool::new(config.max_pooled_exchanges)),
            buffers: Arc::new(ObjectPool::new(config.max_pooled_buffers)),
            config,
            adapter,
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn exchanges(&self) -> &Arc<ObjectPool<ExchangePair>> {
        &self.exchanges
    }

    pub fn buffers(&self) -> &Arc<ObjectPool<Vec<u8>>> {
        &self.buffers
    }

    /// Runs the configured protocol on one connection until it ends.
    pub fn serve_connection<T: Transport>(&self, stream: T) -> Result<ReceiveOutcome, ConnectorError> {
        let mut buffer = self.buffers.lease();
        let packet_buffer = std::mem::take(&mut *buffer);
        let adapter = &*self.adapter;

        let (result, packet_buffer) = match self.config.protocol {
            ProtocolKind::Ajp13 => {
                let mut processor = AjpProcessor::with_buffer(stream, self.codec, packet_buffer)
                    .with_required_secret(self.config.required_secret.clone())
                    .with_trust_front_end_auth(self.config.trust_front_end_auth);
                let result = processor.process(adapter, &self.exchanges);
                (result, processor.into_parts().1)
            }
            ProtocolKind::Http11 => {
                let mut processor = Http11Processor::with_buffer(stream, packet_buffer)
                    .with_max_header_size(self.config.max_header_size)
                    .with_server_header(self.config.server_header.clone());
                let result = processor.process(adapter, &self.exchanges);
                (result, processor.into_parts().1)
            }
        };
        *buffer = packet_buffer;
        result
    }
}

/// Stops a running [`Connector`] from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    target: ListenAddress,
}

impl ShutdownHandle {
    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Flags the accept loop to stop and wakes it with a throwaway connection.
    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down listener at {}", self.target);
        let woken = match &self.target {
            ListenAddress::Tcp(addr) => TcpStream::connect(addr).map(drop),
            ListenAddress::Unix(path) => UnixStream::connect(path).map(drop),
        };
        if let Err(e) = woken {
            debug!("could not wake the listener: {e}");
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Streams the listener can hand to a processor.
trait Accepted: Transport + 'static {
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Second handle on the same socket.
    fn duplicate(&self) -> io::Result<Self>
    where
        Self: Sized;

    /// Makes pending and future reads see end of stream. Writes keep working.
    fn stop_reading(&self) -> io::Result<()>;
}

impl Accepted for TcpStream {
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn duplicate(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn stop_reading(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Read)
    }
}

impl Accepted for UnixStream {
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn duplicate(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn stop_reading(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Read)
    }
}

/// Handles on the connections currently being served, keyed by registration order.
#[derive(Default)]
struct OpenConnections {
    next_id: AtomicU64,
    streams: Mutex<HashMap<u64, Box<dyn Accepted>>>,
}

impl OpenConnections {
    fn register<S: Accepted>(&self, stream: &S) -> Option<u64> {
        match stream.duplicate() {
            Ok(handle) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.streams
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id, Box::new(handle));
                Some(id)
            }
            Err(e) => {
                warn!("connection cannot be closed on shutdown: {e}");
                None
            }
        }
    }

    fn remove(&self, id: u64) {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wakes every worker blocked waiting for the next request.
    fn stop_reading_all(&self) {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if !streams.is_empty() {
            info!("closing {} open connection(s)", streams.len());
        }
        for stream in streams.values() {
            if let Err(e) = stream.stop_reading() {
                debug!("could not stop reading from a connection: {e}");
            }
        }
    }
}

pub struct Connector {
    context: Arc<ConnectorContext>,
    listener: Listener,
    shutdown: ShutdownHandle,
    connections: Arc<OpenConnections>,
    pool: ThreadPool,
}

impl Connector {
    /// Validates `config` and binds the listening socket.
    pub fn bind(config: ConnectorConfig, adapter: Arc<dyn Adapter>) -> Result<Self, ServerError> {
        let context = ConnectorContext::new(config, adapter)?;
        let (listener, target) = match &context.config.listen {
            ListenAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr)?;
                let target = wake_address(listener.local_addr()?);
                (Listener::Tcp(listener), ListenAddress::Tcp(target))
            }
            ListenAddress::Unix(path) => {
                let listener = UnixListener::bind(path)?;
                (Listener::Unix(listener), ListenAddress::Unix(path.clone()))
            }
        };

        Ok(Self {
            pool: ThreadPool::new(context.config.max_threads),
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                target,
            },
            listener,
            connections: Arc::default(),
            context: Arc::new(context),
        })
    }

    pub fn context(&self) -> &Arc<ConnectorContext> {
        &self.context
    }

    /// Bound TCP address, with the real port when the configuration asked for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accepts connections until shut down, then ends open connections and waits for them.
    pub fn listen(self) -> Result<(), ServerError> {
        info!(
            "listening at {} ({})",
            self.shutdown.target, self.context.config.protocol
        );

        match &self.listener {
            Listener::Tcp(listener) => self.accept_loop(listener.incoming()),
            Listener::Unix(listener) => self.accept_loop(listener.incoming()),
        }

        if let ListenAddress::Unix(path) = &self.shutdown.target {
            if let Err(e) = fs::remove_file(path) {
                debug!("could not remove socket {}: {e}", path.display());
            }
        }

        self.connections.stop_reading_all();
        drop(self.pool);
        info!("listener stopped");
        Ok(())
    }

    fn accept_loop<S: Accepted>(&self, incoming: impl Iterator<Item = io::Result<S>>) {
        for stream in incoming {
            if self.shutdown.is_shutdown() {
                break;
            }
            match stream {
                Ok(stream) => {
                    if let Err(e) = stream.set_timeout(self.context.config.read_timeout) {
                        warn!("could not set the read timeout: {e}");
                    }
                    let id = self.connections.register(&stream);
                    let connections = Arc::clone(&self.connections);
                    let context = Arc::clone(&self.context);
                    let shutdown = self.shutdown.clone();
                    self.pool.execute(move || {
                        handle_connection(stream, &context, &shutdown);
                        if let Some(id) = id {
                            connections.remove(id);
                        }
                    });
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
    }
}

fn handle_connection<S: Accepted>(stream: S, context: &ConnectorContext, shutdown: &ShutdownHandle) {
    let peer = stream.peer().unwrap_or_else(|| "unknown peer".to_owned());
    debug!("serving connection from {peer}");

    match context.serve_connection(stream) {
        Ok(ReceiveOutcome::Shutdown) => {
            info!("shutdown requested by {peer}");
            shutdown.shutdown();
        }
        Ok(_) => debug!("connection from {peer} closed"),
        Err(ConnectorError::Application(_)) => {
            debug!("connection from {peer} closed after an application error")
        }
        Err(e) => warn!("connection from {peer} ended: {e}"),
    }
}

/// Loopback address reaching a listener bound to `addr`.
fn wake_address(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::from((Ipv4Addr::LOCALHOST, v4.port()))
        }
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::from((Ipv6Addr::LOCALHOST, v6.port()))
        }
        other => other,
    }
}
