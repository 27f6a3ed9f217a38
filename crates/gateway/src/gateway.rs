use std::{
    future::Future,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use {
    nodegate_config::GatewayConfig,
    nodegate_protocol::{
        Ack, FrameStream, Header, PROTOCOL_VERSION, framed, is_valid_rpc_id, read_frame, write_frame,
    },
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        time::Instant,
    },
    tokio_util::task::TaskTracker,
    tracing::{debug, info, warn},
};

use crate::{
    address::{AddressResolver, AnnouncedResolver, LocalResolver, NetAddress},
    dialer::{Dialer, TcpDialer},
    discovery::{self, ShareNodes},
    error::{ConnectError, Error, PersistError, Result},
    lifecycle::{Lifecycle, State},
    nodes::KnownNodes,
    peers::{Direction, Peer, PeerTable, SessionSlot},
    persist::{JsonNodeStore, NodeStore},
    rpc::{RpcHandler, RpcRegistry, RpcStream},
};

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ── Shared state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct Options {
    pub dial_timeout: Duration,
    pub bootstrap_peers: usize,
    pub discovery_interval: Duration,
}

/// State shared between the [`Gateway`] handle and its background tasks.
pub(crate) struct Shared {
    pub address: NetAddress,
    /// Present from construction until teardown completes.
    listener: Mutex<Option<Arc<TcpListener>>>,
    pub peers: PeerTable,
    pub nodes: KnownNodes,
    store: Arc<dyn NodeStore>,
    dialer: Arc<dyn Dialer>,
    rpcs: RwLock<RpcRegistry>,
    connect_calls: RwLock<RpcRegistry>,
    pub lifecycle: Lifecycle,
    pub tasks: TaskTracker,
    pub options: Options,
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Configures and starts a [`Gateway`].
///
/// The resolver, node store and dialer default to [`LocalResolver`],
/// [`JsonNodeStore`] in the persist directory and [`TcpDialer`]; each can be
/// replaced, which is how tests inject failures.
pub struct GatewayBuilder {
    listen_address: String,
    persist_dir: PathBuf,
    no_bootstrap: bool,
    dial_timeout: Duration,
    bootstrap_peers: usize,
    discovery_interval: Duration,
    resolver: Option<Arc<dyn AddressResolver>>,
    store: Option<Arc<dyn NodeStore>>,
    dialer: Option<Arc<dyn Dialer>>,
}

impl GatewayBuilder {
    pub fn new(listen_address: impl Into<String>, persist_dir: impl Into<PathBuf>) -> Self {
        let defaults = GatewayConfig::default();
        Self {
            listen_address: listen_address.into(),
            persist_dir: persist_dir.into(),
            no_bootstrap: defaults.no_bootstrap,
            dial_timeout: defaults.dial_timeout(),
            bootstrap_peers: defaults.bootstrap_peers,
            discovery_interval: defaults.discovery_interval(),
            resolver: None,
            store: None,
            dialer: None,
        }
    }

    /// Builder populated from the `[gateway]` config section.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut builder = Self::new(config.listen_address.clone(), config.persist_dir_or_default())
            .no_bootstrap(config.no_bootstrap)
            .dial_timeout(config.dial_timeout())
            .bootstrap_peers(config.bootstrap_peers)
            .discovery_interval(config.discovery_interval());
        if let Some(host) = &config.announce_host {
            builder = builder.resolver(AnnouncedResolver::new(host.clone()));
        }
        builder
    }

    pub fn no_bootstrap(mut self, no_bootstrap: bool) -> Self {
        self.no_bootstrap = no_bootstrap;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn bootstrap_peers(mut self, count: usize) -> Self {
        self.bootstrap_peers = count;
        self
    }

    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn resolver(mut self, resolver: impl AddressResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn node_store(mut self, store: impl NodeStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Some(Arc::new(dialer));
        self
    }

    /// Validate, bind, load known nodes, resolve the own address and start
    /// the accept loop (plus bootstrap and discovery unless disabled).
    pub async fn build(self) -> Result<Gateway> {
        if self.persist_dir.as_os_str().is_empty() {
            return Err(Error::Validation("persist directory must not be empty".into()));
        }
        tokio::fs::create_dir_all(&self.persist_dir)
            .await
            .map_err(|e| {
                Error::Validation(format!(
                    "persist directory {} is unusable: {e}",
                    self.persist_dir.display()
                ))
            })?;
        if self.dial_timeout.is_zero() || self.discovery_interval.is_zero() {
            return Err(Error::Validation(
                "dial timeout and discovery interval must be non-zero".into(),
            ));
        }

        let listen_err = |source| Error::Listen {
            address: self.listen_address.clone(),
            source,
        };
        let listener = TcpListener::bind(self.listen_address.as_str())
            .await
            .map_err(listen_err)?;
        let bound = listener.local_addr().map_err(listen_err)?;

        let store: Arc<dyn NodeStore> = match self.store {
            Some(store) => store,
            None => Arc::new(JsonNodeStore::new(&self.persist_dir)),
        };
        let known = store.load()?;

        let resolver: Arc<dyn AddressResolver> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(LocalResolver),
        };
        let dialer: Arc<dyn Dialer> = match self.dialer {
            Some(dialer) => dialer,
            None => Arc::new(TcpDialer),
        };
        let address = resolver.resolve(&self.listen_address, bound)?;

        let listener = Arc::new(listener);
        let shared = Arc::new(Shared {
            address: address.clone(),
            listener: Mutex::new(Some(Arc::clone(&listener))),
            peers: PeerTable::default(),
            nodes: KnownNodes::new(known),
            store,
            dialer,
            rpcs: RwLock::new(RpcRegistry::default()),
            connect_calls: RwLock::new(RpcRegistry::default()),
            lifecycle: Lifecycle::new(),
            tasks: TaskTracker::new(),
            options: Options {
                dial_timeout: self.dial_timeout,
                bootstrap_peers: self.bootstrap_peers,
                discovery_interval: self.discovery_interval,
            },
        });
        shared.register_rpc(
            discovery::SHARE_NODES_RPC,
            Arc::new(ShareNodes::new(Arc::downgrade(&shared))),
        )?;

        shared
            .tasks
            .spawn(accept_loop(Arc::clone(&shared), listener));
        if !self.no_bootstrap {
            shared.tasks.spawn(discovery::run(Arc::clone(&shared)));
        }

        info!(
            address = %address,
            bound = %bound,
            known_nodes = shared.nodes.snapshot().len(),
            bootstrap = !self.no_bootstrap,
            "gateway listening"
        );
        Ok(Gateway { shared })
    }
}

// ── Gateway ──────────────────────────────────────────────────────────────────

/// The node's peer-to-peer connection manager.
///
/// All methods take `&self` and may be called concurrently. After the first
/// [`Gateway::close`], every fallible method returns [`Error::Stopped`].
/// Dropping a gateway without closing it cancels its background tasks but
/// does not persist the known-node set.
pub struct Gateway {
    shared: Arc<Shared>,
}

impl Gateway {
    /// Start a gateway listening on `listen_address` that keeps its node
    /// list in `persist_dir`, with every other setting at its default.
    pub async fn new(
        listen_address: &str,
        no_bootstrap: bool,
        persist_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        GatewayBuilder::new(listen_address, persist_dir.as_ref())
            .no_bootstrap(no_bootstrap)
            .build()
            .await
    }

    pub fn builder(listen_address: impl Into<String>, persist_dir: impl Into<PathBuf>) -> GatewayBuilder {
        GatewayBuilder::new(listen_address, persist_dir)
    }

    /// Address advertised to peers.
    pub fn address(&self) -> NetAddress {
        self.shared.address.clone()
    }

    /// Socket address the listener is bound to, until the gateway is closed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    pub fn state(&self) -> State {
        self.shared.lifecycle.state()
    }

    /// Dial `addr` and add it to the peer table as an outbound peer.
    pub async fn connect(&self, addr: impl Into<NetAddress>) -> Result<()> {
        self.shared.connect(addr.into()).await
    }

    /// Close the connection to `addr` and drop it from the peer table.
    pub async fn disconnect(&self, addr: impl Into<NetAddress>) -> Result<()> {
        self.shared.disconnect(&addr.into()).await
    }

    /// Snapshot of the current peers in address order.
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.peers.snapshot()
    }

    /// Snapshot of every known node, sorted.
    pub fn known_nodes(&self) -> Vec<NetAddress> {
        self.shared.nodes.snapshot().into_iter().collect()
    }

    /// Serve RPC `id` with `handler` whenever a peer asks for it.
    pub fn register_rpc(&self, id: &str, handler: impl RpcHandler + 'static) -> Result<()> {
        self.shared.lifecycle.ensure_running()?;
        self.shared.register_rpc(id, Arc::new(handler))
    }

    /// Stop serving RPC `id`. Returns whether it was registered.
    pub fn unregister_rpc(&self, id: &str) -> bool {
        self.shared
            .rpcs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(id)
    }

    /// Identifiers of every served RPC, sorted.
    pub fn rpc_ids(&self) -> Vec<String> {
        self.shared
            .rpcs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ids()
    }

    /// Call RPC `id` on every newly established peer, driving the calling
    /// side of the stream with `handler`.
    pub fn register_connect_call(&self, id: &str, handler: impl RpcHandler + 'static) -> Result<()> {
        self.shared.lifecycle.ensure_running()?;
        self.shared
            .connect_calls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(id, Arc::new(handler))
    }

    /// Open an RPC stream to connected peer `addr` and hand it to `f`.
    pub async fn rpc<T, F, Fut>(&self, addr: impl Into<NetAddress>, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(RpcStream) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.shared.call(&addr.into(), id, f).await
    }

    /// Tear the gateway down.
    ///
    /// Stops accepting, signals background tasks, disconnects every peer,
    /// persists the known-node set and closes the listener, in that order.
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned. Later calls return [`Error::Stopped`].
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        shared.lifecycle.begin_stop()?;
        info!(address = %shared.address, "closing gateway");

        let mut first_error = None;
        for entry in shared.peers.close() {
            let addr = entry.peer.net_address.clone();
            if let Err(e) = entry.disconnect().await {
                warn!(peer = %addr, error = %e, "failed to close peer connection");
                first_error.get_or_insert(Error::connection(&addr, e));
            }
        }

        shared.tasks.close();
        shared.tasks.wait().await;

        if let Err(e) = shared.flush_nodes(true).await {
            warn!(error = %e, "failed to persist known nodes");
            first_error.get_or_insert(e);
        }

        drop(
            shared
                .listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        shared.lifecycle.finish_stop();
        info!(address = %shared.address, "gateway closed");

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if self.shared.lifecycle.state() == State::Running {
            debug!(address = %self.shared.address, "gateway dropped without close");
            self.shared.lifecycle.token().cancel();
        }
    }
}

// ── Operations ───────────────────────────────────────────────────────────────

impl Shared {
    fn register_rpc(&self, id: &str, handler: Arc<dyn RpcHandler>) -> Result<()> {
        self.rpcs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(id, handler)
    }

    pub(crate) async fn connect(self: &Arc<Self>, addr: NetAddress) -> Result<()> {
        self.lifecycle.ensure_running()?;
        addr.validate()?;
        if addr == self.address {
            return Err(Error::Validation(format!("cannot connect to own address {addr}")));
        }
        if self.peers.contains(&addr) {
            return Err(Error::DuplicatePeer(addr));
        }

        let deadline = Instant::now() + self.options.dial_timeout;
        let mut stream = framed(self.dial(&addr, deadline).await?);

        // Claim the table slot before the handshake so the remote's first
        // RPC back to us already finds the peer. The entry stays pending,
        // and hidden from `peers()`, until the remote acknowledges.
        let slot = self
            .peers
            .insert(addr.clone(), Direction::Outbound, self.lifecycle.token())?;
        let header = Header::Session {
            version: PROTOCOL_VERSION,
            address: self.address.to_string(),
        };
        let handshaken = tokio::select! {
            biased;
            _ = slot.cancel.cancelled() => Err(self.aborted(&addr)),
            res = self.bounded(&addr, deadline, handshake(&mut stream, &header)) => res,
        };
        let established = handshaken.and_then(|()| {
            if self.peers.establish(&addr, slot.conn_id) {
                Ok(())
            } else {
                Err(self.aborted(&addr))
            }
        });
        if let Err(e) = established {
            self.peers.remove_conn(&addr, slot.conn_id);
            // The remote's own dial to us won a simultaneous open.
            if !matches!(e, Error::Stopped) && self.peers.contains(&addr) {
                debug!(peer = %addr, error = %e, "outbound dial superseded");
                return Err(Error::DuplicatePeer(addr));
            }
            return Err(e);
        }

        self.nodes.insert(addr.clone());
        info!(peer = %addr, "connected to peer");
        self.tasks.spawn(run_session(
            Arc::clone(self),
            stream.into_inner(),
            addr.clone(),
            slot,
        ));
        self.spawn_connect_calls(addr);
        Ok(())
    }

    async fn disconnect(&self, addr: &NetAddress) -> Result<()> {
        self.lifecycle.ensure_running()?;
        let entry = self
            .peers
            .remove(addr)
            .ok_or_else(|| Error::PeerNotFound(addr.clone()))?;
        entry
            .disconnect()
            .await
            .map_err(|e| Error::connection(addr, e))?;
        info!(peer = %addr, "disconnected from peer");
        Ok(())
    }

    pub(crate) async fn call<T, F, Fut>(&self, addr: &NetAddress, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(RpcStream) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.lifecycle.ensure_running()?;
        if !is_valid_rpc_id(id) {
            return Err(Error::Validation(format!("invalid rpc id {id:?}")));
        }
        if !self.peers.contains(addr) {
            return Err(Error::PeerNotFound(addr.clone()));
        }

        let deadline = Instant::now() + self.options.dial_timeout;
        let mut stream = framed(self.dial(addr, deadline).await?);
        let header = Header::Rpc {
            version: PROTOCOL_VERSION,
            id: id.to_string(),
            address: self.address.to_string(),
        };
        self.bounded(addr, deadline, handshake(&mut stream, &header))
            .await?;

        debug!(peer = %addr, rpc = id, "calling rpc");
        let rpc = RpcStream::new(stream, addr.clone(), id);
        tokio::select! {
            _ = self.lifecycle.token().cancelled() => Err(Error::Stopped),
            res = f(rpc) => res.map_err(|source| Error::Rpc {
                id: id.to_string(),
                address: addr.clone(),
                source,
            }),
        }
    }

    /// Error for a connection attempt whose peer entry was cancelled.
    fn aborted(&self, addr: &NetAddress) -> Error {
        if self.lifecycle.token().is_cancelled() {
            Error::Stopped
        } else {
            Error::connection(addr, ConnectError::Cancelled)
        }
    }

    async fn dial(&self, addr: &NetAddress, deadline: Instant) -> Result<TcpStream> {
        let dial = async { self.dialer.dial(addr).await.map_err(ConnectError::from) };
        self.bounded(addr, deadline, dial).await
    }

    /// Run `fut` until `deadline`, giving up early when the gateway stops.
    async fn bounded<T>(
        &self,
        addr: &NetAddress,
        deadline: Instant,
        fut: impl Future<Output = std::result::Result<T, ConnectError>>,
    ) -> Result<T> {
        tokio::select! {
            _ = self.lifecycle.token().cancelled() => Err(Error::Stopped),
            res = tokio::time::timeout_at(deadline, fut) => match res {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Error::connection(addr, e)),
                Err(_) => Err(Error::connection(
                    addr,
                    ConnectError::Timeout(self.options.dial_timeout),
                )),
            },
        }
    }

    fn spawn_connect_calls(self: &Arc<Self>, addr: NetAddress) {
        let calls = self
            .connect_calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries();
        if calls.is_empty() {
            return;
        }
        let shared = Arc::clone(self);
        self.tasks.spawn(async move {
            for (id, handler) in calls {
                let result = shared
                    .call(&addr, &id, |stream| handler.handle(stream))
                    .await;
                match result {
                    Ok(()) => debug!(peer = %addr, rpc = %id, "connect call finished"),
                    Err(Error::Stopped) => return,
                    Err(e) => warn!(peer = %addr, rpc = %id, error = %e, "connect call failed"),
                }
            }
        });
    }

    /// Write the known-node set through the store. Without `force` this only
    /// happens when the set changed since the last successful write.
    pub(crate) async fn flush_nodes(&self, force: bool) -> Result<()> {
        let nodes = match self.nodes.take_dirty() {
            Some(nodes) => nodes,
            None if force => self.nodes.snapshot(),
            None => return Ok(()),
        };
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || store.save(&nodes))
            .await
            .unwrap_or_else(|e| Err(PersistError::Task(e.to_string())));
        if result.is_err() {
            self.nodes.mark_dirty();
        }
        Ok(result?)
    }

    async fn handle_inbound(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> std::result::Result<(), ConnectError> {
        let mut stream = framed(stream);
        let timeout = self.options.dial_timeout;
        let header: Header = tokio::select! {
            _ = self.lifecycle.token().cancelled() => return Ok(()),
            res = tokio::time::timeout(timeout, read_frame(&mut stream)) => match res {
                Ok(header) => header?,
                Err(_) => return Err(ConnectError::Timeout(timeout)),
            },
        };

        if header.version() != PROTOCOL_VERSION {
            let reason = format!("unsupported protocol version {}", header.version());
            reject(&mut stream, &reason).await;
            return Err(ConnectError::Version(header.version()));
        }

        let declared = NetAddress::from(header.address());
        let port = match declared.port_number() {
            Some(port) if declared.is_valid() && port != 0 => port,
            _ => {
                let reason = format!("invalid address {declared}");
                reject(&mut stream, &reason).await;
                return Err(ConnectError::Rejected(reason));
            },
        };
        // The declared host is only trusted when it resolves to the remote IP.
        let observed = NetAddress::from(SocketAddr::new(remote.ip(), port));
        let peer_addr = if declared != observed
            && tokio::time::timeout(timeout, declared.resolves_to(remote.ip()))
                .await
                .unwrap_or(false)
        {
            declared
        } else {
            observed
        };

        match header {
            Header::Session { .. } => self.accept_session(stream, peer_addr).await,
            Header::Rpc { id, .. } => self.accept_rpc(stream, peer_addr, id).await,
        }
    }

    async fn accept_session(
        self: Arc<Self>,
        mut stream: FrameStream<TcpStream>,
        addr: NetAddress,
    ) -> std::result::Result<(), ConnectError> {
        if addr == self.address {
            reject(&mut stream, "connection to self").await;
            return Err(ConnectError::Rejected("connection to self".into()));
        }
        // When both sides dial each other at once, the connection dialed by
        // the lower address wins and replaces our pending outbound entry.
        let dialed_by_lower = addr < self.address;
        let slot = match self
            .peers
            .insert_inbound(addr.clone(), self.lifecycle.token(), dialed_by_lower)
        {
            Ok(slot) => slot,
            Err(e) => {
                let reason = e.to_string();
                reject(&mut stream, &reason).await;
                return Err(ConnectError::Rejected(reason));
            },
        };
        if let Err(e) = write_frame(&mut stream, &Ack::accepted()).await {
            self.peers.remove_conn(&addr, slot.conn_id);
            return Err(e.into());
        }

        self.nodes.insert(addr.clone());
        info!(peer = %addr, "accepted inbound peer");
        self.spawn_connect_calls(addr.clone());
        run_session(self, stream.into_inner(), addr, slot).await;
        Ok(())
    }

    async fn accept_rpc(
        self: Arc<Self>,
        mut stream: FrameStream<TcpStream>,
        addr: NetAddress,
        id: String,
    ) -> std::result::Result<(), ConnectError> {
        if !self.peers.contains(&addr) {
            reject(&mut stream, "not a peer").await;
            return Err(ConnectError::Rejected(format!("rpc {id} from non-peer")));
        }
        let handler = self
            .rpcs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id);
        let Some(handler) = handler else {
            let reason = format!("unknown rpc {id}");
            reject(&mut stream, &reason).await;
            return Err(ConnectError::Rejected(reason));
        };
        write_frame(&mut stream, &Ack::accepted()).await?;

        debug!(peer = %addr, rpc = %id, "serving rpc");
        let rpc = RpcStream::new(stream, addr.clone(), id.clone());
        tokio::select! {
            _ = self.lifecycle.token().cancelled() => {
                debug!(peer = %addr, rpc = %id, "rpc cancelled by shutdown");
            },
            res = handler.handle(rpc) => {
                if let Err(e) = res {
                    warn!(peer = %addr, rpc = %id, error = %e, "rpc handler failed");
                }
            },
        }
        Ok(())
    }
}

// ── Connection tasks ─────────────────────────────────────────────────────────

async fn handshake(
    stream: &mut FrameStream<TcpStream>,
    header: &Header,
) -> std::result::Result<(), ConnectError> {
    write_frame(stream, header).await?;
    match read_frame::<_, Ack>(stream).await? {
        Ack::Accepted { version } if version == PROTOCOL_VERSION => Ok(()),
        Ack::Accepted { version } => Err(ConnectError::Version(version)),
        Ack::Rejected { reason } => Err(ConnectError::Rejected(reason)),
    }
}

async fn reject(stream: &mut FrameStream<TcpStream>, reason: &str) {
    if let Err(e) = write_frame(stream, &Ack::rejected(reason)).await {
        debug!(error = %e, "failed to send rejection");
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: Arc<TcpListener>) {
    let token = shared.lifecycle.token().clone();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, remote)) => {
                let conn = Arc::clone(&shared);
                shared.tasks.spawn(async move {
                    if let Err(e) = conn.handle_inbound(stream, remote).await {
                        debug!(remote = %remote, error = %e, "inbound connection dropped");
                    }
                });
            },
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {},
                }
            },
        }
    }
    debug!(address = %shared.address, "accept loop stopped");
}

/// Hold a peer session open until it is cancelled or the remote goes away.
///
/// Bytes arriving on the session are discarded; RPCs use their own streams.
async fn run_session(shared: Arc<Shared>, mut stream: TcpStream, addr: NetAddress, slot: SessionSlot) {
    let SessionSlot {
        conn_id,
        cancel,
        closed,
    } = slot;
    let mut buf = [0u8; 512];
    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break shutdown(&mut stream).await,
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    if shared.peers.remove_conn(&addr, conn_id) {
                        info!(peer = %addr, "peer closed the connection");
                    }
                    break Ok(());
                },
                Ok(_) => continue,
                Err(e) => {
                    if shared.peers.remove_conn(&addr, conn_id) {
                        warn!(peer = %addr, error = %e, "peer connection failed");
                    }
                    break Ok(());
                },
            },
        }
    };
    let _ = closed.send(outcome);
}

async fn shutdown(stream: &mut TcpStream) -> std::io::Result<()> {
    use std::io::ErrorKind;

    match stream.shutdown().await {
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::NotConnected | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
            ) =>
        {
            Ok(())
        },
        other => other,
    }
}
