//! Distributed rendezvous.
//!
//! Rank 0 hosts a [`CoordinationService`] over TCP; every rank (rank 0
//! included) connects to it as a client. The service offers membership, a
//! key/value store and named barriers. Cross-host buffer copies publish their
//! bytes in the store and delete them once the publishing handle goes away.
//!
//! [`CoordinatorFacade`] is the client's view: uninitialized until
//! [`CoordinatorFacade::initialize`] succeeds, then initialized for good.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tarpc::context;
use tarpc::server::{BaseChannel, Channel};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{self, RuntimeError};
use crate::transport::{connect_with_retry, tarpc_transport};

/// Poll interval for key and barrier waits.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// RPC interface of the rendezvous server.
#[tarpc::service]
pub trait CoordinationService {
    /// Register `rank` in a job of `world_size`. Returns ranks joined so far.
    async fn join(rank: u32, world_size: u32) -> Result<u32, String>;

    async fn key_value_set(key: String, value: Vec<u8>);

    async fn key_value_get(key: String) -> Option<Vec<u8>>;

    /// Remove `key`. Returns whether it was present.
    async fn key_value_delete(key: String) -> bool;

    /// Mark `rank` as arrived at barrier `name`. Idempotent; returns arrivals.
    async fn barrier_arrive(name: String, rank: u32) -> u32;

    /// Health check. Returns the same sequence number.
    async fn ping(seq: u64) -> u64;
}

#[derive(Default)]
struct RendezvousState {
    world_size: Option<u32>,
    members: BTreeSet<u32>,
    store: HashMap<String, Vec<u8>>,
    barriers: HashMap<String, BTreeSet<u32>>,
}

#[derive(Clone)]
struct CoordinationHandler {
    state: Arc<RwLock<RendezvousState>>,
}

impl CoordinationService for CoordinationHandler {
    async fn join(
        self,
        _ctx: context::Context,
        rank: u32,
        world_size: u32,
    ) -> Result<u32, String> {
        let mut state = self.state.write().await;
        let expected = *state.world_size.get_or_insert(world_size);
        if expected != world_size {
            return Err(format!(
                "rank {rank} reports world size {world_size}, job has {expected}"
            ));
        }
        if rank >= world_size {
            return Err(format!("rank {rank} out of range for world size {world_size}"));
        }
        state.members.insert(rank);
        info!(rank, joined = state.members.len(), world_size, "rank joined");
        Ok(state.members.len() as u32)
    }

    async fn key_value_set(self, _ctx: context::Context, key: String, value: Vec<u8>) {
        self.state.write().await.store.insert(key, value);
    }

    async fn key_value_get(self, _ctx: context::Context, key: String) -> Option<Vec<u8>> {
        self.state.read().await.store.get(&key).cloned()
    }

    async fn key_value_delete(self, _ctx: context::Context, key: String) -> bool {
        self.state.write().await.store.remove(&key).is_some()
    }

    async fn barrier_arrive(self, _ctx: context::Context, name: String, rank: u32) -> u32 {
        let mut state = self.state.write().await;
        let arrived = state.barriers.entry(name).or_default();
        arrived.insert(rank);
        arrived.len() as u32
    }

    async fn ping(self, _ctx: context::Context, seq: u64) -> u64 {
        seq
    }
}

/// The rendezvous server hosted by rank 0.
pub struct CoordinatorServer {
    local_addr: SocketAddr,
    state: Arc<RwLock<RendezvousState>>,
    accept: JoinHandle<()>,
}

impl CoordinatorServer {
    /// Bind and start accepting connections.
    pub async fn bind(addr: &str) -> error::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(RwLock::new(RendezvousState::default()));
        let handler = CoordinationHandler { state: Arc::clone(&state) };

        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "coordinator connection");
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(%peer, error = %e, "could not disable nagle");
                        }
                        let server = BaseChannel::with_defaults(tarpc_transport(stream));
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            use futures_util::StreamExt;
                            server
                                .execute(handler.serve())
                                .for_each(|response| async move {
                                    tokio::spawn(response);
                                })
                                .await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "coordinator accept failed");
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
        });

        info!(%local_addr, "coordinator listening");
        Ok(Self { local_addr, state, accept })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Keys currently held in the store, sorted.
    pub async fn stored_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.read().await.store.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Drop for CoordinatorServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// A rank's connection to the rendezvous server.
pub struct CoordinatorClient {
    rank: u32,
    world_size: u32,
    rpc: CoordinationServiceClient,
    _server: Option<CoordinatorServer>,
}

impl CoordinatorClient {
    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub async fn key_value_set(&self, key: &str, value: Vec<u8>) -> error::Result<()> {
        self.rpc
            .key_value_set(context::current(), key.to_string(), value)
            .await?;
        Ok(())
    }

    pub async fn key_value_get(&self, key: &str) -> error::Result<Option<Vec<u8>>> {
        Ok(self.rpc.key_value_get(context::current(), key.to_string()).await?)
    }

    pub async fn key_value_delete(&self, key: &str) -> error::Result<bool> {
        Ok(self.rpc.key_value_delete(context::current(), key.to_string()).await?)
    }

    /// Block until `key` is set, up to `timeout`.
    pub async fn wait_at_key(&self, key: &str, timeout: Duration) -> error::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.key_value_get(key).await? {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::Rendezvous(format!(
                    "timed out after {timeout:?} waiting for key {key:?}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Block until every rank has reached barrier `name`, up to `timeout`.
    pub async fn barrier(&self, name: &str, timeout: Duration) -> error::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let arrived = self
                .rpc
                .barrier_arrive(context::current(), name.to_string(), self.rank)
                .await?;
            if arrived >= self.world_size {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::Rendezvous(format!(
                    "barrier {name:?}: {arrived} of {} ranks after {timeout:?}",
                    self.world_size
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn ping(&self, seq: u64) -> error::Result<u64> {
        Ok(self.rpc.ping(context::current(), seq).await?)
    }
}

/// A value this process published in the store. Dropping it deletes the key.
pub(crate) struct PublishedValue {
    key: String,
    client: Arc<CoordinatorClient>,
    runtime: Option<Handle>,
}

impl PublishedValue {
    pub(crate) fn new(key: String, client: Arc<CoordinatorClient>) -> Self {
        Self { key, client, runtime: Handle::try_current().ok() }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn client(&self) -> &CoordinatorClient {
        &self.client
    }
}

impl fmt::Debug for PublishedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishedValue").field("key", &self.key).finish()
    }
}

impl Drop for PublishedValue {
    fn drop(&mut self) {
        let key = std::mem::take(&mut self.key);
        let Some(runtime) = self.runtime.take() else {
            warn!(%key, "no runtime to delete published value");
            return;
        };
        let client = Arc::clone(&self.client);
        runtime.spawn(async move {
            match client.key_value_delete(&key).await {
                Ok(_) => debug!(%key, "deleted published value"),
                Err(e) => warn!(%key, error = %e, "could not delete published value"),
            }
        });
    }
}

/// Lazily initialized, process-wide rendezvous handle.
pub struct CoordinatorFacade {
    client: OnceLock<Arc<CoordinatorClient>>,
    init: Mutex<()>,
    connect_timeout: Duration,
}

impl CoordinatorFacade {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            client: OnceLock::new(),
            init: Mutex::new(()),
            connect_timeout,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.client.get().is_some()
    }

    /// The connected client, or [`RuntimeError::CoordinatorNotInitialized`].
    pub fn client(&self) -> error::Result<Arc<CoordinatorClient>> {
        self.client
            .get()
            .cloned()
            .ok_or(RuntimeError::CoordinatorNotInitialized)
    }

    /// Join the job. Rank 0 also hosts the server on `master_address:port`.
    pub async fn initialize(
        &self,
        global_rank: u32,
        world_size: u32,
        master_address: &str,
        port: u16,
    ) -> error::Result<()> {
        if world_size == 0 || global_rank >= world_size {
            return Err(RuntimeError::Config(format!(
                "rank {global_rank} out of range for world size {world_size}"
            )));
        }
        let _guard = self.init.lock().await;
        if self.is_initialized() {
            return Err(RuntimeError::CoordinatorAlreadyInitialized);
        }

        let addr = format!("{master_address}:{port}");
        let (server, connect_addr) = if global_rank == 0 {
            let server = CoordinatorServer::bind(&addr).await?;
            let local = server.local_addr().to_string();
            (Some(server), local)
        } else {
            (None, addr)
        };

        let stream = connect_with_retry(&connect_addr, self.connect_timeout).await?;
        let rpc = CoordinationServiceClient::new(
            tarpc::client::Config::default(),
            tarpc_transport(stream),
        )
        .spawn();
        let joined = rpc
            .join(context::current(), global_rank, world_size)
            .await?
            .map_err(RuntimeError::Rendezvous)?;

        info!(rank = global_rank, world_size, joined, addr = %connect_addr, "coordinator initialized");
        let client = Arc::new(CoordinatorClient {
            rank: global_rank,
            world_size,
            rpc,
            _server: server,
        });
        if self.client.set(client).is_err() {
            return Err(RuntimeError::CoordinatorAlreadyInitialized);
        }
        Ok(())
    }
}
