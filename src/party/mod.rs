//! This module provides the party: its place in the topology, its per-party store and the
//! message dispatcher that feeds the coordination primitives.
pub mod broadcast;
pub mod chunk;
pub mod error;
pub mod forward;
pub mod mailbox;

use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::{channel, Receiver};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use self::error::{MpcError, MpcResult};
use self::mailbox::{ChunkMailbox, Mailbox};
use crate::network::local::local_network;
use crate::network::message::{Message, Tag};
use crate::network::task::TlsTransport;
use crate::network::{ConnectedParty, Inbound, Inbox, Transport};
use crate::preprocessing;
use crate::table::store::EpochStore;
use crate::table::PlainTable;

/// Owner index of the backend.
pub const BACKEND: usize = 1;
/// Replica index of every clique leader.
pub const LEADER_REPLICA: usize = 1;

/// A party, identified by its owner and replica index (both 1-based).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyId {
    pub owner: usize,
    pub replica: usize,
}

impl PartyId {
    pub const fn new(owner: usize, replica: usize) -> Self {
        Self { owner, replica }
    }
}

impl Display for PartyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "P{}.{}", self.owner, self.replica)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Backend,
    Frontend,
}

/// `owners` cliques of `replicas` parties each. Owner 1 is the backend, the others are
/// frontends in ring order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    owners: usize,
    replicas: usize,
}

impl Topology {
    pub fn new(owners: usize, replicas: usize) -> MpcResult<Self> {
        if owners < 2 || replicas < 1 {
            return Err(MpcError::InvalidParameters(format!("need at least 2 owners and 1 replica, got {} owners and {} replicas", owners, replicas)));
        }
        Ok(Self { owners, replicas })
    }

    pub fn owners(&self) -> usize {
        self.owners
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn size(&self) -> usize {
        self.owners * self.replicas
    }

    pub fn contains(&self, id: PartyId) -> bool {
        (1..=self.owners).contains(&id.owner) && (1..=self.replicas).contains(&id.replica)
    }

    pub fn index_of(&self, id: PartyId) -> usize {
        (id.owner - 1) * self.replicas + (id.replica - 1)
    }

    pub fn id_at(&self, index: usize) -> PartyId {
        PartyId::new(index / self.replicas + 1, index % self.replicas + 1)
    }

    pub fn all(&self) -> Vec<PartyId> {
        (0..self.size()).map(|i| self.id_at(i)).collect()
    }

    pub fn role(&self, id: PartyId) -> Role {
        if id.owner == BACKEND { Role::Backend } else { Role::Frontend }
    }

    pub fn last_owner(&self) -> usize {
        self.owners
    }

    /// Every replica of `owner`, leader first.
    pub fn clique(&self, owner: usize) -> Vec<PartyId> {
        (1..=self.replicas).map(|r| PartyId::new(owner, r)).collect()
    }

    pub fn leader(&self, owner: usize) -> PartyId {
        PartyId::new(owner, LEADER_REPLICA)
    }

    pub fn backend_leader(&self) -> PartyId {
        self.leader(BACKEND)
    }

    /// Same replica in the next owner; the last owner wraps to the backend.
    pub fn next(&self, id: PartyId) -> PartyId {
        PartyId::new(id.owner % self.owners + 1, id.replica)
    }

    pub fn prev(&self, id: PartyId) -> PartyId {
        PartyId::new((id.owner + self.owners - 2) % self.owners + 1, id.replica)
    }

    pub fn backend(&self, replica: usize) -> PartyId {
        PartyId::new(BACKEND, replica)
    }

    /// The frontends serving queries together with backend `replica`, in ring order.
    pub fn frontends(&self, replica: usize) -> Vec<PartyId> {
        (BACKEND + 1..=self.owners).map(|o| PartyId::new(o, replica)).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// bound on every wait of a query
    pub timeout: Duration,
    /// bound on every wait of a preprocessing round
    pub preprocessing_timeout: Duration,
}

impl ProtocolConfig {
    /// How long an unclaimed message or a closed tag is remembered.
    pub fn mailbox_ttl(&self) -> Duration {
        self.timeout.max(self.preprocessing_timeout)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            preprocessing_timeout: Duration::from_secs(120),
        }
    }
}

pub struct MainParty {
    pub id: PartyId,
    pub topology: Topology,
    pub config: ProtocolConfig,
    transport: Box<dyn Transport>,
    pub(crate) broadcasts: Mailbox,
    pub(crate) forwards: Mailbox,
    pub(crate) chunks: ChunkMailbox,
    /// tag prefixes of the queries being answered
    pub(crate) queries: Mutex<HashSet<Tag>>,
    store: RwLock<EpochStore>,
    table: Option<Arc<PlainTable>>,
    thread_pool: Option<ThreadPool>,
}

impl MainParty {
    /// `table` is required for backends, which slice their preprocessing input from it.
    pub fn setup(id: PartyId, topology: Topology, config: ProtocolConfig, transport: Box<dyn Transport>, table: Option<Arc<PlainTable>>, n_worker_threads: Option<usize>) -> MpcResult<Self> {
        if !topology.contains(id) {
            return Err(MpcError::InvalidParameters(format!("{} is not part of the topology", id)));
        }
        if topology.role(id) == Role::Backend && table.is_none() {
            return Err(MpcError::InvalidParameters(format!("backend {} needs the plaintext table", id)));
        }
        let thread_pool = match n_worker_threads {
            Some(n) => Some(Self::build_thread_pool(n)?),
            None => None,
        };
        Ok(Self {
            id,
            topology,
            config,
            transport,
            broadcasts: Mailbox::new("broadcast", config.mailbox_ttl()),
            forwards: Mailbox::new("forward", config.mailbox_ttl()),
            chunks: ChunkMailbox::new(config.mailbox_ttl()),
            queries: Mutex::new(HashSet::new()),
            store: RwLock::new(EpochStore::new()),
            table,
            thread_pool,
        })
    }

    fn build_thread_pool(n_worker_threads: usize) -> MpcResult<ThreadPool> {
        let mut builder = ThreadPoolBuilder::new();
        if n_worker_threads != 0 {
            builder = builder.num_threads(n_worker_threads);
        }
        // 0 spawns as many threads as there are cores
        builder = builder.thread_name(|i| format!("worker-{}", i));
        builder.build().map_err(|err| MpcError::InvalidParameters(err.to_string()))
    }

    pub fn role(&self) -> Role {
        self.topology.role(self.id)
    }

    pub fn is_leader(&self) -> bool {
        self.id.replica == LEADER_REPLICA
    }

    pub fn send(&self, to: PartyId, message: Message) -> MpcResult<()> {
        self.transport.send(to, message)
    }

    pub fn store(&self) -> RwLockReadGuard<'_, EpochStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store_mut(&self) -> RwLockWriteGuard<'_, EpochStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn plain_table(&self) -> MpcResult<&Arc<PlainTable>> {
        self.table.as_ref().ok_or(MpcError::InvalidParameters(format!("{} holds no plaintext table", self.id)))
    }

    pub fn has_multi_threading(&self) -> bool {
        self.thread_pool.is_some()
    }

    /// Runs `f` in the worker pool if there is one, otherwise on the calling thread.
    pub fn run_in_threadpool<T: Send, F: FnOnce() -> T + Send>(&self, f: F) -> T {
        match &self.thread_pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    /// Routes an incoming message to its mailbox or protocol step.
    fn deliver(self: &Arc<Self>, from: PartyId, message: Message) {
        match message {
            Message::Broadcast { tag, payload } => {
                if from != self.topology.leader(self.id.owner) {
                    warn!("{} got a broadcast for {} from non-leader {}, dropped", self.id, tag, from);
                    return;
                }
                self.broadcasts.deliver(tag, payload)
            }
            Message::Forward { tag, payload } => self.forwards.deliver(tag, payload),
            Message::Chunk { tag, payload } => self.chunks.deliver(tag, from, payload),
            Message::Start { epoch } => {
                if from != self.topology.backend_leader() {
                    warn!("{} ignores start of epoch {} from {}", self.id, epoch, from);
                    return;
                }
                let party = Arc::clone(self);
                let spawned = thread::Builder::new()
                    .name(format!("preprocess-{}", epoch))
                    .spawn(move || preprocessing::run_epoch(&party, epoch, true));
                if let Err(err) = spawned {
                    warn!("{} cannot start preprocessing of epoch {}: {}", self.id, epoch, err);
                }
            }
            Message::Install { epoch, success } => {
                if from != self.topology.backend_leader() {
                    warn!("{} ignores install of epoch {} from {}", self.id, epoch, from);
                    return;
                }
                self.store_mut().finish(epoch, success);
                info!("{} recompute #{} {}", self.id, epoch, if success { "installed" } else { "failed" });
            }
        }
    }
}

fn dispatch(party: Arc<MainParty>, inbound: Receiver<Inbound>) {
    loop {
        match inbound.recv() {
            Ok(Inbound::Message { from, message }) => party.deliver(from, message),
            Ok(Inbound::Shutdown) | Err(_) => break,
        }
    }
    debug!("{} dispatcher stopped", party.id);
}

/// A running party: the shared party state and its dispatcher thread.
pub struct PartyHandle {
    party: Arc<MainParty>,
    inbox: Inbox,
    dispatcher: JoinHandle<()>,
}

impl PartyHandle {
    pub fn spawn(party: MainParty, inbox: Inbox, inbound: Receiver<Inbound>) -> MpcResult<Self> {
        let party = Arc::new(party);
        let dispatched = Arc::clone(&party);
        let dispatcher = thread::Builder::new()
            .name(format!("dispatch-{}", party.id))
            .spawn(move || dispatch(dispatched, inbound))?;
        Ok(Self { party, inbox, dispatcher })
    }

    /// Sets up a party on an established TLS mesh.
    pub fn connect(connected: ConnectedParty, table: Option<Arc<PlainTable>>, n_worker_threads: Option<usize>) -> MpcResult<Self> {
        let id = connected.config.id();
        let topology = connected.config.topology;
        let config = connected.config.protocol;
        let (inbox, inbound) = channel();
        let transport = TlsTransport::new(connected, inbox.clone())?;
        let party = MainParty::setup(id, topology, config, Box::new(transport), table, n_worker_threads)?;
        Self::spawn(party, inbox, inbound)
    }

    pub fn party(&self) -> &Arc<MainParty> {
        &self.party
    }

    /// Stops the dispatcher and closes the transport.
    pub fn teardown(self) -> MpcResult<()> {
        // the dispatcher may already be gone
        let _ = self.inbox.send(Inbound::Shutdown);
        if self.dispatcher.join().is_err() {
            warn!("{} dispatcher panicked", self.party.id);
        }
        self.party.transport.shutdown()
    }
}

/// Starts every party of `topology` in this process, connected by in-memory channels.
pub fn spawn_local(topology: Topology, table: Arc<PlainTable>, config: ProtocolConfig) -> MpcResult<Vec<PartyHandle>> {
    local_network(&topology)
        .into_iter()
        .zip(topology.all())
        .map(|((transport, inbox, inbound), id)| {
            let table = (topology.role(id) == Role::Backend).then(|| Arc::clone(&table));
            let party = MainParty::setup(id, topology, config, Box::new(transport), table, None)?;
            PartyHandle::spawn(party, inbox, inbound)
        })
        .collect()
}

#[cfg(test)]
pub mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{spawn_local, PartyHandle, ProtocolConfig, Topology};
    use crate::table::PlainTable;

    pub const TEST_CONFIG: ProtocolConfig = ProtocolConfig {
        timeout: Duration::from_secs(10),
        preprocessing_timeout: Duration::from_secs(30),
    };

    pub fn localhost_setup(owners: usize, replicas: usize, table: PlainTable) -> Vec<PartyHandle> {
        localhost_setup_with(owners, replicas, table, TEST_CONFIG)
    }

    pub fn localhost_setup_with(owners: usize, replicas: usize, table: PlainTable, config: ProtocolConfig) -> Vec<PartyHandle> {
        spawn_local(Topology::new(owners, replicas).unwrap(), Arc::new(table), config).unwrap()
    }

    /// Nothing buffered or awaited in any mailbox of any party.
    pub fn assert_drained(parties: &[PartyHandle]) {
        for p in parties {
            let party = p.party();
            assert_eq!((party.broadcasts.pending(), party.forwards.pending(), party.chunks.pending()), (0, 0, 0), "{} has pending messages", party.id);
        }
    }

    /// Recomputes and waits until every party saw the outcome. Returns the new epoch.
    pub fn recompute_and_wait(parties: &[PartyHandle]) -> u64 {
        let report = crate::preprocessing::recompute(parties[0].party()).unwrap();
        assert!(report.success);
        for p in parties {
            let mut waited = 0;
            while p.party().store().current() != Some(report.epoch) {
                assert!(waited < 1000, "{} never installed epoch {}", p.party().id, report.epoch);
                std::thread::sleep(Duration::from_millis(10));
                waited += 1;
            }
        }
        report.epoch
    }

    pub fn teardown_all(parties: Vec<PartyHandle>) {
        for p in parties {
            p.teardown().unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::test::TEST_CONFIG;
    use super::{PartyHandle, PartyId, Role, Topology};
    use crate::network::test::localhost_connect;
    use crate::preprocessing::recompute;
    use crate::table::PlainTable;

    #[test]
    fn recompute_over_tls() {
        let topology = Topology::new(3, 1).unwrap();
        let table = Arc::new(PlainTable::directed_path(5));
        let handles = localhost_connect(topology, TEST_CONFIG, move |connected| {
            let is_backend = connected.config.id().owner == 1;
            let handle = PartyHandle::connect(connected, is_backend.then(|| Arc::clone(&table)), Some(2)).unwrap();
            let party = Arc::clone(handle.party());
            if party.id == topology.backend_leader() {
                assert!(recompute(&party).unwrap().success);
            }
            for _ in 0..1000 {
                if party.store().current() == Some(1) {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            let installed = party.store().current();
            handle.teardown().unwrap();
            installed
        });
        for h in handles {
            assert_eq!(h.join().unwrap(), Some(1));
        }
    }

    #[test]
    fn ring_neighbours_wrap() {
        let t = Topology::new(4, 2).unwrap();
        assert_eq!(t.next(PartyId::new(1, 2)), PartyId::new(2, 2));
        assert_eq!(t.next(PartyId::new(4, 2)), PartyId::new(1, 2));
        assert_eq!(t.prev(PartyId::new(1, 1)), PartyId::new(4, 1));
        assert_eq!(t.prev(PartyId::new(3, 1)), PartyId::new(2, 1));
        for id in t.all() {
            assert_eq!(t.prev(t.next(id)), id);
        }
    }

    #[test]
    fn flat_indices() {
        let t = Topology::new(3, 2).unwrap();
        for (i, id) in t.all().into_iter().enumerate() {
            assert_eq!(t.index_of(id), i);
            assert_eq!(t.id_at(i), id);
        }
        assert_eq!(t.id_at(3), PartyId::new(2, 2));
    }

    #[test]
    fn cliques_and_roles() {
        let t = Topology::new(3, 3).unwrap();
        assert_eq!(t.clique(2), vec![PartyId::new(2, 1), PartyId::new(2, 2), PartyId::new(2, 3)]);
        assert_eq!(t.frontends(2), vec![PartyId::new(2, 2), PartyId::new(3, 2)]);
        assert_eq!(t.backend(3), PartyId::new(1, 3));
        assert_eq!(t.role(PartyId::new(1, 3)), Role::Backend);
        assert_eq!(t.role(PartyId::new(3, 1)), Role::Frontend);
        assert!(!t.contains(PartyId::new(4, 1)));
        assert!(Topology::new(1, 1).is_err());
    }
}
