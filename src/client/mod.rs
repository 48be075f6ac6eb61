//! Client side: shares a `(src, dest)` query, collects one reply share from every owner and
//! walks a route one hop at a time.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::RistrettoPoint;
use rand::{thread_rng, Rng};
use tracing::{debug, info};

use crate::party::error::{MpcError, MpcResult};
use crate::party::{spawn_local, MainParty, PartyHandle, PartyId, ProtocolConfig, Topology};
use crate::preprocessing::{recompute, RecomputeReport};
use crate::query::{handle, QueryKind, QueryRequest};
use crate::share::ecmpc::{reconstruct, share};
use crate::share::{pair_point, vertex_point, EcShare, VertexId, UNREACHABLE};
use crate::table::store::Epoch;
use crate::table::PlainTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HopOutcome {
    Next(VertexId),
    Unreachable,
}

/// Maps reconstructed hop points back to vertex ids.
#[derive(Clone, Debug, Default)]
pub struct ClientMap {
    vertices: HashMap<CompressedRistretto, VertexId>,
}

impl ClientMap {
    pub fn new(vertices: impl IntoIterator<Item = VertexId>) -> Self {
        let vertices = vertices.into_iter().map(|v| (vertex_point(v).compress(), v)).collect();
        Self { vertices }
    }

    pub fn from_table(table: &PlainTable) -> Self {
        Self::new(table.vertices())
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn resolve(&self, hop: &RistrettoPoint) -> MpcResult<HopOutcome> {
        if *hop == *UNREACHABLE {
            return Ok(HopOutcome::Unreachable);
        }
        self.vertices
            .get(&hop.compress())
            .map(|v| HopOutcome::Next(*v))
            .ok_or(MpcError::UnknownHop)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteStatus {
    Arrived,
    Unreachable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Path {
    /// Every vertex visited, starting with the source.
    pub vertices: Vec<VertexId>,
    pub status: RouteStatus,
}

/// Whatever answers the per-party query endpoints.
pub trait QueryService: Send + Sync {
    fn topology(&self) -> Topology;
    fn query(&self, to: PartyId, kind: QueryKind, request: &QueryRequest) -> MpcResult<EcShare>;
}

pub struct Client<'a> {
    service: &'a dyn QueryService,
    map: ClientMap,
    kind: QueryKind,
    session: String,
    counter: AtomicU64,
    epoch: Option<Epoch>,
    max_hops: usize,
}

impl<'a> Client<'a> {
    pub fn new(service: &'a dyn QueryService, map: ClientMap, kind: QueryKind) -> Self {
        let session = hex::encode(thread_rng().gen::<[u8; 16]>());
        let max_hops = map.len();
        Self { service, map, kind, session, counter: AtomicU64::new(0), epoch: None, max_hops }
    }

    /// Pins every query to `epoch` instead of each party's current one.
    pub fn with_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    fn next_id(&self) -> String {
        format!("{}-{}", self.session, self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Learns the next hop from `src` towards `dest`.
    pub fn query_hop(&self, src: VertexId, dest: VertexId) -> MpcResult<HopOutcome> {
        let topology = self.service.topology();
        let mut rng = thread_rng();
        let mut shares = share(&pair_point(src, dest), topology.owners(), &mut rng)?;
        if self.kind == QueryKind::Malicious {
            // the first frontend starts the ring with the point
            shares.swap(0, 1);
        }
        let replica = rng.gen_range(1..=topology.replicas());
        let id = self.next_id();
        debug!("query {} ({} -> {}) on replica {}", id, src, dest, replica);

        let replies: Vec<MpcResult<EcShare>> = thread::scope(|s| {
            let handles: Vec<_> = shares
                .into_iter()
                .enumerate()
                .map(|(i, share)| {
                    let request = QueryRequest { id: id.clone(), epoch: self.epoch, share };
                    let to = PartyId::new(i + 1, replica);
                    s.spawn(move || self.service.query(to, self.kind, &request))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(MpcError::OperationFailed("query thread panicked".to_string()))))
                .collect()
        });
        let mut replies = replies.into_iter().collect::<MpcResult<Vec<_>>>()?;
        if self.kind == QueryKind::Malicious {
            replies.swap(0, 1);
        }
        self.map.resolve(&reconstruct(&replies)?)
    }

    /// Walks from `src` to `dest`. Any failed hop aborts the whole walk.
    pub fn route(&self, src: VertexId, dest: VertexId) -> MpcResult<Path> {
        let mut vertices = vec![src];
        let mut current = src;
        if src == dest {
            return Ok(Path { vertices, status: RouteStatus::Arrived });
        }
        for _ in 0..self.max_hops {
            match self.query_hop(current, dest) {
                Ok(HopOutcome::Next(next)) => {
                    vertices.push(next);
                    if next == dest {
                        return Ok(Path { vertices, status: RouteStatus::Arrived });
                    }
                    current = next;
                }
                Ok(HopOutcome::Unreachable) => return Ok(Path { vertices, status: RouteStatus::Unreachable }),
                Err(cause) => return Err(MpcError::RouteAborted { from: current, to: dest, cause: Box::new(cause) }),
            }
        }
        Err(MpcError::RouteAborted {
            from: current,
            to: dest,
            cause: Box::new(MpcError::OperationFailed(format!("no arrival after {} hops", self.max_hops))),
        })
    }
}

/// Every party of a deployment, running in this process.
pub struct LocalDeployment {
    topology: Topology,
    config: ProtocolConfig,
    parties: Vec<PartyHandle>,
}

impl LocalDeployment {
    pub fn start(topology: Topology, table: PlainTable, config: ProtocolConfig) -> MpcResult<Self> {
        let parties = spawn_local(topology, Arc::new(table), config)?;
        info!("started {} local parties ({} owners x {} replicas)", parties.len(), topology.owners(), topology.replicas());
        Ok(Self { topology, config, parties })
    }

    pub fn party(&self, id: PartyId) -> &Arc<MainParty> {
        self.parties[self.topology.index_of(id)].party()
    }

    /// Runs a recompute and waits until every party applied its outcome.
    pub fn recompute(&self) -> MpcResult<RecomputeReport> {
        let report = recompute(self.party(self.topology.backend_leader()))?;
        if !report.success {
            return Ok(report);
        }
        let deadline = Instant::now() + self.config.timeout;
        for handle in &self.parties {
            while handle.party().store().current().map_or(true, |c| c < report.epoch) {
                if Instant::now() > deadline {
                    return Err(MpcError::Timeout { tag: format!("preprocess:{}:install", report.epoch), timeout: self.config.timeout });
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
        Ok(report)
    }

    pub fn teardown(self) -> MpcResult<()> {
        for handle in self.parties {
            handle.teardown()?;
        }
        Ok(())
    }
}

impl QueryService for LocalDeployment {
    fn topology(&self) -> Topology {
        self.topology
    }

    fn query(&self, to: PartyId, kind: QueryKind, request: &QueryRequest) -> MpcResult<EcShare> {
        if !self.topology.contains(to) {
            return Err(MpcError::InvalidParameters(format!("{} is not part of the deployment", to)));
        }
        handle(self.party(to), kind, request)
    }
}

#[cfg(test)]
mod test {
    use super::{Client, ClientMap, HopOutcome, LocalDeployment, Path, RouteStatus};
    use crate::party::error::MpcError;
    use crate::party::test::TEST_CONFIG;
    use crate::party::Topology;
    use crate::query::QueryKind;
    use crate::share::{vertex_point, UNREACHABLE};
    use crate::table::PlainTable;

    fn deploy(owners: usize, replicas: usize) -> (LocalDeployment, ClientMap) {
        let table = PlainTable::directed_path(4);
        let map = ClientMap::from_table(&table);
        let deployment = LocalDeployment::start(Topology::new(owners, replicas).unwrap(), table, TEST_CONFIG).unwrap();
        assert!(deployment.recompute().unwrap().success);
        (deployment, map)
    }

    #[test]
    fn map_resolves_vertices_and_sentinel() {
        let map = ClientMap::new([1, 2, 3]);
        assert_eq!(map.resolve(&vertex_point(2)).unwrap(), HopOutcome::Next(2));
        assert_eq!(map.resolve(&UNREACHABLE).unwrap(), HopOutcome::Unreachable);
        assert!(matches!(map.resolve(&vertex_point(9)), Err(MpcError::UnknownHop)));
    }

    #[test]
    fn walks_the_path_honest_and_malicious() {
        let (deployment, map) = deploy(3, 1);
        let expected = Path { vertices: vec![1, 2, 3, 4], status: RouteStatus::Arrived };
        for kind in [QueryKind::Honest, QueryKind::Malicious] {
            let client = Client::new(&deployment, map.clone(), kind);
            assert_eq!(client.query_hop(1, 4).unwrap(), HopOutcome::Next(2));
            assert_eq!(client.query_hop(2, 4).unwrap(), HopOutcome::Next(3));
            assert_eq!(client.query_hop(3, 4).unwrap(), HopOutcome::Next(4));
            assert_eq!(client.route(1, 4).unwrap(), expected);
        }
        deployment.teardown().unwrap();
    }

    #[test]
    fn unreachable_is_not_an_error() {
        let (deployment, map) = deploy(3, 1);
        for kind in [QueryKind::Honest, QueryKind::Malicious] {
            let client = Client::new(&deployment, map.clone(), kind);
            assert_eq!(client.query_hop(4, 1).unwrap(), HopOutcome::Unreachable);
            assert_eq!(client.route(4, 1).unwrap(), Path { vertices: vec![4], status: RouteStatus::Unreachable });
        }
        deployment.teardown().unwrap();
    }

    #[test]
    fn old_epochs_are_evicted() {
        let (deployment, map) = deploy(3, 1);
        let first = Client::new(&deployment, map.clone(), QueryKind::Honest).with_epoch(1);
        assert_eq!(first.query_hop(1, 4).unwrap(), HopOutcome::Next(2));
        for _ in 0..3 {
            assert!(deployment.recompute().unwrap().success);
        }
        let current = deployment.party(crate::party::PartyId::new(1, 1)).store().current().unwrap();
        assert_eq!(current, 4);
        for kind in [QueryKind::Honest, QueryKind::Malicious] {
            for epoch in [current, current - 1, current - 2] {
                let client = Client::new(&deployment, map.clone(), kind).with_epoch(epoch);
                assert_eq!(client.query_hop(1, 4).unwrap(), HopOutcome::Next(2));
            }
            // epoch 1 was installed and served, then evicted by epoch 4
            let client = Client::new(&deployment, map.clone(), kind).with_epoch(current - 3);
            assert!(matches!(client.query_hop(1, 4), Err(MpcError::EpochNotFound(1))));
            assert!(matches!(client.route(1, 4), Err(MpcError::RouteAborted { .. })));
        }
        deployment.teardown().unwrap();
    }

    #[test]
    fn epoch_from_the_future_is_rejected() {
        let (deployment, map) = deploy(2, 1);
        let client = Client::new(&deployment, map, QueryKind::Honest).with_epoch(7);
        assert!(matches!(client.query_hop(1, 3), Err(MpcError::EpochNotFound(7))));
        // a failed hop aborts the walk and names it
        match client.route(1, 3) {
            Err(MpcError::RouteAborted { from, to, cause }) => {
                assert_eq!((from, to), (1, 3));
                assert!(matches!(*cause, MpcError::EpochNotFound(7)));
            }
            other => panic!("expected an aborted route, got {:?}", other),
        }
        deployment.teardown().unwrap();
    }

    #[test]
    fn replicated_deployments_answer_on_any_replica() {
        for (owners, replicas) in [(2, 3), (4, 2)] {
            let (deployment, map) = deploy(owners, replicas);
            for kind in [QueryKind::Honest, QueryKind::Malicious] {
                let client = Client::new(&deployment, map.clone(), kind);
                // the replica is drawn per query, repeat to hit several of them
                for _ in 0..4 {
                    assert_eq!(client.route(1, 4).unwrap().status, RouteStatus::Arrived);
                }
                assert_eq!(client.route(3, 2).unwrap().status, RouteStatus::Unreachable);
            }
            deployment.teardown().unwrap();
        }
    }
}
