//! Party side of a single hop query.
//!
//! A client sends one share of its query point to one replica of every owner. Each party
//! runs [handle] with that share and answers with one share of the next hop.
pub mod honest;
pub mod malicious;

use std::fmt::{self, Display, Formatter};
use std::sync::PoisonError;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::network::message::Tag;
use crate::party::error::{MpcError, MpcResult};
use crate::party::{MainParty, Role};
use crate::share::EcShare;
use crate::table::store::{Epoch, EpochKeys};

/// Every step tag either protocol receives on.
const STEPS: [&str; 4] = ["query", "query:chunk", "reply", "reply:chunk"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    Honest,
    Malicious,
}

impl Display for QueryKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Honest => f.write_str("honest"),
            Self::Malicious => f.write_str("malicious"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Unique per query across every in-flight query.
    pub id: String,
    /// `None` runs against the party's current epoch.
    ///
    /// Parties move to a new epoch when the install notice reaches them, so right after a
    /// recompute they can briefly disagree. Such a query times out; pin the epoch to avoid it.
    pub epoch: Option<Epoch>,
    pub share: EcShare,
}

/// Everything one party needs for one query.
pub(crate) struct QueryContext<'a> {
    pub party: &'a MainParty,
    pub epoch: Epoch,
    pub keys: EpochKeys,
    kind: QueryKind,
    id: &'a str,
}

impl<'a> QueryContext<'a> {
    fn key(&self) -> Tag {
        format!("{}:{}:{}", self.kind, self.epoch, self.id)
    }

    pub fn tag(&self, step: &str) -> Tag {
        format!("{}:{}", self.key(), step)
    }

    /// Frees every tag of this query. Messages that still arrive for it are dropped.
    fn abandon(&self) {
        for step in STEPS {
            let tag = self.tag(step);
            self.party.forwards.close(&tag);
            self.party.chunks.close(&tag);
        }
    }
}

/// Holds a query key in the party's running set until dropped.
struct InFlight<'a> {
    party: &'a MainParty,
    key: Tag,
}

impl<'a> InFlight<'a> {
    fn claim(party: &'a MainParty, key: Tag) -> MpcResult<Self> {
        let mut queries = party.queries.lock().unwrap_or_else(PoisonError::into_inner);
        if !queries.insert(key.clone()) {
            return Err(MpcError::InvalidParameters(format!("query {} is already running", key)));
        }
        Ok(Self { party, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.party.queries.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}

/// Answers one query with this party's share of the next hop.
///
/// A request whose id is already running here is rejected. On failure every tag of the query
/// is closed.
pub fn handle(party: &MainParty, kind: QueryKind, request: &QueryRequest) -> MpcResult<EcShare> {
    let (epoch, keys) = {
        let store = party.store();
        let epoch = store.resolve(request.epoch)?;
        (epoch, store.keys(epoch)?)
    };
    let context = QueryContext { party, epoch, keys, kind, id: &request.id };
    let _in_flight = InFlight::claim(party, context.key())?;
    debug!("{} handles {} query {} on epoch {}", party.id, kind, request.id, epoch);

    let result = match (kind, party.role()) {
        (QueryKind::Honest, Role::Backend) => honest::backend(&context, request.share),
        (QueryKind::Honest, Role::Frontend) => honest::frontend(&context, request.share),
        (QueryKind::Malicious, Role::Backend) => malicious::backend(&context, request.share),
        (QueryKind::Malicious, Role::Frontend) => malicious::frontend(&context, request.share),
    };
    if let Err(err) = &result {
        warn!("{} gave up on {} query {}: {}", party.id, kind, request.id, err);
        context.abandon();
    }
    result
}
