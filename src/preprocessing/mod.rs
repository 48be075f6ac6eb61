//! Per-epoch preprocessing: key replication, garbling, oblivious shuffle and ring propagation
//! of the table, ending with an installed garbled table at every backend replica.
pub mod shuffle;

use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::{debug, info, warn};

use crate::network::message::{Message, Tag};
use crate::party::broadcast::{self, broadcast};
use crate::party::chunk::{chunk, combine, replicate};
use crate::party::error::{MpcError, MpcResult};
use crate::party::forward::{self, forward, Direction};
use crate::party::{MainParty, PartyId, Role, BACKEND};
use crate::share::keys::KeyPair;
use crate::table::garble::garble_table;
use crate::table::store::{Epoch, EpochKeys};
use crate::table::{GarbledTable, Row};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecomputeReport {
    pub epoch: Epoch,
    pub success: bool,
    pub duration: Duration,
}

fn tag(epoch: Epoch, step: &str) -> Tag {
    format!("preprocess:{}:{}", epoch, step)
}

/// The clique leader draws the epoch keys, every replica receives and stores them.
fn replicate_key(party: &MainParty, epoch: Epoch) -> MpcResult<EpochKeys> {
    let key_tag = tag(epoch, "key");
    if party.is_leader() {
        let mut rng = ChaCha20Rng::from_entropy();
        broadcast(party, &key_tag, &KeyPair::generate(&mut rng)?)?;
    }
    let key: KeyPair = broadcast::get(party, key_tag).rcv(party.config.preprocessing_timeout)?;
    party.store_mut().insert_keys(epoch, key)
}

/// Runs this party's part of the pipeline. Backends return the full garbled table.
fn preprocess(party: &MainParty, epoch: Epoch) -> MpcResult<Option<Vec<Row>>> {
    let timeout = party.config.preprocessing_timeout;
    let keys = replicate_key(party, epoch)?;

    let mut rows: Vec<Row> = match party.role() {
        Role::Backend => party.plain_table()?.chunk_for(party.id.replica, party.topology.replicas()),
        Role::Frontend => forward::get(party, tag(epoch, "forward")).rcv(timeout)?,
    };

    debug!("{} begins core preprocessing #{} with {} rows", party.id, epoch, rows.len());
    let start = Instant::now();
    party.run_in_threadpool(|| garble_table(&mut rows, &keys.key));
    let rows = shuffle::shuffle(party, &tag(epoch, "shuffle"), rows)?;
    debug!("{} finished core preprocessing #{} in {:?}", party.id, epoch, start.elapsed());

    if party.id.owner < party.topology.last_owner() {
        forward(party, &tag(epoch, "forward"), &rows, Direction::Next)?;
    } else {
        // every backend gets a full copy so that it can answer any query
        replicate(party, &party.topology.clique(BACKEND), &tag(epoch, "final"), &rows)?;
    }

    if party.role() == Role::Backend {
        let last = party.topology.clique(party.topology.last_owner());
        return Ok(Some(combine(party, last, tag(epoch, "final")).rcv(timeout)?));
    }
    Ok(None)
}

/// Builds and stores the garbled table. The live epoch is untouched on failure.
fn install(party: &MainParty, epoch: Epoch, rows: Vec<Row>) -> MpcResult<()> {
    let expected_len = party.plain_table()?.len();
    let table = GarbledTable::build(rows, expected_len)?;
    party.store_mut().install(epoch, table);
    Ok(())
}

/// Runs preprocessing of `epoch` on this party. Backends report their install status to
/// the backend leader.
///
/// `acknowledge` tells the leader this party started; the leader itself skips it.
pub fn run_epoch(party: &MainParty, epoch: Epoch, acknowledge: bool) {
    let leader = party.topology.backend_leader();
    party.store_mut().observe(epoch);
    if acknowledge {
        if let Err(err) = chunk(party, &[leader], &tag(epoch, "ready"), &[true]) {
            warn!("{} cannot acknowledge epoch {}: {}", party.id, epoch, err);
            return;
        }
    }

    let outcome = preprocess(party, epoch);
    match party.role() {
        Role::Backend => {
            let installed = outcome.and_then(|rows| match rows {
                Some(rows) => install(party, epoch, rows),
                None => Err(MpcError::OperationFailed("backend preprocessing returned no table".to_string())),
            });
            if let Err(err) = &installed {
                warn!("{} failed to install epoch {}: {}", party.id, epoch, err);
            }
            if let Err(err) = chunk(party, &[leader], &tag(epoch, "status"), &[installed.is_ok()]) {
                warn!("{} cannot report status of epoch {}: {}", party.id, epoch, err);
            }
        }
        Role::Frontend => {
            if let Err(err) = outcome {
                warn!("{} failed preprocessing of epoch {}: {}", party.id, epoch, err);
            }
        }
    }
}

/// Starts a new epoch on every party and waits until it is installed or failed.
///
/// Only callable at the backend leader. A failed round is not retried; the next call uses
/// a fresh epoch number.
pub fn recompute(party: &MainParty) -> MpcResult<RecomputeReport> {
    if party.id != party.topology.backend_leader() {
        return Err(MpcError::NotLeader);
    }
    let start = Instant::now();
    let timeout = party.config.preprocessing_timeout;
    let epoch = party.store_mut().next_epoch();
    let others: Vec<PartyId> = party.topology.all().into_iter().filter(|id| *id != party.id).collect();
    info!("starting recompute #{}", epoch);

    for to in &others {
        party.send(*to, Message::Start { epoch })?;
    }
    let ready = combine::<bool>(party, others.clone(), tag(epoch, "ready")).rcv(timeout);

    let success = match ready {
        Ok(_) => {
            run_epoch(party, epoch, false);
            let backends = party.topology.clique(BACKEND);
            match combine::<bool>(party, backends, tag(epoch, "status")).rcv(timeout) {
                Ok(statuses) => statuses.iter().all(|s| *s),
                Err(err) => {
                    warn!("missing install status for epoch {}: {}", epoch, err);
                    false
                }
            }
        }
        Err(err) => {
            warn!("not every party started epoch {}: {}", epoch, err);
            false
        }
    };

    party.store_mut().finish(epoch, success);
    for to in &others {
        party.send(*to, Message::Install { epoch, success })?;
    }
    let duration = start.elapsed();
    info!("recompute #{} {} after {:?}", epoch, if success { "succeeded" } else { "failed" }, duration);
    Ok(RecomputeReport { epoch, success, duration })
}
