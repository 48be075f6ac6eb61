//! Malicious-client resolution.
//!
//! The query point travels once around the ring. Every frontend folds its share and key into
//! it and blinds it with a fresh `r`, sending `r^-1` to the backend out of band. The reply
//! travels back the other way, again blinded at every hop but the first frontend.
//!
//! The client swaps its first two shares before sending, so the backend holds a scalar and
//! the first frontend holds the masked point.
use curve25519_dalek::{RistrettoPoint, Scalar};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use super::QueryContext;
use crate::party::chunk::{chunk, combine};
use crate::party::error::{MpcError, MpcResult};
use crate::party::forward::{self, forward, Direction};
use crate::party::BACKEND;
use crate::share::ecmpc::{reconstruct, share};
use crate::share::keys::identity_pair;
use crate::share::EcShare;

const FIRST_FRONTEND: usize = BACKEND + 1;

pub(crate) fn frontend(context: &QueryContext, client_share: EcShare) -> MpcResult<EcShare> {
    let mut rng = ChaCha20Rng::from_entropy();
    garble(context, client_share, &mut rng)?;
    degarble(context, &mut rng)
}

fn garble(context: &QueryContext, client_share: EcShare, rng: &mut ChaCha20Rng) -> MpcResult<()> {
    let party = context.party;
    let timeout = party.config.timeout;
    let (point, mut scalar) = if party.id.owner == FIRST_FRONTEND {
        (client_share.as_point()?, Scalar::ONE)
    } else {
        let scalar = client_share.as_scalar()?;
        let point: RistrettoPoint = forward::get(party, context.tag("query")).rcv(timeout)?;
        (point, scalar)
    };

    let (r, r_inv) = identity_pair(rng)?;
    scalar *= r * context.keys.key.src_dest;
    forward(party, &context.tag("query"), &(point * scalar), Direction::Next)?;
    let backend = party.topology.backend(party.id.replica);
    chunk(party, &[backend], &context.tag("query:chunk"), &[r_inv])
}

fn degarble(context: &QueryContext, rng: &mut ChaCha20Rng) -> MpcResult<EcShare> {
    let party = context.party;
    let timeout = party.config.timeout;
    let backend = party.topology.backend(party.id.replica);
    let reply: Vec<EcShare> = combine(party, vec![backend], context.tag("reply:chunk")).rcv(timeout)?;
    let reply = reply.first().ok_or_else(|| MpcError::OperationFailed("empty reply chunk".to_string()))?;

    let (point, mut scalar) = if party.id.owner == party.topology.last_owner() {
        (reply.as_point()?, Scalar::ONE)
    } else {
        let point: RistrettoPoint = forward::get(party, context.tag("reply")).rcv(timeout)?;
        (point, reply.as_scalar()?)
    };

    if party.id.owner == FIRST_FRONTEND {
        return Ok(EcShare::Point(point * scalar * context.keys.inv_next_hop));
    }
    let (r, r_inv) = identity_pair(rng)?;
    scalar *= r * context.keys.inv_next_hop;
    forward(party, &context.tag("reply"), &(point * scalar), Direction::Previous)?;
    Ok(EcShare::Scalar(r_inv))
}

pub(crate) fn backend(context: &QueryContext, client_share: EcShare) -> MpcResult<EcShare> {
    let party = context.party;
    let timeout = party.config.timeout;
    let own = client_share.as_scalar()?;
    let frontends = party.topology.frontends(party.id.replica);

    let point: RistrettoPoint = forward::get(party, context.tag("query")).rcv(timeout)?;
    let mut scalars: Vec<Scalar> = combine(party, frontends.clone(), context.tag("query:chunk")).rcv(timeout)?;
    scalars.push(own * context.keys.key.src_dest);

    let mut shares = Vec::with_capacity(scalars.len() + 1);
    shares.push(EcShare::Point(point));
    shares.extend(scalars.into_iter().map(EcShare::Scalar));
    let garbled_query = reconstruct(&shares)?;

    let table = party.store().table(context.epoch)?;
    let garbled_hop = table.lookup(&garbled_query).ok_or(MpcError::UnknownEntry)?;
    debug!("{} found the garbled hop of {}", party.id, context.tag("query"));

    let mut rng = ChaCha20Rng::from_entropy();
    let hop_shares = share(&garbled_hop, party.topology.owners(), &mut rng)?;
    // frontends get the scalars in ring order, the last one the masked point
    let mut replies = hop_shares[2..].to_vec();
    replies.push(hop_shares[0]);
    chunk(party, &frontends, &context.tag("reply:chunk"), &replies)?;
    Ok(EcShare::Scalar(hop_shares[1].as_scalar()? * context.keys.inv_next_hop))
}
