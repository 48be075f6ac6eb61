//! Honest-client resolution: every frontend garbles its own share and hands it straight to
//! the backend, which reconstructs, looks up and re-shares the garbled next hop.
use curve25519_dalek::Scalar;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use super::QueryContext;
use crate::party::chunk::{chunk, combine};
use crate::party::error::{MpcError, MpcResult};
use crate::share::ecmpc::{reconstruct, share};
use crate::share::EcShare;

pub(crate) fn frontend(context: &QueryContext, client_share: EcShare) -> MpcResult<EcShare> {
    let party = context.party;
    let backend = party.topology.backend(party.id.replica);
    let garbled = client_share.as_scalar()? * context.keys.key.src_dest;
    chunk(party, &[backend], &context.tag("query"), &[garbled])?;

    let reply: Vec<Scalar> = combine(party, vec![backend], context.tag("reply")).rcv(party.config.timeout)?;
    let reply = reply.first().ok_or_else(|| MpcError::OperationFailed("empty reply chunk".to_string()))?;
    Ok(EcShare::Scalar(reply * context.keys.inv_next_hop))
}

pub(crate) fn backend(context: &QueryContext, client_share: EcShare) -> MpcResult<EcShare> {
    let party = context.party;
    let point = client_share.as_point()?;
    let frontends = party.topology.frontends(party.id.replica);
    let mut scalars: Vec<Scalar> = combine(party, frontends.clone(), context.tag("query")).rcv(party.config.timeout)?;
    let first = scalars.first_mut().ok_or_else(|| MpcError::OperationFailed("no frontend shares".to_string()))?;
    *first *= context.keys.key.src_dest;

    let mut shares = Vec::with_capacity(scalars.len() + 1);
    shares.push(EcShare::Point(point));
    shares.extend(scalars.into_iter().map(EcShare::Scalar));
    let garbled_query = reconstruct(&shares)?;

    let table = party.store().table(context.epoch)?;
    let garbled_hop = table.lookup(&garbled_query).ok_or(MpcError::UnknownEntry)?;
    debug!("{} found the garbled hop of {}", party.id, context.tag("query"));

    let mut rng = ChaCha20Rng::from_entropy();
    let hop_shares = share(&garbled_hop, party.topology.owners(), &mut rng)?;
    let mut replies = hop_shares[1..]
        .iter()
        .map(EcShare::as_scalar)
        .collect::<MpcResult<Vec<Scalar>>>()?;
    replies[0] *= context.keys.inv_next_hop;
    chunk(party, &frontends, &context.tag("reply"), &replies)?;
    Ok(hop_shares[0])
}
