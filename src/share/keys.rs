use curve25519_dalek::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use super::random_nonzero_scalar;
use crate::party::error::{MpcError, MpcResult};

/// Per-owner, per-epoch garbling keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub src_dest: Scalar,
    pub next_hop: Scalar,
}

impl KeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> MpcResult<Self> {
        Ok(Self {
            src_dest: random_nonzero_scalar(rng)?,
            next_hop: random_nonzero_scalar(rng)?,
        })
    }
}

pub fn inverse(k: &Scalar) -> MpcResult<Scalar> {
    if *k == Scalar::ZERO {
        return Err(MpcError::Arithmetic("zero has no inverse"));
    }
    Ok(k.invert())
}

/// Returns `(r, r^-1)` for a fresh random `r`.
pub fn identity_pair<R: RngCore + CryptoRng>(rng: &mut R) -> MpcResult<(Scalar, Scalar)> {
    let r = random_nonzero_scalar(rng)?;
    Ok((r, inverse(&r)?))
}
