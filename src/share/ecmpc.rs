//! n-out-of-n multiplicative sharing of Ristretto points.
//!
//! A point `P` is shared as `[P·m0, m1, ..., m(n-2), (m0·m1·...·m(n-2))^-1]`; multiplying the
//! masked point by every scalar share unmasks it.
use curve25519_dalek::{RistrettoPoint, Scalar};
use rand::{CryptoRng, RngCore};

use super::keys::inverse;
use super::{random_nonzero_scalar, EcShare};
use crate::party::error::{MpcError, MpcResult};

pub fn share<R: RngCore + CryptoRng>(point: &RistrettoPoint, party_count: usize, rng: &mut R) -> MpcResult<Vec<EcShare>> {
    if party_count < 2 {
        return Err(MpcError::InvalidParameters(format!("cannot share among {} parties", party_count)));
    }
    let masks = (0..party_count - 1)
        .map(|_| random_nonzero_scalar(rng))
        .collect::<MpcResult<Vec<_>>>()?;
    let mult = masks.iter().fold(Scalar::ONE, |acc, m| acc * m);

    let mut shares = Vec::with_capacity(party_count);
    shares.push(EcShare::Point(point * masks[0]));
    shares.extend(masks[1..].iter().map(|m| EcShare::Scalar(*m)));
    shares.push(EcShare::Scalar(inverse(&mult)?));
    Ok(shares)
}

/// Expects the point share first, followed by any number of scalar shares.
pub fn reconstruct(shares: &[EcShare]) -> MpcResult<RistrettoPoint> {
    let (first, rest) = shares
        .split_first()
        .ok_or_else(|| MpcError::InvalidParameters("no shares to reconstruct".to_string()))?;
    let point = first.as_point()?;
    let mut product = Scalar::ONE;
    for s in rest {
        product *= s.as_scalar()?;
    }
    Ok(point * product)
}
