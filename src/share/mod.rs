//! Curve glue for the multiplicative EC secret sharing.
//!
//! All points live in the Ristretto255 group and all scalars are reduced modulo its order.
pub mod ecmpc;
pub mod keys;

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::Scalar;
use lazy_static::lazy_static;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha512;

use crate::party::error::{MpcError, MpcResult};

pub type VertexId = u64;

const PAIR_DOMAIN: &[u8] = b"drivacy:pair";
const VERTEX_DOMAIN: &[u8] = b"drivacy:vertex";
const UNREACHABLE_DOMAIN: &[u8] = b"drivacy:unreachable";

lazy_static! {
    /// Next hop of every (src, dest) pair without a path.
    pub static ref UNREACHABLE: RistrettoPoint = hash_to_point(UNREACHABLE_DOMAIN);
}

pub fn hash_to_point(bytes: &[u8]) -> RistrettoPoint {
    RistrettoPoint::hash_from_bytes::<Sha512>(bytes)
}

/// The query point of the pair (src, dest).
pub fn pair_point(src: VertexId, dest: VertexId) -> RistrettoPoint {
    let mut bytes = Vec::with_capacity(PAIR_DOMAIN.len() + 16);
    bytes.extend_from_slice(PAIR_DOMAIN);
    bytes.extend_from_slice(&src.to_le_bytes());
    bytes.extend_from_slice(&dest.to_le_bytes());
    hash_to_point(&bytes)
}

pub fn vertex_point(vertex: VertexId) -> RistrettoPoint {
    let mut bytes = Vec::with_capacity(VERTEX_DOMAIN.len() + 8);
    bytes.extend_from_slice(VERTEX_DOMAIN);
    bytes.extend_from_slice(&vertex.to_le_bytes());
    hash_to_point(&bytes)
}

/// Draws a uniform scalar and rejects zero, the only non-invertible element.
pub fn random_nonzero_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> MpcResult<Scalar> {
    let s = Scalar::random(rng);
    if s == Scalar::ZERO {
        return Err(MpcError::Arithmetic("drew a zero scalar"));
    }
    Ok(s)
}

const POINT_KIND: u8 = 0x01;
const SCALAR_KIND: u8 = 0x02;

/// A single share of a multiplicatively shared point.
///
/// The first share of a sharing is the masked point, every other share is a bare scalar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcShare {
    Point(RistrettoPoint),
    Scalar(Scalar),
}

impl EcShare {
    pub fn as_point(&self) -> MpcResult<RistrettoPoint> {
        match self {
            Self::Point(p) => Ok(*p),
            Self::Scalar(_) => Err(MpcError::UnexpectedShare { expected: "point" }),
        }
    }

    pub fn as_scalar(&self) -> MpcResult<Scalar> {
        match self {
            Self::Scalar(s) => Ok(*s),
            Self::Point(_) => Err(MpcError::UnexpectedShare { expected: "scalar" }),
        }
    }

    pub fn to_bytes(&self) -> [u8; 33] {
        let mut bytes = [0u8; 33];
        match self {
            Self::Point(p) => {
                bytes[0] = POINT_KIND;
                bytes[1..].copy_from_slice(p.compress().as_bytes());
            }
            Self::Scalar(s) => {
                bytes[0] = SCALAR_KIND;
                bytes[1..].copy_from_slice(s.as_bytes());
            }
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> MpcResult<Self> {
        if bytes.len() != 33 {
            return Err(MpcError::InvalidShare(format!("expected 33 bytes, got {}", bytes.len())));
        }
        let mut body = [0u8; 32];
        body.copy_from_slice(&bytes[1..]);
        match bytes[0] {
            POINT_KIND => CompressedRistretto(body)
                .decompress()
                .map(Self::Point)
                .ok_or_else(|| MpcError::InvalidShare("not a valid ristretto point".to_string())),
            SCALAR_KIND => Option::<Scalar>::from(Scalar::from_canonical_bytes(body))
                .map(Self::Scalar)
                .ok_or_else(|| MpcError::InvalidShare("non-canonical scalar".to_string())),
            kind => Err(MpcError::InvalidShare(format!("unknown share kind {:#04x}", kind))),
        }
    }
}

impl Display for EcShare {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl FromStr for EcShare {
    type Err = MpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|err| MpcError::InvalidShare(err.to_string()))?;
        Self::from_bytes(&bytes)
    }
}
