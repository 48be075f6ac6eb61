use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::network::message::Tag;
use crate::share::VertexId;
use crate::table::TableError;

pub type MpcResult<T> = Result<T, MpcError>;

#[derive(Debug, Error)]
pub enum MpcError {
    #[error("IoError({0})")]
    Io(#[from] io::Error),
    #[error("CodecError({0})")]
    Codec(#[from] bincode::Error),
    #[error("ConfigError({0})")]
    Config(String),
    #[error("RecvError")]
    Receive,
    #[error("no message for tag {tag} within {timeout:?}")]
    Timeout { tag: Tag, timeout: Duration },
    #[error("epoch {0} not found")]
    EpochNotFound(u64),
    #[error("ArithmeticError({0})")]
    Arithmetic(&'static str),
    #[error("invalid share encoding: {0}")]
    InvalidShare(String),
    #[error("expected a {expected} share")]
    UnexpectedShare { expected: &'static str },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("garbled query does not match any table entry")]
    UnknownEntry,
    #[error("reconstructed hop does not correspond to any known vertex")]
    UnknownHop,
    #[error("only the backend leader may start a recomputation")]
    NotLeader,
    #[error("InvalidParameters({0})")]
    InvalidParameters(String),
    #[error("OperationFailed({0})")]
    OperationFailed(String),
    #[error("route aborted at hop {from} -> {to}: {cause}")]
    RouteAborted { from: VertexId, to: VertexId, cause: Box<MpcError> },
}

impl From<oneshot::RecvError> for MpcError {
    fn from(_err: oneshot::RecvError) -> Self {
        Self::Receive
    }
}
