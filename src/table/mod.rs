//! Plaintext next-hop tables and their garbled, backend-local counterparts.
pub mod garble;
pub mod store;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::RistrettoPoint;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::party::error::{MpcError, MpcResult};
use crate::share::{pair_point, vertex_point, VertexId, UNREACHABLE};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("garbled table has {actual} rows, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("duplicate garbled key {0}")]
    Duplicate(String),
}

/// One table row: hashed `(src, dest)` pair and hashed next hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub src_dest: RistrettoPoint,
    pub next_hop: RistrettoPoint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub src: VertexId,
    pub dest: VertexId,
    /// `None` if `dest` cannot be reached from `src`.
    pub next: Option<VertexId>,
}

impl Route {
    pub fn to_row(&self) -> Row {
        Row {
            src_dest: pair_point(self.src, self.dest),
            next_hop: self.next.map(vertex_point).unwrap_or(*UNREACHABLE),
        }
    }
}

#[derive(Deserialize)]
struct SerializedTable {
    route: Vec<Route>,
}

/// The plaintext table, supplied once at process start.
#[derive(Clone, Debug)]
pub struct PlainTable {
    routes: Vec<Route>,
    rows: Vec<Row>,
}

impl PlainTable {
    pub fn new(routes: Vec<Route>) -> Self {
        let rows = routes.iter().map(Route::to_row).collect();
        Self { routes, rows }
    }

    pub fn from_file(path: &Path) -> MpcResult<Self> {
        let content = fs::read_to_string(path)?;
        let parsed: SerializedTable = toml::from_str(&content)
            .map_err(|err| MpcError::Config(format!("{}: {}", path.display(), err)))?;
        Ok(Self::new(parsed.route))
    }

    /// A directed path `1 -> 2 -> ... -> n`; walking backwards is unreachable.
    pub fn directed_path(n: VertexId) -> Self {
        let mut routes = Vec::new();
        for src in 1..=n {
            for dest in 1..=n {
                if src == dest {
                    continue;
                }
                let next = if src < dest { Some(src + 1) } else { None };
                routes.push(Route { src, dest, next });
            }
        }
        Self::new(routes)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Every vertex mentioned in the table.
    pub fn vertices(&self) -> BTreeSet<VertexId> {
        let mut vertices = BTreeSet::new();
        for r in &self.routes {
            vertices.insert(r.src);
            vertices.insert(r.dest);
            if let Some(next) = r.next {
                vertices.insert(next);
            }
        }
        vertices
    }

    /// The contiguous slice assigned to `replica` (1-based) out of `replicas`, ceil-sized.
    pub fn chunk_for(&self, replica: usize, replicas: usize) -> Vec<Row> {
        chunk_range(self.rows.len(), replica - 1, replicas)
            .map(|range| self.rows[range].to_vec())
            .unwrap_or_default()
    }
}

/// The range of slice `index` when splitting `len` items into `parts` ceil-sized slices.
pub(crate) fn chunk_range(len: usize, index: usize, parts: usize) -> Option<std::ops::Range<usize>> {
    let size = len.div_ceil(parts);
    let start = index * size;
    if start >= len {
        return None;
    }
    Some(start..usize::min(start + size, len))
}

/// A garbled lookup table, keyed by the compressed garbled `src_dest` point.
#[derive(Debug, Default)]
pub struct GarbledTable {
    lookup: HashMap<CompressedRistretto, RistrettoPoint>,
}

impl GarbledTable {
    /// Fails on a size mismatch with the plaintext table or on any duplicate key.
    pub fn build(rows: Vec<Row>, expected_len: usize) -> Result<Self, TableError> {
        if rows.len() != expected_len {
            warn!("garbled table has {} rows, plaintext table has {}", rows.len(), expected_len);
            return Err(TableError::SizeMismatch { expected: expected_len, actual: rows.len() });
        }
        let mut lookup = HashMap::with_capacity(rows.len());
        for row in rows {
            let key = row.src_dest.compress();
            if lookup.insert(key, row.next_hop).is_some() {
                warn!("duplicates found in garbled table");
                return Err(TableError::Duplicate(hex::encode(key.as_bytes())));
            }
        }
        Ok(Self { lookup })
    }

    pub fn lookup(&self, garbled_query: &RistrettoPoint) -> Option<RistrettoPoint> {
        self.lookup.get(&garbled_query.compress()).copied()
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}
