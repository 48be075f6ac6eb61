use std::collections::HashMap;

use rayon::prelude::*;

use super::Row;
use crate::share::keys::KeyPair;

/// Garbles the rows in place: `src_dest·k_src` and `next_hop·k_next`.
///
/// Equal next hops garble to the same point and are computed only once.
pub fn garble_table(rows: &mut [Row], key: &KeyPair) {
    rows.par_iter_mut().for_each(|row| row.src_dest *= key.src_dest);

    let mut memo = HashMap::new();
    for row in rows.iter_mut() {
        let plain = row.next_hop;
        row.next_hop = *memo
            .entry(plain.compress())
            .or_insert_with(|| plain * key.next_hop);
    }
}
