use rand::seq::SliceRandom;
use rand::{CryptoRng, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::party::chunk::{chunk, combine};
use crate::party::error::MpcResult;
use crate::party::MainParty;

pub fn local_shuffle<T, R: Rng + CryptoRng>(items: &mut [T], rng: &mut R) {
    items.shuffle(rng);
}

/// Two-phase shuffle within the caller's clique.
///
/// Each replica shuffles its slice locally, then (with more than one replica) the slices are
/// chunked across the clique, recombined and shuffled again.
pub fn shuffle<T: Serialize + DeserializeOwned>(party: &MainParty, tag: &str, mut items: Vec<T>) -> MpcResult<Vec<T>> {
    let mut rng = ChaCha20Rng::from_entropy();
    local_shuffle(&mut items, &mut rng);

    let clique = party.topology.clique(party.id.owner);
    if clique.len() == 1 {
        return Ok(items);
    }
    chunk(party, &clique, tag, &items)?;
    let mut items = combine(party, clique, tag.to_string()).rcv(party.config.preprocessing_timeout)?;
    local_shuffle(&mut items, &mut rng);
    Ok(items)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::thread;

    use itertools::Itertools;
    use rand::thread_rng;

    use super::{local_shuffle, shuffle};
    use crate::party::test::{localhost_setup, teardown_all};
    use crate::table::PlainTable;

    fn multiset(items: &[u32]) -> HashMap<u32, usize> {
        items.iter().copied().counts()
    }

    #[test]
    fn local_shuffle_is_a_permutation() {
        let mut rng = thread_rng();
        for trial in 0..1000u32 {
            let len = trial % 50;
            // with repeated values
            let input: Vec<u32> = (0..len).map(|i| i % 7).collect();
            let mut output = input.clone();
            local_shuffle(&mut output, &mut rng);
            assert_eq!(output.len(), input.len());
            assert_eq!(multiset(&output), multiset(&input));
        }
    }

    #[test]
    fn local_shuffle_moves_things() {
        let input: Vec<u32> = (0..100).collect();
        let mut output = input.clone();
        local_shuffle(&mut output, &mut thread_rng());
        // 1/100! chance of a false failure
        assert_ne!(output, input);
    }

    #[test]
    fn clique_shuffle_is_a_permutation() {
        let parties = localhost_setup(2, 3, PlainTable::directed_path(3));
        for trial in 0..1000u32 {
            let tag = format!("shuffle:{}", trial);
            // uneven slices per replica, some empty, with repeated values
            let inputs: Vec<Vec<u32>> = (0..3u32).map(|r| (0..((trial * (r + 1)) % 23)).map(|i| 100 * r + i % 11).collect()).collect();
            let outputs: Vec<Vec<u32>> = thread::scope(|s| {
                let handles: Vec<_> = parties[0..3].iter().zip(&inputs)
                    .map(|(p, input)| {
                        let tag = &tag;
                        s.spawn(move || shuffle(p.party(), tag, input.clone()).unwrap())
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            // the clique as a whole holds exactly the rows it started with
            let all_in: Vec<u32> = inputs.concat();
            let all_out: Vec<u32> = outputs.concat();
            assert_eq!(all_out.len(), all_in.len());
            assert_eq!(multiset(&all_out), multiset(&all_in));
        }
        for p in &parties[0..3] {
            assert_eq!(p.party().chunks.pending(), 0);
        }
        teardown_all(parties);
    }

    #[test]
    fn single_replica_skips_second_phase() {
        let parties = localhost_setup(2, 1, PlainTable::directed_path(3));
        let input: Vec<u32> = (0..30).collect();
        let output = shuffle(parties[1].party(), "s", input.clone()).unwrap();
        assert_eq!(multiset(&output), multiset(&input));
        assert_eq!(parties[1].party().chunks.pending(), 0);
        teardown_all(parties);
    }
}
