//! Scatter an array over several parties and gather it back.
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::MpcResult;
use super::mailbox::ChunkReceiver;
use super::{MainParty, PartyId};
use crate::network::message::{encode, Message, Tag};
use crate::table::chunk_range;

fn send_chunk(party: &MainParty, to: PartyId, tag: &str, payload: Vec<u8>) -> MpcResult<()> {
    if to == party.id {
        party.chunks.deliver(tag.to_string(), party.id, payload);
        return Ok(());
    }
    party.send(to, Message::Chunk { tag: tag.to_string(), payload })
}

/// Splits `items` into `ids.len()` contiguous ceil-sized slices and sends slice `i` to `ids[i]`.
///
/// Trailing parties may receive empty slices.
pub fn chunk<T: Serialize>(party: &MainParty, ids: &[PartyId], tag: &str, items: &[T]) -> MpcResult<()> {
    for (i, to) in ids.iter().enumerate() {
        let slice = chunk_range(items.len(), i, ids.len())
            .map(|range| &items[range])
            .unwrap_or(&[]);
        send_chunk(party, *to, tag, encode(slice)?)?;
    }
    Ok(())
}

/// Sends all of `items` to each of `ids`.
pub fn replicate<T: Serialize>(party: &MainParty, ids: &[PartyId], tag: &str, items: &[T]) -> MpcResult<()> {
    let payload = encode(items)?;
    for to in ids {
        send_chunk(party, *to, tag, payload.clone())?;
    }
    Ok(())
}

/// Waits for one chunk from every party in `ids` and concatenates them in that order.
pub fn combine<T: DeserializeOwned>(party: &MainParty, ids: Vec<PartyId>, tag: Tag) -> ChunkReceiver<'_, T> {
    party.chunks.combine(ids, tag)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{chunk, combine, replicate};
    use crate::party::test::{localhost_setup, teardown_all};
    use crate::table::PlainTable;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn combine_gathers_in_id_order() {
        let parties = localhost_setup(2, 3, PlainTable::directed_path(3));
        let clique: Vec<_> = parties[0..3].iter().map(|p| p.party().id).collect();
        let target = clique[1];
        // senders go in reverse order
        for p in parties[0..3].iter().rev() {
            let r = p.party().id.replica as u32;
            chunk(p.party(), &[target], "g", &[r, r * 10]).unwrap();
        }
        let combined = combine::<u32>(parties[1].party(), clique, "g".to_string()).rcv(WAIT).unwrap();
        assert_eq!(combined, vec![1, 10, 2, 20, 3, 30]);
        teardown_all(parties);
    }

    #[test]
    fn slices_are_ceil_sized() {
        let parties = localhost_setup(2, 3, PlainTable::directed_path(3));
        let clique: Vec<_> = parties[0..3].iter().map(|p| p.party().id).collect();
        let leader = parties[0].party();
        chunk(leader, &clique, "c", &[1u8, 2, 3, 4]).unwrap();
        let sizes: Vec<usize> = parties[0..3].iter()
            .map(|p| combine::<u8>(p.party(), vec![leader.id], "c".to_string()).rcv(WAIT).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 0]);

        replicate(leader, &clique, "r", &[9u8, 9]).unwrap();
        for p in &parties[0..3] {
            assert_eq!(combine::<u8>(p.party(), vec![leader.id], "r".to_string()).rcv(WAIT).unwrap(), vec![9, 9]);
        }
        teardown_all(parties);
    }
}
