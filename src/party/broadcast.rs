//! Leader-to-clique broadcast.
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::error::MpcResult;
use super::mailbox::TagReceiver;
use super::MainParty;
use crate::network::message::{encode, Message, Tag};

/// Sends `msg` to every replica of the caller's clique, the caller included.
///
/// Only the clique leader may broadcast; for anyone else the message is dropped.
pub fn broadcast<T: Serialize>(party: &MainParty, tag: &str, msg: &T) -> MpcResult<()> {
    if !party.is_leader() {
        warn!("{} is not the leader of its clique, broadcast on {} dropped", party.id, tag);
        return Ok(());
    }
    let payload = encode(msg)?;
    for to in party.topology.clique(party.id.owner) {
        party.send(to, Message::Broadcast { tag: tag.to_string(), payload: payload.clone() })?;
    }
    Ok(())
}

/// Waits for the leader's broadcast on `tag`.
pub fn get<T: DeserializeOwned>(party: &MainParty, tag: Tag) -> TagReceiver<'_, T> {
    party.broadcasts.receive(tag)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{broadcast, get};
    use crate::party::error::MpcError;
    use crate::party::test::{localhost_setup, teardown_all};
    use crate::table::PlainTable;

    #[test]
    fn leader_reaches_every_sibling() {
        let parties = localhost_setup(2, 3, PlainTable::directed_path(3));
        // P2.1
        let leader = parties[3].party();
        broadcast(leader, "b", &vec![7u64, 8]).unwrap();
        for p in &parties[3..6] {
            assert_eq!(get::<Vec<u64>>(p.party(), "b".to_string()).rcv(Duration::from_secs(5)).unwrap(), vec![7, 8]);
        }
        // the other clique saw nothing
        assert!(matches!(get::<Vec<u64>>(parties[0].party(), "b".to_string()).rcv(Duration::from_millis(50)), Err(MpcError::Timeout { .. })));
        teardown_all(parties);
    }

    #[test]
    fn non_leader_broadcast_is_dropped() {
        let parties = localhost_setup(2, 2, PlainTable::directed_path(3));
        broadcast(parties[1].party(), "x", &1u8).unwrap();
        for p in &parties[0..2] {
            assert!(get::<u8>(p.party(), "x".to_string()).rcv(Duration::from_millis(50)).is_err());
        }
        teardown_all(parties);
    }
}
