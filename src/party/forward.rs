//! Hand-off along the ring of owners.
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::MpcResult;
use super::mailbox::TagReceiver;
use super::MainParty;
use crate::network::message::{encode, Message, Tag};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

/// Sends `msg` to the same replica of the next (or previous) owner.
pub fn forward<T: Serialize + ?Sized>(party: &MainParty, tag: &str, msg: &T, direction: Direction) -> MpcResult<()> {
    let to = match direction {
        Direction::Next => party.topology.next(party.id),
        Direction::Previous => party.topology.prev(party.id),
    };
    party.send(to, Message::Forward { tag: tag.to_string(), payload: encode(msg)? })
}

pub fn get<T: DeserializeOwned>(party: &MainParty, tag: Tag) -> TagReceiver<'_, T> {
    party.forwards.receive(tag)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{forward, get, Direction};
    use crate::party::test::{localhost_setup, teardown_all};
    use crate::table::PlainTable;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn forward_walks_the_ring_both_ways() {
        // 3 owners x 2 replicas
        let parties = localhost_setup(3, 2, PlainTable::directed_path(3));
        let p12 = parties[1].party();
        let p32 = parties[5].party();
        forward(p32, "f", "to backend", Direction::Next).unwrap();
        assert_eq!(get::<String>(p12, "f".to_string()).rcv(WAIT).unwrap(), "to backend");
        forward(p12, "g", &5u32, Direction::Previous).unwrap();
        assert_eq!(get::<u32>(p32, "g".to_string()).rcv(WAIT).unwrap(), 5);
        teardown_all(parties);
    }
}
