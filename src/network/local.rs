use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::sync::mpsc::{channel, Receiver};

use super::message::Message;
use super::{Inbound, Inbox, Transport};
use crate::party::error::{MpcError, MpcResult};
use crate::party::{PartyId, Topology};

/// In-process transport: every party's inbox is a channel.
pub struct LocalTransport {
    me: PartyId,
    peers: HashMap<PartyId, Inbox>,
}

/// Creates one connected transport and inbox per party of `topology`.
pub fn local_network(topology: &Topology) -> Vec<(LocalTransport, Inbox, Receiver<Inbound>)> {
    let ids = topology.all();
    let channels: Vec<_> = ids.iter().map(|_| channel()).collect();
    let inboxes: HashMap<PartyId, Inbox> = ids.iter().copied()
        .zip(channels.iter().map(|(send, _)| send.clone()))
        .collect();
    ids.into_iter().zip(channels).map(|(me, (inbox, rcv))| {
        (LocalTransport { me, peers: inboxes.clone() }, inbox, rcv)
    }).collect()
}

impl Transport for LocalTransport {
    fn send(&self, to: PartyId, message: Message) -> MpcResult<()> {
        let inbox = self.peers.get(&to)
            .ok_or(MpcError::InvalidParameters(format!("unknown party {}", to)))?;
        inbox.send(Inbound::Message { from: self.me, message })
            .map_err(|_| MpcError::Io(io::Error::new(ErrorKind::NotConnected, format!("{} is not running", to))))
    }
}

#[cfg(test)]
mod test {
    use super::local_network;
    use crate::network::message::Message;
    use crate::network::{Inbound, Transport};
    use crate::party::{PartyId, Topology};

    #[test]
    fn delivers_to_the_addressed_party() {
        let topology = Topology::new(2, 2).unwrap();
        let network = local_network(&topology);
        let (t, _, _) = &network[0];
        t.send(PartyId::new(2, 2), Message::Start { epoch: 1 }).unwrap();
        match network[3].2.try_recv().unwrap() {
            Inbound::Message { from, message } => {
                assert_eq!(from, PartyId::new(1, 1));
                assert_eq!(message, Message::Start { epoch: 1 });
            }
            Inbound::Shutdown => panic!("unexpected shutdown"),
        }
        assert!(network[1].2.try_recv().is_err());
        assert!(t.send(PartyId::new(3, 1), Message::Start { epoch: 1 }).is_err());
    }
}
