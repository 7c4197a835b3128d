use std::collections::BTreeMap;

use bytes::Bytes;
use crossbeam_channel::Sender;

use paxos::message::PaxosMsg;
use paxos::network::Transport;
use paxos::NodeId;

/// What a node thread can be asked to do.
#[derive(Debug)]
pub enum Command {
    /// Queue a client value for the node's committer.
    Propose(Bytes),
    /// A protocol message from a peer.
    Paxos(PaxosMsg),
    Stop,
}

/// A [`Transport`] over the inboxes of the other nodes of a group.
pub struct ChannelTransport {
    node_id: NodeId,
    peers: BTreeMap<NodeId, Sender<Command>>,
}

impl ChannelTransport {
    pub fn new(node_id: NodeId, peers: BTreeMap<NodeId, Sender<Command>>) -> Self {
        Self { node_id, peers }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, to: NodeId, message: PaxosMsg) {
        match self.peers.get(&to) {
            Some(peer) => {
                if peer.send(Command::Paxos(message)).is_err() {
                    log::debug!("node {} is gone, dropping message", to);
                }
            }
            None => log::warn!("no route to node {}", to),
        }
    }

    fn broadcast(&mut self, message: PaxosMsg) {
        let node_id = self.node_id;
        for (to, peer) in self.peers.iter().filter(|(to, _)| **to != node_id) {
            if peer.send(Command::Paxos(message.clone())).is_err() {
                log::debug!("node {} is gone, dropping message", to);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crossbeam_channel::unbounded;
    use paxos::message::MsgType;

    use super::*;

    #[test]
    fn broadcast_skips_self() {
        let (tx1, rx1) = unbounded();
        let (tx2, rx2) = unbounded();
        let (tx3, rx3) = unbounded();
        let peers = vec![(1, tx1), (2, tx2), (3, tx3)].into_iter().collect();
        let mut transport = ChannelTransport::new(1, peers);

        transport.broadcast(PaxosMsg::new(MsgType::Prepare, 0, 1));
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(Command::Paxos(_))));
        assert!(matches!(rx3.try_recv(), Ok(Command::Paxos(_))));

        transport.send(3, PaxosMsg::new(MsgType::PrepareReply, 0, 1));
        assert!(rx2.try_recv().is_err());
        assert!(matches!(rx3.try_recv(), Ok(Command::Paxos(msg)) if msg.msg_type() == MsgType::PrepareReply));
    }
}
