//! Five nodes agreeing on a few values over a reliable in-process network.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use rand_chacha::ChaChaRng;
use rand_core::SeedableRng;

use paxos::learner::{Chosen, Learner};
use paxos::message::PaxosMsg;
use paxos::network::Transport;
use paxos::storage::memory::InMemoryStorage;
use paxos::{Config, Instance, InstanceId, NodeId};

type Network = Rc<RefCell<VecDeque<(NodeId, PaxosMsg)>>>;

struct LoopbackTransport {
    node_id: NodeId,
    peers: Vec<NodeId>,
    network: Network,
}

impl Transport for LoopbackTransport {
    fn send(&mut self, to: NodeId, message: PaxosMsg) {
        println!("node {} -> node {}: {}", self.node_id, to, message);
        self.network.borrow_mut().push_back((to, message));
    }

    fn broadcast(&mut self, message: PaxosMsg) {
        println!("node {} -> all: {}", self.node_id, message);
        for &to in self.peers.iter().filter(|peer| **peer != self.node_id) {
            self.network.borrow_mut().push_back((to, message.clone()));
        }
    }
}

struct PrintLearner {
    node_id: NodeId,
    learned: Vec<(InstanceId, Bytes)>,
}

impl Learner for PrintLearner {
    fn on_instance_chosen(&mut self, chosen: &Chosen) {
        println!(
            "node {} got instance {} chosen with proposal {}",
            self.node_id, chosen.instance_id, chosen.proposal_id
        );
    }

    fn on_value_learned(&mut self, instance_id: InstanceId, value: &Bytes) {
        println!(
            "node {} learned instance {}: {}",
            self.node_id,
            instance_id,
            String::from_utf8_lossy(value)
        );
        self.learned.push((instance_id, value.clone()));
    }
}

fn main() {
    let _ignore = env_logger::builder().is_test(true).try_init();

    let node_ids: Vec<NodeId> = (1..=5).collect();
    let network = Network::default();
    let mut nodes = node_ids
        .iter()
        .map(|&node_id| {
            let transport = LoopbackTransport {
                node_id,
                peers: node_ids.clone(),
                network: Rc::clone(&network),
            };
            let learner = PrintLearner {
                node_id,
                learned: Vec::new(),
            };
            Instance::new(
                node_id,
                node_ids.iter().copied().collect(),
                InMemoryStorage::new(),
                transport,
                learner,
                ChaChaRng::seed_from_u64(node_id),
                Config::default(),
            )
            .unwrap_or_else(|error| panic!("node {} failed to start: {}", node_id, error))
        })
        .collect::<Vec<_>>();

    let values = ["Hello", "Paxos", "World"];
    for (instance_id, text) in values.iter().enumerate() {
        let proposer = instance_id % nodes.len();
        nodes[proposer].new_value(Bytes::from_static(text.as_bytes()), 0);

        loop {
            let next = network.borrow_mut().pop_front();
            let (to, message) = match next {
                Some(next) => next,
                None => break,
            };
            nodes[to as usize - 1].receive(message, 0);
        }
    }

    for node in &nodes {
        let learned: Vec<_> = node.learner().learned.iter().map(|(_, value)| value.clone()).collect();
        assert_eq!(learned, values.iter().map(|text| Bytes::from_static(text.as_bytes())).collect::<Vec<_>>());
        assert_eq!(node.instance_id(), values.len() as u64);
    }
}
