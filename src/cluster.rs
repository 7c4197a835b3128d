use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::convert::TryFrom;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::SeedableRng;

use paxos::learner::{Chosen, Learner};
use paxos::storage::memory::InMemoryStorage;
use paxos::{Config, Instance, InstanceId, NodeId};

use crate::network::{ChannelTransport, Command};

type NodeInstance = Instance<InMemoryStorage, ChannelTransport, ChannelLearner, StdRng>;

/// A set of independent Paxos groups over the same nodes, each node of each group running on its own thread.
pub struct Cluster {
    groups: Vec<Group>,
}

/// A value learned by one node of a group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Learned {
    pub node_id: NodeId,
    pub instance_id: InstanceId,
    pub value: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("unknown group {0}")]
    UnknownGroup(usize),
    #[error("node {0} is not a member of the cluster")]
    UnknownNode(NodeId),
    #[error("node {node_id} of group {group} has stopped")]
    Stopped { group: usize, node_id: NodeId },
    #[error("could not spawn node thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Group {
    inboxes: BTreeMap<NodeId, Sender<Command>>,
    learned: Receiver<Learned>,
    handles: Vec<JoinHandle<()>>,
}

struct ChannelLearner {
    node_id: NodeId,
    learned: Sender<Learned>,
    recent: Vec<Bytes>,
}

/// The state owned by one node thread.
struct NodeRunner {
    group: usize,
    instance: NodeInstance,
    inbox: Receiver<Command>,
    pending: VecDeque<Bytes>,
    started: Instant,
}

//
// Cluster impls
//

impl Cluster {
    /// Starts `group_count` groups, each made of one node per ID in `nodes`.
    pub fn start(nodes: &[NodeId], group_count: usize, config: Config) -> Result<Self, ClusterError> {
        let membership: BTreeSet<NodeId> = nodes.iter().copied().collect();
        let mut cluster = Self { groups: Vec::new() };
        for group in 0..group_count {
            let group = Group::start(group, &membership, &config)?;
            cluster.groups.push(group);
        }
        log::info!(
            "started {} groups over nodes {:?}",
            group_count,
            membership
        );
        Ok(cluster)
    }

    /// Hands `value` to the committer of `node_id` in `group`, which proposes it until it is learned there.
    pub fn propose(&self, group: usize, node_id: NodeId, value: impl Into<Bytes>) -> Result<(), ClusterError> {
        let inbox = self
            .group(group)?
            .inboxes
            .get(&node_id)
            .ok_or(ClusterError::UnknownNode(node_id))?;
        inbox
            .send(Command::Propose(value.into()))
            .map_err(|_| ClusterError::Stopped { group, node_id })
    }

    /// Returns the stream of values learned by every node of `group`, in the order they were learned.
    pub fn learned(&self, group: usize) -> Result<&Receiver<Learned>, ClusterError> {
        Ok(&self.group(group)?.learned)
    }

    /// Stops every node thread and waits for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn group(&self, group: usize) -> Result<&Group, ClusterError> {
        self.groups.get(group).ok_or(ClusterError::UnknownGroup(group))
    }

    fn stop(&mut self) {
        for group in &mut self.groups {
            group.stop();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop();
    }
}

//
// Group impls
//

impl Group {
    fn start(group: usize, membership: &BTreeSet<NodeId>, config: &Config) -> Result<Self, ClusterError> {
        let (learned_tx, learned) = unbounded();
        let channels: BTreeMap<NodeId, (Sender<Command>, Receiver<Command>)> =
            membership.iter().map(|&node_id| (node_id, unbounded())).collect();
        let inboxes: BTreeMap<NodeId, Sender<Command>> = channels
            .iter()
            .map(|(&node_id, (tx, _))| (node_id, tx.clone()))
            .collect();

        let mut started = Self {
            inboxes: inboxes.clone(),
            learned,
            handles: Vec::new(),
        };
        for (node_id, (_, inbox)) in channels {
            let transport = ChannelTransport::new(node_id, inboxes.clone());
            let learner = ChannelLearner {
                node_id,
                learned: learned_tx.clone(),
                recent: Vec::new(),
            };
            let membership = membership.clone();
            let config = config.clone();
            let handle = thread::Builder::new()
                .name(format!("paxos-{}-{}", group, node_id))
                .spawn(move || {
                    let random = StdRng::from_entropy();
                    let instance = match Instance::new(
                        node_id,
                        membership,
                        InMemoryStorage::new(),
                        transport,
                        learner,
                        random,
                        config,
                    ) {
                        Ok(instance) => instance,
                        Err(error) => {
                            log::error!("node {} of group {} failed to start: {}", node_id, group, error);
                            return;
                        }
                    };
                    NodeRunner::new(group, instance, inbox).run();
                });
            match handle {
                Ok(handle) => started.handles.push(handle),
                Err(error) => {
                    started.stop();
                    return Err(error.into());
                }
            }
        }
        Ok(started)
    }

    fn stop(&mut self) {
        for inbox in self.inboxes.values() {
            let _ignore = inbox.send(Command::Stop);
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("node thread panicked");
            }
        }
    }
}

//
// NodeRunner impls
//

impl NodeRunner {
    fn new(group: usize, instance: NodeInstance, inbox: Receiver<Command>) -> Self {
        Self {
            group,
            instance,
            inbox,
            pending: VecDeque::new(),
            started: Instant::now(),
        }
    }

    fn now(&self) -> u64 {
        millis(self.started.elapsed())
    }

    fn run(mut self) {
        loop {
            let now = self.now();
            let command = match self.instance.next_timeout(now) {
                Some(wait_ms) => self.inbox.recv_timeout(Duration::from_millis(wait_ms)),
                None => self.inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match command {
                Ok(Command::Propose(value)) => self.pending.push_back(value),
                Ok(Command::Paxos(msg)) => {
                    let now = self.now();
                    self.instance.receive(msg, now);
                }
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = self.now();
            self.instance.process_timeouts(now);
            self.commit(now);
        }
        log::debug!(
            "node {} of group {} stopped at instance {}",
            self.instance.node_id(),
            self.group,
            self.instance.instance_id()
        );
    }

    /// Drops pending values which were learned and proposes the next one while the proposer is idle.
    fn commit(&mut self, now: u64) {
        loop {
            for value in self.instance.learner_mut().recent.drain(..) {
                if self.pending.front() == Some(&value) {
                    self.pending.pop_front();
                }
            }

            let head = match self.pending.front() {
                Some(head) if !self.instance.is_proposing() => head.clone(),
                _ => return,
            };
            self.instance.new_value(head, now);
            if self.instance.is_proposing() {
                return;
            }
        }
    }
}

/// Converts `duration` to whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

//
// ChannelLearner impls
//

impl Learner for ChannelLearner {
    fn on_instance_chosen(&mut self, chosen: &Chosen) {
        log::debug!(
            "node {} saw instance {} chosen",
            self.node_id,
            chosen.instance_id
        );
    }

    fn on_value_learned(&mut self, instance_id: InstanceId, value: &Bytes) {
        self.recent.push(value.clone());
        let learned = Learned {
            node_id: self.node_id,
            instance_id,
            value: value.clone(),
        };
        if self.learned.send(learned).is_err() {
            log::debug!("nobody is listening for learned values");
        }
    }
}
