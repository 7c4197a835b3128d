#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use bytes::Bytes;
use rand_core::{RngCore, SeedableRng};

use paxos::ballot::BallotNumber;
use paxos::learner::{Chosen, Learner};
use paxos::message::PaxosMsg;
use paxos::network::Transport;
use paxos::observer::{Event, Observer};
use paxos::storage::memory::InMemoryStorage;
use paxos::{Config, Instance, InstanceId, NodeId};
use rand_chacha::ChaChaRng;

pub const CONFIG: Config = Config {
    start_proposal_id: 1,
    prepare_timeout_ms: 50,
    max_prepare_timeout_ms: 400,
    accept_timeout_ms: 50,
    max_accept_timeout_ms: 400,
    retry_delay_min_ms: 10,
    retry_delay_max_ms: 40,
    log_sync: true,
    sync_interval: 0,
    run_self_first_on_accept: false,
};
const RANDOM_SEED: u64 = 0;
const MAX_TICKS: u64 = 200_000;

pub type TestInstance = Instance<InMemoryStorage, SimTransport, RecordingLearner, ChaChaRng>;

pub struct TestGroup {
    pub nodes: BTreeMap<NodeId, TestInstance>,
    pub observers: BTreeMap<NodeId, Rc<RecordingObserver>>,
    pub history: Rc<RefCell<History>>,
    pub network: Rc<RefCell<VecDeque<Envelope>>>,
    pub pending: BTreeMap<NodeId, VecDeque<Bytes>>,
    pub now: Tick,
    pub config: TestGroupConfig,
    random: ChaChaRng,
}

#[derive(Clone, Default)]
pub struct TestGroupConfig {
    pub drops: BTreeSet<(Option<NodeId>, Option<NodeId>)>,
    pub down: BTreeSet<NodeId>,
    pub drop_percent: u32,
    pub duplicate_percent: u32,
    pub reorder: bool,
}

#[derive(
    Clone, Copy, Debug, Default, derive_more::Display, Eq, derive_more::From, PartialEq, PartialOrd, Ord,
)]
#[display(fmt = "{:06}", _0)]
pub struct Tick(pub u64);

#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: PaxosMsg,
}

pub struct SimTransport {
    node_id: NodeId,
    peers: Vec<NodeId>,
    network: Rc<RefCell<VecDeque<Envelope>>>,
}

/// Everything chosen and learned across the group.
#[derive(Default)]
pub struct History {
    pub chosen: BTreeMap<InstanceId, Bytes>,
    pub learned: BTreeMap<NodeId, Vec<(InstanceId, Bytes)>>,
}

pub struct RecordingLearner {
    node_id: NodeId,
    history: Rc<RefCell<History>>,
}

#[derive(Default)]
pub struct RecordingObserver {
    pub events: RefCell<Vec<Event>>,
}

pub struct TestLogger;

pub struct TestLoggerContext {
    node_id: Option<NodeId>,
    tick: Option<Tick>,
}

pub fn init_random() -> ChaChaRng {
    ChaChaRng::seed_from_u64(RANDOM_SEED)
}

pub fn config() -> TestGroupConfig {
    TestGroupConfig::default()
}

pub fn value(text: &'static str) -> Bytes {
    Bytes::from_static(text.as_bytes())
}

//
// TestGroup impls
//

impl TestGroup {
    pub fn new(size: u64, random: &mut impl RngCore, config: TestGroupConfig) -> Self {
        TestLogger::init();
        let node_ids: Vec<NodeId> = (1..=size).collect();
        let mut group = Self {
            nodes: BTreeMap::new(),
            observers: BTreeMap::new(),
            history: Default::default(),
            network: Default::default(),
            pending: BTreeMap::new(),
            now: Tick(0),
            config,
            random: ChaChaRng::seed_from_u64(random.next_u64()),
        };
        for &node_id in &node_ids {
            let instance = group.build_node(node_id, &node_ids, InMemoryStorage::new(), random);
            group.nodes.insert(node_id, instance);
        }
        group
    }

    /// Queues `value` for `node_id` to propose as soon as its proposer is idle.
    pub fn propose(&mut self, node_id: NodeId, value: Bytes) -> &mut Self {
        self.pending.entry(node_id).or_default().push_back(value);
        self
    }

    /// Simulates a crash and restart of `node_id`, keeping only what it persisted.
    pub fn restart(&mut self, node_id: NodeId, random: &mut impl RngCore) -> &mut Self {
        let node_ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        let storage = match self.nodes.get_mut(&node_id) {
            Some(node) => std::mem::take(node.storage_mut()),
            None => panic!("no node {}", node_id),
        };
        TestLogger::set_node_id(Some(node_id));
        log::info!("restarting");
        let instance = self.build_node(node_id, &node_ids, storage, random);
        self.nodes.insert(node_id, instance);
        TestLogger::set_node_id(None);
        self
    }

    pub fn run_until(&mut self, mut until_fun: impl FnMut(&mut Self) -> bool) -> &mut Self {
        let mut ticks_remaining = MAX_TICKS;
        while !until_fun(self) {
            ticks_remaining = ticks_remaining
                .checked_sub(1)
                .expect("condition failed after maximum simulation length");
            self.step();
        }
        self
    }

    pub fn run_for(&mut self, ticks: u64) -> &mut Self {
        self.run_for_inspect(ticks, |_| ())
    }

    pub fn run_for_inspect(&mut self, ticks: u64, mut fun: impl FnMut(&mut Self)) -> &mut Self {
        for _ in 0..ticks {
            self.step();
            fun(self);
        }
        self
    }

    pub fn inspect(&mut self, fun: impl FnOnce(&Self)) -> &mut Self {
        fun(self);
        self
    }

    pub fn modify(&mut self, fun: impl FnOnce(&mut Self)) -> &mut Self {
        fun(self);
        self
    }

    pub fn node(&self, node_id: NodeId) -> &TestInstance {
        self.nodes
            .get(&node_id)
            .unwrap_or_else(|| panic!("no node {}", node_id))
    }

    pub fn learned(&self, node_id: NodeId) -> Vec<(InstanceId, Bytes)> {
        self.history
            .borrow()
            .learned
            .get(&node_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn chosen(&self) -> BTreeMap<InstanceId, Bytes> {
        self.history.borrow().chosen.clone()
    }

    pub fn has_learned_everywhere(&self, instance_count: usize) -> bool {
        self.nodes
            .keys()
            .filter(|node_id| !self.config.down.contains(*node_id))
            .all(|node_id| self.learned(*node_id).len() >= instance_count)
    }

    pub fn events(&self, node_id: NodeId) -> Vec<Event> {
        self.observers[&node_id].events.borrow().clone()
    }

    /// Asserts that no two nodes learned different values for an instance, that every learned value was chosen,
    /// and that every node learned its instances in order.
    pub fn assert_consistent(&self) -> &Self {
        let history = self.history.borrow();
        for (node_id, learned) in &history.learned {
            for (index, (instance_id, value)) in learned.iter().enumerate() {
                assert_eq!(
                    *instance_id, index as u64,
                    "node {} learned instance {} out of order",
                    node_id, instance_id
                );
                assert_eq!(
                    history.chosen.get(instance_id),
                    Some(value),
                    "node {} learned a value never chosen for instance {}",
                    node_id,
                    instance_id
                );
            }
        }
        self
    }

    /// Advances the simulation by one millisecond.
    pub fn step(&mut self) {
        self.now = Tick(self.now.0 + 1);
        TestLogger::set_tick(Some(self.now));

        self.drive_committers();
        self.deliver();

        let now = self.now.0;
        for (node_id, node) in &mut self.nodes {
            if !self.config.down.contains(node_id) {
                TestLogger::set_node_id(Some(*node_id));
                node.process_timeouts(now);
            }
        }

        TestLogger::set_node_id(None);
        TestLogger::set_tick(None);
    }

    fn build_node(
        &mut self,
        node_id: NodeId,
        node_ids: &[NodeId],
        storage: InMemoryStorage,
        random: &mut impl RngCore,
    ) -> TestInstance {
        let observer = Rc::new(RecordingObserver::default());
        self.observers.insert(node_id, Rc::clone(&observer));
        let transport = SimTransport {
            node_id,
            peers: node_ids.to_vec(),
            network: Rc::clone(&self.network),
        };
        let learner = RecordingLearner {
            node_id,
            history: Rc::clone(&self.history),
        };
        Instance::with_observer(
            node_id,
            node_ids.iter().copied().collect(),
            storage,
            transport,
            learner,
            ChaChaRng::seed_from_u64(random.next_u64()),
            CONFIG,
            observer,
        )
        .unwrap_or_else(|error| panic!("node {} failed to start: {}", node_id, error))
    }

    /// Proposes the head of each node's queue while its proposer is idle, dropping heads which were chosen.
    fn drive_committers(&mut self) {
        let now = self.now.0;
        for (node_id, queue) in &mut self.pending {
            {
                let history = self.history.borrow();
                while let Some(head) = queue.front() {
                    if history.chosen.values().any(|value| value == head) {
                        queue.pop_front();
                    } else {
                        break;
                    }
                }
            }

            if self.config.down.contains(node_id) {
                continue;
            }
            if let (Some(head), Some(node)) = (queue.front(), self.nodes.get_mut(node_id)) {
                if !node.is_proposing() {
                    TestLogger::set_node_id(Some(*node_id));
                    node.new_value(head.clone(), now);
                }
            }
        }
    }

    /// Delivers the messages in flight at the start of this tick. Replies go out on the next one.
    fn deliver(&mut self) {
        let now = self.now.0;
        let in_flight = self.network.borrow().len();
        for _ in 0..in_flight {
            let envelope = {
                let mut network = self.network.borrow_mut();
                let index = if self.config.reorder && !network.is_empty() {
                    self.random.next_u32() as usize % network.len()
                } else {
                    0
                };
                match network.remove(index) {
                    Some(envelope) => envelope,
                    None => break,
                }
            };

            TestLogger::set_node_id(Some(envelope.to));
            if self.config.should_drop(envelope.from, envelope.to)
                || self.random.next_u32() % 100 < self.config.drop_percent
            {
                log::info!("<- {} DROPPED {}", envelope.from, envelope.message);
                continue;
            }
            if self.random.next_u32() % 100 < self.config.duplicate_percent {
                log::info!("<- {} DUPLICATED {}", envelope.from, envelope.message);
                self.network.borrow_mut().push_back(envelope.clone());
            }

            log::info!("<- {} {}", envelope.from, envelope.message);
            if let Some(node) = self.nodes.get_mut(&envelope.to) {
                node.receive(envelope.message, now);
            }
        }
    }
}

//
// TestGroupConfig impls
//

impl TestGroupConfig {
    pub fn node_down(mut self, node_id: NodeId) -> Self {
        self.down.insert(node_id);
        self
    }

    pub fn isolate(mut self, node_id: NodeId) -> Self {
        self.drops.insert((Some(node_id), None));
        self.drops.insert((None, Some(node_id)));
        self
    }

    pub fn drop_between(mut self, from: NodeId, to: NodeId) -> Self {
        self.drops.insert((Some(from), Some(to)));
        self.drops.insert((Some(to), Some(from)));
        self
    }

    pub fn lossy(mut self, drop_percent: u32) -> Self {
        self.drop_percent = drop_percent;
        self
    }

    pub fn duplicating(mut self, duplicate_percent: u32) -> Self {
        self.duplicate_percent = duplicate_percent;
        self
    }

    pub fn reordering(mut self) -> Self {
        self.reorder = true;
        self
    }

    pub fn should_drop(&self, from: NodeId, to: NodeId) -> bool {
        self.drops.contains(&(Some(from), Some(to)))
            || self.drops.contains(&(Some(from), None))
            || self.drops.contains(&(None, Some(to)))
            || self.down.contains(&from)
            || self.down.contains(&to)
    }
}

//
// SimTransport impls
//

impl Transport for SimTransport {
    fn send(&mut self, to: NodeId, message: PaxosMsg) {
        log::debug!("-> {} {}", to, message);
        self.network.borrow_mut().push_back(Envelope {
            from: self.node_id,
            to,
            message,
        });
    }

    fn broadcast(&mut self, message: PaxosMsg) {
        log::debug!("-> all {}", message);
        let mut network = self.network.borrow_mut();
        let peers = self.peers.iter().filter(|peer| **peer != self.node_id);
        for (&to, message) in peers.zip(itertools::repeat_n(message, self.peers.len() - 1)) {
            network.push_back(Envelope {
                from: self.node_id,
                to,
                message,
            });
        }
    }
}

//
// RecordingLearner impls
//

impl Learner for RecordingLearner {
    fn on_instance_chosen(&mut self, chosen: &Chosen) {
        log::info!(
            "chose instance {} with {}",
            chosen.instance_id,
            BallotNumber::new(chosen.proposal_id, self.node_id)
        );
        let mut history = self.history.borrow_mut();
        match history.chosen.entry(chosen.instance_id) {
            Entry::Vacant(entry) => {
                entry.insert(chosen.value.clone());
            }
            Entry::Occupied(entry) => assert_eq!(
                entry.get(),
                &chosen.value,
                "instance {} chosen with two different values",
                chosen.instance_id
            ),
        }
    }

    fn on_value_learned(&mut self, instance_id: InstanceId, value: &Bytes) {
        self.history
            .borrow_mut()
            .learned
            .entry(self.node_id)
            .or_default()
            .push((instance_id, value.clone()));
    }
}

//
// RecordingObserver impls
//

impl Observer for RecordingObserver {
    fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

//
// TestLogger impls
//

thread_local! {
    static LOGGER_CONTEXT: RefCell<TestLoggerContext> = RefCell::new(TestLoggerContext::new());
}

impl TestLogger {
    pub fn init() {
        let _ignore = log::set_logger(&Self);
        log::set_max_level(log::LevelFilter::Debug);
    }
    pub fn set_node_id(node_id: Option<NodeId>) {
        LOGGER_CONTEXT.with(|context| {
            context.borrow_mut().node_id = node_id;
        });
    }
    pub fn set_tick(tick: Option<Tick>) {
        LOGGER_CONTEXT.with(|context| {
            context.borrow_mut().tick = tick;
        });
    }
}

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        LOGGER_CONTEXT.with(|context| {
            let context = context.borrow();
            match (context.node_id, context.tick) {
                (Some(node_id), Some(tick)) => eprintln!("{} node {} {}", tick, node_id, record.args()),
                (Some(node_id), None) => eprintln!("?????? node {} {}", node_id, record.args()),
                (None, _) => eprintln!("{}", record.args()),
            }
        })
    }

    fn flush(&self) {}
}

//
// TestLoggerContext impls
//

impl TestLoggerContext {
    const fn new() -> Self {
        Self {
            node_id: None,
            tick: None,
        }
    }
}
