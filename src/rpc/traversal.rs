//! Iterative lookups walking the network toward a target.
//!
//! A traversal keeps a queue of candidates sorted by distance to its target,
//! and queries the closest ones, at most [ALPHA] at a time, until its request
//! budget is spent or no candidates are left. Slow nodes are given up on after
//! a short timeout, but their late answers are still folded in.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::{debug, trace};

use crate::common::{
    Contact, FindNodeRequestArguments, GetPeersRequestArguments, Id, Node, RequestTypeSpecific,
    ResponseSpecific, RoutingTable, MAX_BUCKET_SIZE_K,
};

use super::closest_nodes::ClosestNodes;
use super::connection::{Connections, Requester, TransactionResult};
use super::socket::KrpcSocket;

/// Maximum number of requests in flight per traversal.
pub const ALPHA: usize = 3;
/// Default number of requests a traversal may send.
pub const DEFAULT_MAX_REQUESTS: usize = 2 * MAX_BUCKET_SIZE_K;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How many more requests a traversal may send.
pub enum Budget {
    Limited(usize),
    /// Never exhausted.
    Unlimited,
}

impl Budget {
    fn exhausted(&self) -> bool {
        *self == Budget::Limited(0)
    }

    fn spend(&mut self) {
        if let Budget::Limited(remaining) = self {
            *remaining = remaining.saturating_sub(1);
        }
    }

    /// Allow `more` requests.
    pub fn extend(&mut self, more: usize) {
        if let Budget::Limited(remaining) = self {
            *remaining += more;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalKind {
    /// `get_peers` toward an info hash, collecting peers and tokens.
    GetPeers,
    /// `find_node` toward an id, or `ping` if a candidate has that exact id.
    Refresh,
}

#[derive(Debug, Clone, PartialEq)]
/// What became of a single traversal request.
pub(crate) enum Outcome {
    /// The transaction finished before the short timeout.
    OnTime(TransactionResult),
    /// The short timeout fired first, the transaction is still open.
    ShortTimeout,
    /// The transaction finished after its short timeout.
    LateResult(TransactionResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraversalState {
    Running,
    /// Converged, waiting for late results until the deadline.
    Draining { until: Instant },
    Done,
}

#[derive(Debug, Clone, Copy)]
struct Visit {
    contact: Contact,
    ping: bool,
}

#[derive(Debug)]
struct Inflight {
    visit: Visit,
    /// Cleared once the short timeout fired.
    short_deadline: Option<Instant>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Traversal errors
pub enum TraversalError {
    #[error("Cannot connect to DHT without any known nodes")]
    /// Neither the routing table nor the caller provided any contact to start from.
    NoKnownNodes,
}

#[derive(Debug)]
pub(crate) struct Traversal {
    id: u64,
    target: Id,
    kind: TraversalKind,

    queue: VecDeque<Contact>,
    seen: HashSet<SocketAddrV4>,

    closest: ClosestNodes,
    peers: Vec<SocketAddrV4>,
    known_peers: HashSet<SocketAddrV4>,
    new_peers: Vec<SocketAddrV4>,

    pending: usize,
    budget: Budget,
    state: TraversalState,

    next_request: u32,
    inflight: HashMap<u32, Inflight>,
    outcomes: (Sender<(Visit, Outcome)>, Receiver<(Visit, Outcome)>),

    short_timeout: Duration,
    grace: Duration,
}

impl Traversal {
    pub fn new(
        id: u64,
        target: Id,
        kind: TraversalKind,
        short_timeout: Duration,
        grace: Duration,
    ) -> Self {
        trace!(id, ?target, ?kind, "New traversal");

        Traversal {
            id,
            target,
            kind,

            queue: VecDeque::new(),
            seen: HashSet::new(),

            closest: ClosestNodes::new(target),
            peers: Vec::new(),
            known_peers: HashSet::new(),
            new_peers: Vec::new(),

            pending: 0,
            budget: Budget::Limited(DEFAULT_MAX_REQUESTS),
            state: TraversalState::Running,

            next_request: 0,
            inflight: HashMap::new(),
            outcomes: flume::unbounded(),

            short_timeout,
            grace,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn kind(&self) -> TraversalKind {
        self.kind
    }

    pub fn is_done(&self) -> bool {
        self.state == TraversalState::Done
    }

    /// All distinct peers found so far.
    pub fn peers(&self) -> &[SocketAddrV4] {
        &self.peers
    }

    /// The closest nodes that responded with an announce token.
    pub fn closest(&self) -> &ClosestNodes {
        &self.closest
    }

    // === Public Methods ===

    /// Add candidates, ignoring addresses already seen by this traversal.
    pub fn add_list<I: IntoIterator<Item = Contact>>(&mut self, contacts: I) {
        for contact in contacts {
            self.add(contact);
        }
    }

    pub fn extend_budget(&mut self, more: usize) {
        self.budget.extend(more);
    }

    #[cfg(test)]
    pub fn set_budget(&mut self, budget: Budget) {
        self.budget = budget;
    }

    /// Seed the queue from the good contacts of the routing table if no
    /// candidates were added, and send the first requests.
    pub fn start(
        &mut self,
        table: &RoutingTable,
        connections: &mut Connections,
        socket: &mut KrpcSocket,
        now: Instant,
    ) -> Result<(), TraversalError> {
        if self.queue.is_empty() {
            let closest = table.lookup(&self.target, Some(MAX_BUCKET_SIZE_K), false);
            self.add_list(closest.into_iter().map(Contact::from));
        }

        if self.queue.is_empty() {
            return Err(TraversalError::NoKnownNodes);
        }

        debug!(
            id = self.id,
            target = ?self.target,
            candidates = self.queue.len(),
            "Starting traversal"
        );

        self.run(connections, socket, now);

        Ok(())
    }

    /// Hand over the result of one of this traversal's transactions.
    pub fn complete(&mut self, request: u32, result: TransactionResult) {
        if let Some(inflight) = self.inflight.remove(&request) {
            let outcome = match inflight.short_deadline {
                Some(_) => Outcome::OnTime(result),
                None => Outcome::LateResult(result),
            };

            let _ = self.outcomes.0.send((inflight.visit, outcome));
        }
    }

    /// Fire short timeouts, fold outcomes in, and finish after the grace period.
    pub fn tick(
        &mut self,
        table: &mut RoutingTable,
        connections: &mut Connections,
        socket: &mut KrpcSocket,
    ) {
        self.tick_at(table, connections, socket, Instant::now())
    }

    pub(crate) fn tick_at(
        &mut self,
        table: &mut RoutingTable,
        connections: &mut Connections,
        socket: &mut KrpcSocket,
        now: Instant,
    ) {
        for inflight in self.inflight.values_mut() {
            if matches!(inflight.short_deadline, Some(deadline) if deadline <= now) {
                inflight.short_deadline = None;
                let _ = self.outcomes.0.send((inflight.visit, Outcome::ShortTimeout));
            }
        }

        let outcomes: Vec<_> = self.outcomes.1.drain().collect();

        for (visit, outcome) in outcomes {
            if self.is_done() {
                break;
            }

            match outcome {
                Outcome::OnTime(result) => {
                    self.pending = self.pending.saturating_sub(1);
                    self.fold(table, visit, result);
                }
                Outcome::ShortTimeout => {
                    trace!(id = self.id, address = ?visit.contact.address, "Short timeout");
                    self.pending = self.pending.saturating_sub(1);
                }
                Outcome::LateResult(result) => self.fold(table, visit, result),
            }

            self.run(connections, socket, now);
        }

        if let TraversalState::Draining { until } = self.state {
            if until <= now {
                self.finish();
            }
        }
    }

    /// Peers found since the last call.
    pub fn take_new_peers(&mut self) -> Vec<SocketAddrV4> {
        std::mem::take(&mut self.new_peers)
    }

    // === Private Methods ===

    fn add(&mut self, contact: Contact) {
        if !self.seen.insert(contact.address) {
            return;
        }

        match contact.id {
            Some(id) => {
                let target = self.target;
                let position = self.queue.partition_point(|queued| match queued.id {
                    Some(queued) => target.cmp_distance(&queued, &id) != std::cmp::Ordering::Greater,
                    None => false,
                });

                self.queue.insert(position, contact);
            }
            // Contacts without an id can't be ordered, they go last.
            None => self.queue.push_back(contact),
        }
    }

    /// Send requests to the closest candidates, then check for convergence.
    fn run(&mut self, connections: &mut Connections, socket: &mut KrpcSocket, now: Instant) {
        if self.is_done() {
            return;
        }

        while self.pending < ALPHA && !self.budget.exhausted() {
            let contact = match self.queue.pop_front() {
                Some(contact) => contact,
                None => break,
            };

            self.budget.spend();
            self.pending += 1;

            let request = self.next_request;
            self.next_request = self.next_request.wrapping_add(1);

            let ping = self.kind == TraversalKind::Refresh && contact.id == Some(self.target);

            let request_type = match self.kind {
                TraversalKind::GetPeers => {
                    RequestTypeSpecific::GetPeers(GetPeersRequestArguments {
                        info_hash: self.target,
                    })
                }
                TraversalKind::Refresh if ping => RequestTypeSpecific::Ping,
                TraversalKind::Refresh => RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                    target: self.target,
                }),
            };

            self.inflight.insert(
                request,
                Inflight {
                    visit: Visit { contact, ping },
                    short_deadline: Some(now + self.short_timeout),
                },
            );

            connections.query_at(
                socket,
                contact,
                request_type,
                Requester::Traversal {
                    traversal: self.id,
                    request,
                },
                now,
            );
        }

        self.state = if self.pending == 0 && (self.budget.exhausted() || self.queue.is_empty()) {
            TraversalState::Draining {
                until: now + self.grace,
            }
        } else {
            TraversalState::Running
        };
    }

    fn fold(&mut self, table: &mut RoutingTable, visit: Visit, result: TransactionResult) {
        let response = match result {
            TransactionResult::Response(response) => response,
            _ => return,
        };

        match self.kind {
            TraversalKind::GetPeers => {
                if response.token.is_none() {
                    trace!(id = self.id, from = ?visit.contact.address, "get_peers response without a token");
                    return;
                }

                let ResponseSpecific {
                    responder_id,
                    nodes,
                    values,
                    token,
                } = response;

                self.closest
                    .add(Node::new(responder_id, visit.contact.address), token);

                for peer in values.unwrap_or_default() {
                    if self.known_peers.insert(peer) {
                        self.peers.push(peer);
                        self.new_peers.push(peer);
                    }
                }

                self.discovered(table, nodes.unwrap_or_default());
            }
            TraversalKind::Refresh => {
                if visit.ping {
                    debug!(id = self.id, target = ?self.target, "Target responded to ping");
                    self.finish();
                    return;
                }

                self.discovered(table, response.nodes.unwrap_or_default());
            }
        }
    }

    fn discovered(&mut self, table: &mut RoutingTable, nodes: Vec<Node>) {
        for node in nodes {
            if &node.id == table.id() {
                continue;
            }

            table.heard_about(node);
            self.add(node.into());
        }
    }

    fn finish(&mut self) {
        debug!(
            id = self.id,
            target = ?self.target,
            visited = self.seen.len() - self.queue.len(),
            peers = self.peers.len(),
            closest = self.closest.len(),
            "Traversal done"
        );

        self.state = TraversalState::Done;
    }
}

#[cfg(test)]
mod test {
    use std::net::UdpSocket;

    use super::*;
    use crate::rpc::config::Config;
    use crate::rpc::connection::Completion;

    const SHORT: Duration = Duration::from_secs(2);
    const GRACE: Duration = Duration::from_secs(5);

    struct Setup {
        table: RoutingTable,
        connections: Connections,
        socket: KrpcSocket,
        _completions: Receiver<Completion>,
        _peers: Vec<UdpSocket>,
    }

    impl Setup {
        fn new() -> Self {
            let own_id = Id::random();
            let (sender, receiver) = flume::unbounded();

            Setup {
                table: RoutingTable::new(own_id),
                connections: Connections::new(own_id, Duration::from_secs(10), sender),
                socket: KrpcSocket::new(&Config {
                    port: Some(0),
                    ..Default::default()
                })
                .unwrap(),
                _completions: receiver,
                _peers: Vec::new(),
            }
        }

        /// Addresses of sockets that never answer.
        fn silent_contacts(&mut self, count: usize) -> Vec<Contact> {
            (0..count)
                .map(|_| {
                    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
                    let address = match peer.local_addr().unwrap() {
                        std::net::SocketAddr::V4(address) => address,
                        _ => unreachable!(),
                    };
                    self._peers.push(peer);

                    Contact::new(address).with_id(Id::random())
                })
                .collect()
        }

        fn start(&mut self, traversal: &mut Traversal, now: Instant) -> Result<(), TraversalError> {
            traversal.start(&self.table, &mut self.connections, &mut self.socket, now)
        }

        fn tick(&mut self, traversal: &mut Traversal, now: Instant) {
            traversal.tick_at(&mut self.table, &mut self.connections, &mut self.socket, now)
        }
    }

    fn inflight_to(traversal: &Traversal, address: SocketAddrV4) -> u32 {
        *traversal
            .inflight
            .iter()
            .find(|(_, inflight)| inflight.visit.contact.address == address)
            .unwrap()
            .0
    }

    fn response(id: Id) -> ResponseSpecific {
        ResponseSpecific::empty(id)
    }

    #[test]
    fn cannot_start_without_known_nodes() {
        let mut setup = Setup::new();
        let mut traversal =
            Traversal::new(0, Id::random(), TraversalKind::GetPeers, SHORT, GRACE);

        assert_eq!(
            setup.start(&mut traversal, Instant::now()),
            Err(TraversalError::NoKnownNodes)
        );
    }

    #[test]
    fn seeds_only_from_good_contacts() {
        let mut setup = Setup::new();
        let now = Instant::now();

        for contact in setup.silent_contacts(4) {
            if let Some(id) = contact.id {
                setup.table.heard_about(Node::new(id, contact.address));
            }
        }

        let mut traversal =
            Traversal::new(0, Id::random(), TraversalKind::Refresh, SHORT, GRACE);

        assert_eq!(
            setup.start(&mut traversal, now),
            Err(TraversalError::NoKnownNodes)
        );
        assert!(traversal.inflight.is_empty());

        let good = setup.silent_contacts(1)[0];
        if let Some(id) = good.id {
            setup.table.node_seen(Node::new(id, good.address));
        }

        let mut traversal =
            Traversal::new(1, Id::random(), TraversalKind::Refresh, SHORT, GRACE);
        setup.start(&mut traversal, now).unwrap();

        assert_eq!(traversal.inflight.len(), 1);
        assert_eq!(inflight_to(&traversal, good.address), 0);
    }

    #[test]
    fn queue_is_sorted_and_deduplicated() {
        let target = Id([0; 20]);
        let mut traversal = Traversal::new(0, target, TraversalKind::Refresh, SHORT, GRACE);

        let contact = |byte: u8| {
            let mut id = [0_u8; 20];
            id[0] = byte;
            Contact::new(SocketAddrV4::new([127, 0, 0, 1].into(), byte as u16)).with_id(Id(id))
        };

        let anonymous = Contact::new(SocketAddrV4::new([127, 0, 0, 2].into(), 1));

        traversal.add_list(vec![contact(9), anonymous, contact(3), contact(7), contact(3)]);

        assert_eq!(
            traversal.queue.iter().copied().collect::<Vec<_>>(),
            vec![contact(3), contact(7), contact(9), anonymous]
        );
    }

    #[test]
    fn short_timeouts_free_slots() {
        let mut setup = Setup::new();
        let now = Instant::now();

        let contacts = setup.silent_contacts(5);
        let mut traversal = Traversal::new(1, Id::random(), TraversalKind::GetPeers, SHORT, GRACE);
        traversal.add_list(contacts);

        setup.start(&mut traversal, now).unwrap();

        assert_eq!(traversal.pending, ALPHA);
        assert_eq!(traversal.inflight.len(), ALPHA);
        assert_eq!(setup.connections.len(), ALPHA);

        setup.tick(&mut traversal, now + Duration::from_secs(1));
        assert_eq!(traversal.pending, ALPHA);

        setup.tick(&mut traversal, now + SHORT);

        // Slots were freed, the remaining two candidates got queried.
        assert_eq!(traversal.pending, 2);
        assert_eq!(traversal.inflight.len(), 5);
        assert_eq!(setup.connections.len(), 5);
        assert_eq!(traversal.state, TraversalState::Running);
    }

    #[test]
    fn late_results_are_folded_in() {
        let mut setup = Setup::new();
        let now = Instant::now();

        let contacts = setup.silent_contacts(1);
        let target = Id::random();
        let mut traversal = Traversal::new(1, target, TraversalKind::Refresh, SHORT, GRACE);
        traversal.add_list(contacts.clone());

        setup.start(&mut traversal, now).unwrap();
        let request = inflight_to(&traversal, contacts[0].address);

        let later = now + SHORT;
        setup.tick(&mut traversal, later);

        assert_eq!(traversal.pending, 0);
        assert!(matches!(traversal.state, TraversalState::Draining { .. }));

        let discovered = Node::random();
        traversal.complete(
            request,
            TransactionResult::Response(ResponseSpecific {
                nodes: Some(vec![discovered]),
                ..response(contacts[0].id.unwrap())
            }),
        );

        let late = later + Duration::from_secs(3);
        setup.tick(&mut traversal, late);

        // The discovered node was heard about, and queried.
        assert!(setup
            .table
            .lookup(&target, None, true)
            .contains(&discovered));
        assert_eq!(traversal.pending, 1);
        assert_eq!(traversal.state, TraversalState::Running);
    }

    #[test]
    fn done_after_grace_period() {
        let mut setup = Setup::new();
        let now = Instant::now();

        let contacts = setup.silent_contacts(1);
        let mut traversal = Traversal::new(1, Id::random(), TraversalKind::GetPeers, SHORT, GRACE);
        traversal.add_list(contacts.clone());

        setup.start(&mut traversal, now).unwrap();
        let request = inflight_to(&traversal, contacts[0].address);

        traversal.complete(
            request,
            TransactionResult::Response(ResponseSpecific {
                token: Some(vec![1, 2, 3]),
                ..response(contacts[0].id.unwrap())
            }),
        );
        setup.tick(&mut traversal, now);

        assert!(matches!(traversal.state, TraversalState::Draining { .. }));
        assert_eq!(traversal.closest().len(), 1);

        setup.tick(&mut traversal, now + Duration::from_secs(4));
        assert!(!traversal.is_done());

        setup.tick(&mut traversal, now + GRACE);
        assert!(traversal.is_done());
    }

    #[test]
    fn late_result_restarts_the_grace_period() {
        let mut setup = Setup::new();
        let now = Instant::now();

        let contacts = setup.silent_contacts(1);
        let mut traversal = Traversal::new(1, Id::random(), TraversalKind::Refresh, SHORT, GRACE);
        traversal.add_list(contacts.clone());

        setup.start(&mut traversal, now).unwrap();
        let request = inflight_to(&traversal, contacts[0].address);

        // Short timeout, nothing else to query: draining until `now + SHORT + GRACE`.
        setup.tick(&mut traversal, now + SHORT);
        assert!(matches!(traversal.state, TraversalState::Draining { .. }));

        let late = now + SHORT + Duration::from_secs(4);
        traversal.complete(
            request,
            TransactionResult::Response(response(contacts[0].id.unwrap())),
        );
        setup.tick(&mut traversal, late);
        assert_eq!(
            traversal.state,
            TraversalState::Draining {
                until: late + GRACE
            }
        );

        setup.tick(&mut traversal, now + SHORT + GRACE);
        assert!(!traversal.is_done());

        setup.tick(&mut traversal, late + GRACE - Duration::from_millis(1));
        assert!(!traversal.is_done());

        setup.tick(&mut traversal, late + GRACE);
        assert!(traversal.is_done());
    }

    #[test]
    fn budget_limits_requests() {
        let mut setup = Setup::new();
        let now = Instant::now();

        let contacts = setup.silent_contacts(5);
        let mut traversal = Traversal::new(1, Id::random(), TraversalKind::Refresh, SHORT, GRACE);
        traversal.set_budget(Budget::Limited(2));
        traversal.add_list(contacts);

        setup.start(&mut traversal, now).unwrap();
        assert_eq!(traversal.inflight.len(), 2);

        setup.tick(&mut traversal, now + SHORT);

        assert_eq!(traversal.inflight.len(), 2);
        assert!(matches!(traversal.state, TraversalState::Draining { .. }));

        let mut unlimited = Budget::Unlimited;
        unlimited.spend();
        unlimited.extend(1);
        assert!(!unlimited.exhausted());
    }

    #[test]
    fn get_peers_collects_peers_from_token_bearing_responses() {
        let mut setup = Setup::new();
        let now = Instant::now();

        let contacts = setup.silent_contacts(2);
        let mut traversal = Traversal::new(1, Id::random(), TraversalKind::GetPeers, SHORT, GRACE);
        traversal.add_list(contacts.clone());

        setup.start(&mut traversal, now).unwrap();

        let peer_a = SocketAddrV4::new([10, 0, 0, 1].into(), 6881);
        let peer_b = SocketAddrV4::new([10, 0, 0, 2].into(), 6881);

        // Without a token, the response is ignored.
        traversal.complete(
            inflight_to(&traversal, contacts[0].address),
            TransactionResult::Response(ResponseSpecific {
                values: Some(vec![peer_a]),
                ..response(contacts[0].id.unwrap())
            }),
        );
        traversal.complete(
            inflight_to(&traversal, contacts[1].address),
            TransactionResult::Response(ResponseSpecific {
                values: Some(vec![peer_a, peer_b, peer_a]),
                token: Some(vec![9]),
                ..response(contacts[1].id.unwrap())
            }),
        );

        setup.tick(&mut traversal, now);

        assert_eq!(traversal.peers(), &[peer_a, peer_b]);
        assert_eq!(traversal.take_new_peers(), vec![peer_a, peer_b]);
        assert!(traversal.take_new_peers().is_empty());

        let closest = traversal.closest().nodes();
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].node.address, contacts[1].address);
        assert_eq!(closest[0].token, Some(vec![9]));
    }

    #[test]
    fn refresh_pings_the_target_and_stops() {
        let mut setup = Setup::new();
        let now = Instant::now();

        let contacts = setup.silent_contacts(3);
        let target = contacts[0].id.unwrap();

        let mut traversal = Traversal::new(1, target, TraversalKind::Refresh, SHORT, GRACE);
        traversal.add_list(contacts.clone());

        setup.start(&mut traversal, now).unwrap();

        let request = inflight_to(&traversal, contacts[0].address);
        assert!(traversal.inflight[&request].visit.ping);

        traversal.complete(request, TransactionResult::Response(response(target)));
        setup.tick(&mut traversal, now);

        assert!(traversal.is_done());

        // Outcomes after done are ignored.
        let other = inflight_to(&traversal, contacts[1].address);
        traversal.complete(
            other,
            TransactionResult::Response(ResponseSpecific {
                nodes: Some(vec![Node::random()]),
                ..response(contacts[1].id.unwrap())
            }),
        );
        setup.tick(&mut traversal, now);

        assert!(setup.table.is_empty());
    }
}
