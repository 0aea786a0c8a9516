//! Per peer transactions: at most [MAX_OUTSTANDING] queries in flight to the
//! same address, the rest wait in a FIFO queue.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use flume::Sender;
use rand::Rng;
use tracing::{debug, trace};

use crate::common::{
    Contact, ErrorSpecific, Id, Message, MessageType, Node, RequestSpecific, RequestTypeSpecific,
    ResponseSpecific, RoutingTable,
};

use super::socket::KrpcSocket;

/// Maximum number of outstanding transactions per peer.
pub const MAX_OUTSTANDING: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Who is waiting for the result of a transaction.
pub(crate) enum Requester {
    /// A request of a [super::traversal::Traversal].
    Traversal { traversal: u64, request: u32 },
    /// An announce_peer request of an [super::announce::AnnounceQuery].
    Announce { announce: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransactionResult {
    Response(ResponseSpecific),
    Error(ErrorSpecific),
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
/// A finished transaction, delivered to its [Requester].
pub(crate) struct Completion {
    pub requester: Requester,
    pub from: SocketAddrV4,
    pub result: TransactionResult,
}

#[derive(Debug)]
struct Transaction {
    requester: Requester,
    deadline: Instant,
}

#[derive(Debug)]
struct PeerConnection {
    address: SocketAddrV4,
    /// Advisory until the peer responds with it.
    id: Option<Id>,
    transactions: HashMap<u16, Transaction>,
    queue: VecDeque<(RequestTypeSpecific, Requester)>,
}

impl PeerConnection {
    fn new(contact: Contact) -> Self {
        PeerConnection {
            address: contact.address,
            id: contact.id,
            transactions: HashMap::with_capacity(MAX_OUTSTANDING),
            queue: VecDeque::new(),
        }
    }

    fn send(
        &mut self,
        socket: &mut KrpcSocket,
        own_id: Id,
        deadline: Instant,
        request: RequestTypeSpecific,
        requester: Requester,
    ) {
        let mut rng = rand::thread_rng();

        let transaction_id = loop {
            let tid: u16 = rng.gen();

            if !self.transactions.contains_key(&tid) {
                break tid;
            }
        };

        self.transactions.insert(
            transaction_id,
            Transaction {
                requester,
                deadline,
            },
        );

        socket.request(
            self.address,
            transaction_id,
            RequestSpecific {
                requester_id: own_id,
                request_type: request,
            },
        );
    }

    /// Issue queued requests while there are free slots.
    fn unqueue(&mut self, socket: &mut KrpcSocket, own_id: Id, deadline: Instant) {
        while self.transactions.len() < MAX_OUTSTANDING {
            match self.queue.pop_front() {
                Some((request, requester)) => {
                    self.send(socket, own_id, deadline, request, requester)
                }
                None => break,
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.transactions.is_empty() && self.queue.is_empty()
    }
}

#[derive(Debug)]
/// Active peer connections, indexed by address.
///
/// A connection exists only while it has outstanding or queued requests.
pub(crate) struct Connections {
    own_id: Id,
    request_timeout: Duration,
    active: HashMap<SocketAddrV4, PeerConnection>,
    completions: Sender<Completion>,
}

impl Connections {
    pub fn new(own_id: Id, request_timeout: Duration, completions: Sender<Completion>) -> Self {
        Connections {
            own_id,
            request_timeout,
            active: HashMap::new(),
            completions,
        }
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[cfg(test)]
    pub fn query(
        &mut self,
        socket: &mut KrpcSocket,
        contact: Contact,
        request: RequestTypeSpecific,
        requester: Requester,
    ) {
        self.query_at(socket, contact, request, requester, Instant::now())
    }

    /// Send a query to a contact, or queue it if the contact already has
    /// [MAX_OUTSTANDING] outstanding transactions.
    pub(crate) fn query_at(
        &mut self,
        socket: &mut KrpcSocket,
        contact: Contact,
        request: RequestTypeSpecific,
        requester: Requester,
        now: Instant,
    ) {
        let connection = self
            .active
            .entry(contact.address)
            .or_insert_with(|| PeerConnection::new(contact));

        if connection.transactions.len() >= MAX_OUTSTANDING {
            trace!(address = ?contact.address, queued = connection.queue.len() + 1, "Queueing query");
            connection.queue.push_back((request, requester));
            return;
        }

        connection.send(
            socket,
            self.own_id,
            now + self.request_timeout,
            request,
            requester,
        );
    }

    /// Handle a response or an error message from `from`.
    ///
    /// Messages without a matching outstanding transaction are dropped.
    pub fn receive(
        &mut self,
        socket: &mut KrpcSocket,
        table: &mut RoutingTable,
        from: SocketAddrV4,
        message: Message,
    ) {
        let now = Instant::now();

        let connection = match self.active.get_mut(&from) {
            Some(connection) => connection,
            None => {
                trace!(?from, "Response from an address without an active connection");
                return;
            }
        };

        let transaction_id = match message.transaction_id() {
            Ok(tid) if connection.transactions.contains_key(&tid) => tid,
            _ => {
                trace!(?from, tid = ?message.transaction_id, "Unexpected transaction id");
                return;
            }
        };

        let result = match message.message_type {
            MessageType::Response(response) => {
                if let Some(id) = connection.id {
                    if id != response.responder_id {
                        debug!(
                            ?from,
                            known = ?id,
                            responded = ?response.responder_id,
                            "Responder id mismatch"
                        );
                        table.node_failed(&id);
                        return;
                    }
                }

                connection.id = Some(response.responder_id);
                TransactionResult::Response(response)
            }
            MessageType::Error(error) => TransactionResult::Error(error),
            MessageType::Request(_) => return,
        };

        let transaction = match connection.transactions.remove(&transaction_id) {
            Some(transaction) => transaction,
            None => return,
        };

        if let Some(id) = connection.id {
            match result {
                TransactionResult::Response(_) => table.node_seen(Node::new(id, from)),
                _ => table.node_failed(&id),
            }
        }

        let _ = self.completions.send(Completion {
            requester: transaction.requester,
            from,
            result,
        });

        connection.unqueue(socket, self.own_id, now + self.request_timeout);

        if connection.is_idle() {
            self.active.remove(&from);
        }
    }

    /// A reply to an outstanding transaction without a valid responder id
    /// counts as a failure, the transaction stays open until it times out.
    pub fn invalid_response(
        &mut self,
        table: &mut RoutingTable,
        from: SocketAddrV4,
        transaction_id: &[u8],
    ) {
        if let Some(connection) = self.active.get(&from) {
            let expected = crate::common::transaction_id(transaction_id)
                .map(|tid| connection.transactions.contains_key(&tid))
                .unwrap_or(false);

            if let (true, Some(id)) = (expected, connection.id) {
                table.node_failed(&id);
            }
        }
    }

    /// Time out expired transactions.
    pub fn tick(&mut self, socket: &mut KrpcSocket, table: &mut RoutingTable) {
        self.tick_at(socket, table, Instant::now())
    }

    pub(crate) fn tick_at(
        &mut self,
        socket: &mut KrpcSocket,
        table: &mut RoutingTable,
        now: Instant,
    ) {
        let own_id = self.own_id;
        let deadline = now + self.request_timeout;
        let completions = &self.completions;

        self.active.retain(|address, connection| {
            let expired: Vec<u16> = connection
                .transactions
                .iter()
                .filter(|(_, transaction)| transaction.deadline <= now)
                .map(|(tid, _)| *tid)
                .collect();

            if expired.is_empty() {
                return true;
            }

            for tid in expired {
                if let Some(transaction) = connection.transactions.remove(&tid) {
                    debug!(?address, tid, "Transaction timed out");

                    if let Some(id) = connection.id {
                        table.node_failed(&id);
                    }

                    let _ = completions.send(Completion {
                        requester: transaction.requester,
                        from: *address,
                        result: TransactionResult::Timeout,
                    });
                }
            }

            connection.unqueue(socket, own_id, deadline);

            !connection.is_idle()
        });
    }

    #[cfg(test)]
    /// Outstanding transaction ids and queue length for an address.
    pub(crate) fn state(&self, address: &SocketAddrV4) -> Option<(Vec<u16>, usize)> {
        self.active.get(address).map(|connection| {
            (
                connection.transactions.keys().copied().collect(),
                connection.queue.len(),
            )
        })
    }
}

#[cfg(test)]
mod test {
    use std::net::UdpSocket;

    use flume::Receiver;

    use super::*;
    use crate::rpc::config::Config;

    fn setup() -> (Connections, Receiver<Completion>, KrpcSocket, SocketAddrV4, Id) {
        let own_id = Id::random();
        let (sender, receiver) = flume::unbounded();

        let socket = KrpcSocket::new(&Config {
            port: Some(0),
            ..Default::default()
        })
        .unwrap();

        // A silent peer, it never answers.
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = match peer.local_addr().unwrap() {
            std::net::SocketAddr::V4(address) => address,
            _ => unreachable!(),
        };
        std::mem::forget(peer);

        (
            Connections::new(own_id, Duration::from_secs(10), sender),
            receiver,
            socket,
            address,
            own_id,
        )
    }

    fn response(tid: u16, responder_id: Id) -> Message {
        Message {
            transaction_id: tid.to_be_bytes().to_vec(),
            version: None,
            message_type: MessageType::Response(ResponseSpecific::empty(responder_id)),
        }
    }

    fn requester(request: u32) -> Requester {
        Requester::Traversal {
            traversal: 0,
            request,
        }
    }

    #[test]
    fn sixth_query_is_queued_then_issued() {
        let (mut connections, completions, mut socket, address, own_id) = setup();
        let mut table = RoutingTable::new(own_id);
        let peer_id = Id::random();

        for i in 0..7 {
            connections.query(
                &mut socket,
                Contact::new(address),
                RequestTypeSpecific::Ping,
                requester(i),
            );
        }

        let (outstanding, queued) = connections.state(&address).unwrap();
        assert_eq!(outstanding.len(), MAX_OUTSTANDING);
        assert_eq!(queued, 2);

        connections.receive(&mut socket, &mut table, address, response(outstanding[0], peer_id));

        let completion = completions.try_recv().unwrap();
        assert_eq!(completion.from, address);
        assert!(matches!(completion.result, TransactionResult::Response(_)));
        assert!(table.contains(&peer_id));

        let (outstanding, queued) = connections.state(&address).unwrap();
        assert_eq!(outstanding.len(), MAX_OUTSTANDING);
        assert_eq!(queued, 1);
    }

    #[test]
    fn timeouts_fail_and_drain_the_queue() {
        let (mut connections, completions, mut socket, address, own_id) = setup();
        let mut table = RoutingTable::new(own_id);

        let peer_id = Id::random();
        table.node_seen(Node::new(peer_id, address));

        let now = Instant::now();

        for i in 0..6 {
            connections.query_at(
                &mut socket,
                Contact::new(address).with_id(peer_id),
                RequestTypeSpecific::Ping,
                requester(i),
                now,
            );
        }

        connections.tick_at(&mut socket, &mut table, now + Duration::from_secs(5));
        assert!(completions.is_empty());

        let later = now + Duration::from_secs(11);
        connections.tick_at(&mut socket, &mut table, later);

        assert_eq!(completions.len(), MAX_OUTSTANDING);
        assert!(completions
            .drain()
            .all(|c| c.result == TransactionResult::Timeout));
        assert_eq!(
            table.entries().next().unwrap().liveness,
            crate::common::Liveness::Failing(5)
        );

        // The queued query was issued.
        let (outstanding, queued) = connections.state(&address).unwrap();
        assert_eq!(outstanding.len(), 1);
        assert_eq!(queued, 0);

        connections.tick_at(&mut socket, &mut table, later + Duration::from_secs(11));
        assert_eq!(completions.len(), 1);

        // Garbage collected once empty.
        assert!(connections.state(&address).is_none());
        assert_eq!(connections.len(), 0);
    }

    #[test]
    fn responder_id_mismatch_is_a_failure() {
        let (mut connections, completions, mut socket, address, own_id) = setup();
        let mut table = RoutingTable::new(own_id);

        let peer_id = Id::random();
        table.node_seen(Node::new(peer_id, address));

        connections.query(
            &mut socket,
            Contact::new(address).with_id(peer_id),
            RequestTypeSpecific::Ping,
            requester(0),
        );

        let (outstanding, _) = connections.state(&address).unwrap();

        connections.receive(
            &mut socket,
            &mut table,
            address,
            response(outstanding[0], Id::random()),
        );

        assert!(completions.is_empty());
        assert_eq!(
            table.entries().next().unwrap().liveness,
            crate::common::Liveness::Failing(1)
        );
        assert_eq!(connections.state(&address).unwrap().0, outstanding);

        // The genuine answer still completes the transaction.
        connections.receive(&mut socket, &mut table, address, response(outstanding[0], peer_id));

        assert_eq!(completions.len(), 1);
        assert!(table.entries().next().unwrap().liveness.is_good());
        assert!(connections.state(&address).is_none());
    }

    #[test]
    fn error_reply_completes_as_failure() {
        let (mut connections, completions, mut socket, address, own_id) = setup();
        let mut table = RoutingTable::new(own_id);

        let peer_id = Id::random();
        table.node_seen(Node::new(peer_id, address));

        connections.query(
            &mut socket,
            Contact::new(address).with_id(peer_id),
            RequestTypeSpecific::Ping,
            requester(0),
        );

        let (outstanding, _) = connections.state(&address).unwrap();

        connections.receive(
            &mut socket,
            &mut table,
            address,
            Message {
                transaction_id: outstanding[0].to_be_bytes().to_vec(),
                version: None,
                message_type: MessageType::Error(ErrorSpecific::new(202)),
            },
        );

        let completion = completions.try_recv().unwrap();
        assert_eq!(
            completion.result,
            TransactionResult::Error(ErrorSpecific::new(202))
        );
        assert_eq!(
            table.entries().next().unwrap().liveness,
            crate::common::Liveness::Failing(1)
        );
    }

    #[test]
    fn unknown_transactions_are_dropped() {
        let (mut connections, completions, mut socket, address, own_id) = setup();
        let mut table = RoutingTable::new(own_id);

        connections.receive(&mut socket, &mut table, address, response(1, Id::random()));

        connections.query(
            &mut socket,
            Contact::new(address),
            RequestTypeSpecific::Ping,
            requester(0),
        );
        let (outstanding, _) = connections.state(&address).unwrap();
        let wrong = outstanding[0].wrapping_add(1);

        connections.receive(&mut socket, &mut table, address, response(wrong, Id::random()));

        assert!(completions.is_empty());
        assert!(table.is_empty());
    }
}
