//! Kademlia routing table with splitting k-buckets.

use tracing::trace;

use crate::common::{Id, Node, ID_BITS};

/// K = the maximum number of live contacts in a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 8;
/// Consecutive failures after which a live contact is evicted.
pub const MAX_FAIL: u8 = 20;

/// Staleness hint of a fresh bucket, see [KBucket::last_refresh].
const DEFAULT_LAST_REFRESH: u64 = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How much a contact in the routing table can be trusted to respond.
pub enum Liveness {
    /// Heard about from another node, never queried directly.
    Questionable,
    /// Responded to our last query.
    Good,
    /// Number of consecutive failed queries.
    Failing(u8),
}

impl Liveness {
    pub fn failures(&self) -> u8 {
        match self {
            Liveness::Failing(failures) => *failures,
            _ => 0,
        }
    }

    pub fn is_good(&self) -> bool {
        *self == Liveness::Good
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A [Node] and its [Liveness].
pub struct BucketEntry {
    pub node: Node,
    pub liveness: Liveness,
}

#[derive(Debug, Clone)]
/// Up to [MAX_BUCKET_SIZE_K] live contacts, and as many replacements.
pub struct KBucket {
    live: Vec<BucketEntry>,
    replacement: Vec<BucketEntry>,
    /// Seconds since the unix epoch at which this bucket was last refreshed.
    ///
    /// Freshly split buckets start with a small value so that they are
    /// picked for refresh sooner, it is a hint, not a deadline.
    last_refresh: u64,
}

impl KBucket {
    fn new() -> Self {
        KBucket {
            live: Vec::with_capacity(MAX_BUCKET_SIZE_K),
            replacement: Vec::new(),
            last_refresh: DEFAULT_LAST_REFRESH,
        }
    }

    pub fn live(&self) -> &[BucketEntry] {
        &self.live
    }

    pub fn replacement(&self) -> &[BucketEntry] {
        &self.replacement
    }

    pub fn last_refresh(&self) -> u64 {
        self.last_refresh
    }

    /// Move an existing entry with the same id to the back of its list.
    ///
    /// The stored record is only replaced if the incoming one is good and
    /// the stored one is not. Returns `false` if no such entry exists.
    fn refresh_existing(&mut self, incoming: &BucketEntry) -> bool {
        for list in [&mut self.live, &mut self.replacement] {
            if let Some(position) = list.iter().position(|e| e.node.id == incoming.node.id) {
                let existing = list.remove(position);

                if incoming.liveness.is_good() && !existing.liveness.is_good() {
                    list.push(*incoming);
                } else {
                    list.push(existing);
                }

                return true;
            }
        }

        false
    }

    /// Replace the first questionable entry, or the one failing the most.
    fn evict_live(&mut self, incoming: BucketEntry) -> bool {
        let position = self
            .live
            .iter()
            .position(|e| e.liveness == Liveness::Questionable)
            .or_else(|| most_failed(&self.live, 1));

        match position {
            Some(position) => {
                trace!(evicted = ?self.live[position], ?incoming, "Evicting live contact");

                self.live.remove(position);
                self.live.push(incoming);
                true
            }
            None => false,
        }
    }

    fn add_replacement(&mut self, incoming: BucketEntry) {
        if self.replacement.len() < MAX_BUCKET_SIZE_K {
            self.replacement.push(incoming);
            return;
        }

        if let Some(position) = self
            .replacement
            .iter()
            .position(|e| e.liveness == Liveness::Questionable)
        {
            self.replacement.remove(position);
            self.replacement.push(incoming);
            return;
        }

        if let Some(position) = most_failed(&self.replacement, 0) {
            // Good replacements only give way to good contacts.
            if self.replacement[position].liveness.failures() > 0 || incoming.liveness.is_good() {
                self.replacement.remove(position);
                self.replacement.push(incoming);
            }
        }
    }

    /// Move every entry sharing more than `index` bits with `own_id`
    /// into a new bucket.
    fn split(&mut self, own_id: &Id, index: usize) -> KBucket {
        let mut new_bucket = KBucket::new();
        let deeper = |entry: &BucketEntry| own_id.common_prefix_len(&entry.node.id) > index;

        let (moved, stayed): (Vec<_>, Vec<_>) = self.live.drain(..).partition(deeper);
        new_bucket.live = moved;
        self.live = stayed;

        for entry in std::mem::take(&mut self.replacement) {
            let side = if deeper(&entry) {
                &mut new_bucket
            } else {
                &mut *self
            };

            if side.live.len() < MAX_BUCKET_SIZE_K {
                side.live.push(entry);
            } else {
                side.replacement.push(entry);
            }
        }

        new_bucket.last_refresh = (ID_BITS - index - 1) as u64;

        new_bucket
    }
}

/// First entry with the most failures, if it has at least `min` failures.
fn most_failed(entries: &[BucketEntry], min: u8) -> Option<usize> {
    let mut result = None;
    let mut max = None;

    for (i, entry) in entries.iter().enumerate() {
        let failures = entry.liveness.failures();

        if failures >= min && max.map_or(true, |max| failures > max) {
            max = Some(failures);
            result = Some(i);
        }
    }

    result
}

#[derive(Debug, Clone)]
/// Kademlia routing table.
///
/// Bucket `i` holds contacts sharing exactly `i` leading bits with the
/// local id, except the last bucket which holds everything from its
/// index onwards. Only the last bucket ever splits.
pub struct RoutingTable {
    id: Id,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            buckets: vec![KBucket::new()],
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    // === Public Methods ===

    /// Record a contact that just responded to us.
    pub fn node_seen(&mut self, node: Node) {
        self.add(BucketEntry {
            node,
            liveness: Liveness::Good,
        })
    }

    /// Record a contact we learned about from another node.
    pub fn heard_about(&mut self, node: Node) {
        self.add(BucketEntry {
            node,
            liveness: Liveness::Questionable,
        })
    }

    /// Record a failed round trip to the contact with this id.
    pub fn node_failed(&mut self, id: &Id) {
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];

        if let Some(position) = bucket.live.iter().position(|e| &e.node.id == id) {
            if bucket.replacement.is_empty() {
                let entry = &mut bucket.live[position];
                let failures = entry.liveness.failures() + 1;

                if entry.liveness == Liveness::Questionable || failures >= MAX_FAIL {
                    trace!(?id, "Removing failing contact");
                    bucket.live.remove(position);
                } else {
                    entry.liveness = Liveness::Failing(failures);
                }
            } else {
                bucket.live.remove(position);

                let promoted = bucket
                    .replacement
                    .iter()
                    .position(|e| e.liveness.is_good())
                    .unwrap_or(0);
                let entry = bucket.replacement.remove(promoted);

                trace!(?id, replacement = ?entry.node, "Replacing failing contact");
                bucket.live.push(entry);
            }

            return;
        }

        bucket.replacement.retain(|e| &e.node.id != id);
    }

    /// Up to `count` contacts (all if `None`) ordered by distance to `target`.
    ///
    /// Contacts are drawn from the target's bucket first, then from the
    /// more specific buckets, then from the less specific ones until `count`
    /// is reached. Unless `include_failed` is set (implied by `count == None`),
    /// only [Liveness::Good] contacts are returned.
    pub fn lookup(&self, target: &Id, count: Option<usize>, include_failed: bool) -> Vec<Node> {
        let include_failed = include_failed || count.is_none();
        let wanted = count.unwrap_or(usize::MAX);

        let eligible = |entry: &&BucketEntry| include_failed || entry.liveness.is_good();
        let sort = |nodes: &mut Vec<Node>| nodes.sort_by(|a, b| target.cmp_distance(&a.id, &b.id));

        let index = self.bucket_index(target);

        let mut result: Vec<Node> = self.buckets[index]
            .live
            .iter()
            .filter(eligible)
            .map(|e| e.node)
            .collect();
        sort(&mut result);

        if result.len() < wanted {
            let mut higher: Vec<Node> = self.buckets[index + 1..]
                .iter()
                .flat_map(|bucket| bucket.live.iter())
                .filter(eligible)
                .map(|e| e.node)
                .collect();
            sort(&mut higher);
            result.append(&mut higher);
        }

        if result.len() < wanted {
            let mut lower = Vec::new();

            for bucket in self.buckets[..index].iter().rev() {
                if result.len() + lower.len() >= wanted {
                    break;
                }

                lower.extend(bucket.live.iter().filter(eligible).map(|e| e.node));
            }

            sort(&mut lower);
            result.append(&mut lower);
        }

        result.truncate(wanted);
        result
    }

    /// The [MAX_BUCKET_SIZE_K] closest good contacts to `target`.
    pub fn closest(&self, target: &Id) -> Vec<Node> {
        self.lookup(target, Some(MAX_BUCKET_SIZE_K), false)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of live contacts.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.live.len()).sum()
    }

    /// Returns true if a live contact with this id exists.
    pub fn contains(&self, id: &Id) -> bool {
        self.buckets[self.bucket_index(id)]
            .live
            .iter()
            .any(|e| &e.node.id == id)
    }

    /// Iterate over all live entries.
    pub fn entries(&self) -> impl Iterator<Item = &BucketEntry> {
        self.buckets.iter().flat_map(|bucket| bucket.live.iter())
    }

    /// Live contacts.
    pub fn nodes(&self) -> Vec<Node> {
        self.entries().map(|e| e.node).collect()
    }

    /// Turn this routing table's good contacts to a list of bootstrapping nodes.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.entries()
            .filter(|e| e.liveness.is_good())
            .map(|e| e.node.address.to_string())
            .collect()
    }

    // === Crate Methods ===

    /// Index of the bucket covering this id.
    pub(crate) fn bucket_index(&self, id: &Id) -> usize {
        self.id
            .common_prefix_len(id)
            .min(self.buckets.len() - 1)
    }

    /// Bucket with the lowest `last_refresh + live.len() * 5`, if that is
    /// lower than `now + K * 5`.
    pub(crate) fn stalest_bucket(&self, now: u64) -> Option<usize> {
        let mut min_score = now + (MAX_BUCKET_SIZE_K * 5) as u64;
        let mut result = None;

        for (index, bucket) in self.buckets.iter().enumerate() {
            let score = bucket.last_refresh + (bucket.live.len() * 5) as u64;

            if score < min_score {
                min_score = score;
                result = Some(index);
            }
        }

        result
    }

    pub(crate) fn set_last_refresh(&mut self, index: usize, now: u64) {
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.last_refresh = now;
        }
    }

    // === Private Methods ===

    fn add(&mut self, incoming: BucketEntry) {
        if incoming.node.id == self.id {
            return;
        }

        let own_id = self.id;
        let last = self.buckets.len() - 1;
        let index = self.bucket_index(&incoming.node.id);
        let bucket = &mut self.buckets[index];

        if bucket.refresh_existing(&incoming) {
            return;
        }

        if bucket.live.len() < MAX_BUCKET_SIZE_K {
            bucket.live.push(incoming);
            return;
        }

        let mut can_split = false;

        if incoming.liveness.is_good() {
            can_split = index == last && index < ID_BITS - 1;

            if bucket.evict_live(incoming) {
                return;
            }
        }

        if !can_split {
            bucket.add_replacement(incoming);
            return;
        }

        let new_bucket = bucket.split(&own_id, index);
        self.buckets.push(new_bucket);

        trace!(buckets = self.buckets.len(), "Split the last bucket");

        let index = self.bucket_index(&incoming.node.id);
        let bucket = &mut self.buckets[index];

        if bucket.live.len() < MAX_BUCKET_SIZE_K {
            bucket.live.push(incoming);
        } else if bucket.replacement.len() < MAX_BUCKET_SIZE_K {
            bucket.replacement.push(incoming);
        }
    }
}
