//! The peer table: who we can route to, and which peer owns which slice
//! of the key space.
//!
//! Three views are kept mutually consistent under one readers-writer
//! lock: a UUID map holding the peers themselves, a URL map so that
//! control messages carrying only a URL can find their entry, and a
//! consistent-hash ring of [`VIRTUAL_NODES`] positions per peer. The
//! local node is always present, so ring lookups are total.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::upstream::HttpBackend;

/// Ring positions per peer. More positions smooth the key distribution
/// at the cost of ring size; adding or removing one peer reassigns about
/// `1/N` of the key space either way.
pub const VIRTUAL_NODES: u32 = 128;

/// FNV-1a, 64-bit. Stable across platforms and builds; changing it would
/// re-shuffle routing for the whole deployment at once.
pub fn fnv1a(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn vnode_hash(uuid: &str, index: u32) -> u64 {
    fnv1a(format!("{uuid}:{index}").as_bytes())
}

/// Another reachable coordinator, or ourselves.
///
/// Handed out by [`PeerTable::lookup`] as a reference-counted value, so a
/// caller can keep using a peer whose removal races with the call.
#[derive(Debug)]
pub struct Peer {
    /// Stable for the peer's process lifetime.
    pub uuid: String,
    /// Base URL of the peer's embedded HTTP server.
    pub url: String,
    pub backend: Arc<HttpBackend>,
}

#[derive(Debug, Default)]
struct Inner {
    by_uuid: HashMap<String, Arc<Peer>>,
    by_url: HashMap<String, String>,
    /// hash(uuid ‖ ':' ‖ vnode_index) → uuid. On the astronomically rare
    /// hash collision the lexicographically smaller uuid keeps the slot,
    /// so the ring's content never depends on insertion order.
    ring: BTreeMap<u64, String>,
}

#[derive(Debug)]
pub struct PeerTable {
    self_uuid: String,
    inner: RwLock<Inner>,
}

impl PeerTable {
    /// A table holding only the local node mapped to its direct upstream.
    pub fn new(self_peer: Peer) -> Self {
        let table = PeerTable {
            self_uuid: self_peer.uuid.clone(),
            inner: RwLock::new(Inner::default()),
        };
        table.insert(self_peer);
        table
    }

    pub fn self_uuid(&self) -> &str {
        &self.self_uuid
    }

    /// Insert a peer, idempotently by UUID. A URL that moved to a new
    /// UUID replaces its previous owner: the old process is gone, only
    /// its address was recycled.
    pub fn insert(&self, peer: Peer) {
        let mut inner = self.inner.write().unwrap();

        if let Some(old_uuid) = inner.by_url.get(&peer.url).cloned() {
            if old_uuid != peer.uuid {
                remove_locked(&mut inner, &old_uuid);
            }
        }
        match inner.by_uuid.get(&peer.uuid).map(|p| p.url.clone()) {
            Some(old_url) => {
                // Same process, new address; drop the old URL mapping.
                // The ring positions depend only on the UUID and stay.
                if old_url != peer.url {
                    inner.by_url.remove(&old_url);
                }
            }
            None => {
                for index in 0..VIRTUAL_NODES {
                    add_ring_position(&mut inner.ring, &peer.uuid, index);
                }
            }
        }
        inner.by_url.insert(peer.url.clone(), peer.uuid.clone());
        inner.by_uuid.insert(peer.uuid.clone(), Arc::new(peer));
    }

    /// Remove the peer owning `url`. A no-op for unknown URLs, and never
    /// removes the local node: routing must stay total.
    pub fn remove_by_url(&self, url: &str) {
        let mut inner = self.inner.write().unwrap();
        let Some(uuid) = inner.by_url.get(url).cloned() else {
            return;
        };
        if uuid == self.self_uuid {
            return;
        }
        remove_locked(&mut inner, &uuid);
    }

    /// Whether `url` currently maps to a peer.
    pub fn check_url(&self, url: &str) -> bool {
        self.inner.read().unwrap().by_url.contains_key(url)
    }

    /// The peer whose virtual node is the first ring position at or past
    /// `hash(key)`, wrapping around. Total, because the local node is
    /// always on the ring.
    pub fn lookup(&self, key: &str) -> Arc<Peer> {
        let hash = fnv1a(key.as_bytes());
        let inner = self.inner.read().unwrap();
        let uuid = inner
            .ring
            .range(hash..)
            .next()
            .or_else(|| inner.ring.iter().next())
            .map(|(_, uuid)| uuid)
            .expect("ring holds at least the local node");
        Arc::clone(
            inner
                .by_uuid
                .get(uuid)
                .expect("every ring entry has a peer"),
        )
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the peers under the read lock.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Peer>)) {
        let inner = self.inner.read().unwrap();
        for peer in inner.by_uuid.values() {
            f(peer);
        }
    }

    /// The current peer UUIDs, sorted. Diagnostic.
    pub fn uuids(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut uuids: Vec<_> = inner.by_uuid.keys().cloned().collect();
        uuids.sort();
        uuids
    }
}

fn remove_locked(inner: &mut Inner, uuid: &str) {
    let Some(peer) = inner.by_uuid.remove(uuid) else {
        return;
    };
    inner.by_url.remove(&peer.url);
    for index in 0..VIRTUAL_NODES {
        let hash = vnode_hash(uuid, index);
        if inner.ring.get(&hash).map(String::as_str) == Some(uuid) {
            inner.ring.remove(&hash);
        }
    }
    // A removed peer may have been shadowing a colliding slot of another
    // peer; re-add the survivors' positions.
    let survivors: Vec<String> = inner.by_uuid.keys().cloned().collect();
    for survivor in survivors {
        for index in 0..VIRTUAL_NODES {
            add_ring_position(&mut inner.ring, &survivor, index);
        }
    }
}

/// Claim one ring slot. On the astronomically rare hash collision the
/// lexicographically smaller uuid wins, keeping the ring independent of
/// insertion order.
fn add_ring_position(ring: &mut BTreeMap<u64, String>, uuid: &str, index: u32) {
    let hash = vnode_hash(uuid, index);
    let keep_existing = matches!(ring.get(&hash), Some(existing) if existing.as_str() <= uuid);
    if !keep_existing {
        ring.insert(hash, uuid.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::upstream::UpstreamKind;
    use crate::volatile::Volatiles;

    fn peer(uuid: &str, url: &str) -> Peer {
        let vols = Volatiles::from_env();
        Peer {
            uuid: uuid.to_owned(),
            url: url.to_owned(),
            backend: Arc::new(HttpBackend::new(url, &vols, UpstreamKind::Peer)),
        }
    }

    fn table() -> PeerTable {
        PeerTable::new(peer("self-0000", "http://127.0.0.1:1000"))
    }

    #[test]
    fn insert_is_idempotent() {
        let t = table();
        t.insert(peer("aaaa", "http://127.0.0.1:2000"));
        t.insert(peer("aaaa", "http://127.0.0.1:2000"));
        assert_eq!(t.len(), 2);
        assert_eq!(t.uuids(), vec!["aaaa".to_string(), "self-0000".to_string()]);
    }

    #[test]
    fn url_reassignment_replaces_old_peer() {
        let t = table();
        t.insert(peer("aaaa", "http://127.0.0.1:2000"));
        // The address was recycled by a restarted process.
        t.insert(peer("bbbb", "http://127.0.0.1:2000"));
        assert_eq!(t.uuids(), vec!["bbbb".to_string(), "self-0000".to_string()]);
    }

    #[test]
    fn remove_is_idempotent_and_spares_self() {
        let t = table();
        t.insert(peer("aaaa", "http://127.0.0.1:2000"));
        t.remove_by_url("http://127.0.0.1:2000");
        t.remove_by_url("http://127.0.0.1:2000");
        t.remove_by_url("http://127.0.0.1:9999");
        assert_eq!(t.len(), 1);

        t.remove_by_url("http://127.0.0.1:1000");
        assert_eq!(t.len(), 1);
        assert!(t.check_url("http://127.0.0.1:1000"));
    }

    #[test]
    fn lookup_is_total_and_deterministic() {
        let build = |order: &[(&str, &str)]| {
            let t = table();
            for (uuid, url) in order {
                t.insert(peer(uuid, url));
            }
            t
        };
        // The same membership reached through different insertion orders
        // routes identically: every node agrees on the owner.
        let t1 = build(&[
            ("aaaa", "http://127.0.0.1:2000"),
            ("bbbb", "http://127.0.0.1:3000"),
            ("cccc", "http://127.0.0.1:4000"),
        ]);
        let t2 = build(&[
            ("cccc", "http://127.0.0.1:4000"),
            ("aaaa", "http://127.0.0.1:2000"),
            ("bbbb", "http://127.0.0.1:3000"),
        ]);
        for i in 0..500 {
            let key = format!("/a/file{i}");
            assert_eq!(t1.lookup(&key).uuid, t2.lookup(&key).uuid);
            // Repeated lookups agree with themselves.
            assert_eq!(t1.lookup(&key).uuid, t1.lookup(&key).uuid);
        }
    }

    #[test]
    fn lookup_spreads_keys_across_peers() {
        let t = table();
        t.insert(peer("aaaa", "http://127.0.0.1:2000"));
        t.insert(peer("bbbb", "http://127.0.0.1:3000"));
        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..3000 {
            let key = format!("/a/file{i}");
            *counts.entry(t.lookup(&key).uuid.clone()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for (_, count) in counts {
            // Expected 1000 per peer; 128 virtual nodes keep every peer
            // holding a substantial share.
            assert!(count > 300, "count: {count}");
        }
    }

    #[test]
    fn single_membership_change_moves_few_keys() {
        let t = table();
        t.insert(peer("aaaa", "http://127.0.0.1:2000"));
        t.insert(peer("bbbb", "http://127.0.0.1:3000"));
        t.insert(peer("cccc", "http://127.0.0.1:4000"));

        let keys: Vec<String> = (0..2000).map(|i| format!("/a/file{i}")).collect();
        let before: Vec<String> = keys.iter().map(|k| t.lookup(k).uuid.clone()).collect();

        t.insert(peer("dddd", "http://127.0.0.1:5000"));
        let moved = keys
            .iter()
            .zip(&before)
            .filter(|(k, owner)| &t.lookup(k).uuid != *owner)
            .count();
        // Expected 1/5 of the key space; anything approaching half means
        // the ring is broken.
        assert!(moved < 800, "moved: {moved}");

        // Removing it again restores the previous routing exactly.
        t.remove_by_url("http://127.0.0.1:5000");
        let after: Vec<String> = keys.iter().map(|k| t.lookup(k).uuid.clone()).collect();
        assert_eq!(before, after);
    }
}
