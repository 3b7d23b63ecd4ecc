use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use crate::now_millis;
use crate::store::{read_json_opt, write_json_atomic};
use crate::wire::PeerAddr;

pub const INITIAL_TRUST: f64 = 0.5;
pub const SUCCESS_BOOST: f64 = 0.1;
pub const FAILURE_PENALTY: f64 = 0.2;
pub const MAX_KNOWN_PEERS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownPeer {
    pub host: String,
    pub port: u16,
    pub last_seen: i64,
    pub trust_score: f64,
}

impl KnownPeer {
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn addr(&self) -> PeerAddr {
        PeerAddr {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Split `host:port`. IPv6 hosts may be bracketed.
pub fn parse_peer_addr(s: &str) -> Option<PeerAddr> {
    let (host, port) = s.trim().rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    Some(PeerAddr {
        host: host.to_string(),
        port,
    })
}

/// Persisted address book. Failures lower trust but never evict; only a
/// full book makes room by dropping its least trusted, longest unseen entry.
#[derive(Debug, Default)]
pub struct KnownPeerBook {
    path: Option<PathBuf>,
    peers: BTreeMap<String, KnownPeer>,
}

impl KnownPeerBook {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn load(path: Option<PathBuf>) -> io::Result<Self> {
        let list: Vec<KnownPeer> = match path.as_ref() {
            Some(path) => read_json_opt(path)?.unwrap_or_default(),
            None => Vec::new(),
        };
        let peers = list
            .into_iter()
            .map(|mut p| {
                p.trust_score = clamp_trust(p.trust_score);
                (p.id(), p)
            })
            .collect();
        let mut book = Self { path, peers };
        if book.peers.len() > MAX_KNOWN_PEERS {
            let keep: BTreeMap<String, KnownPeer> = book
                .ranked()
                .into_iter()
                .take(MAX_KNOWN_PEERS)
                .map(|p| (p.id(), p))
                .collect();
            book.peers = keep;
        }
        Ok(book)
    }

    pub fn save(&self) -> io::Result<()> {
        match &self.path {
            Some(path) => {
                let list: Vec<&KnownPeer> = self.peers.values().collect();
                write_json_atomic(path, &list)
            }
            None => Ok(()),
        }
    }

    /// Returns true when the address was added. A full book only admits a
    /// newcomer in place of an entry trusted no more than a fresh one.
    pub fn insert(&mut self, addr: &PeerAddr) -> bool {
        let id = addr.id();
        if self.peers.contains_key(&id) {
            return false;
        }
        if self.peers.len() >= MAX_KNOWN_PEERS && !self.evict_weakest() {
            return false;
        }
        self.peers.insert(
            id,
            KnownPeer {
                host: addr.host.clone(),
                port: addr.port,
                last_seen: 0,
                trust_score: INITIAL_TRUST,
            },
        );
        true
    }

    fn evict_weakest(&mut self) -> bool {
        let weakest = self
            .peers
            .values()
            .min_by(|a, b| {
                a.trust_score
                    .total_cmp(&b.trust_score)
                    .then_with(|| a.last_seen.cmp(&b.last_seen))
            })
            .filter(|p| p.trust_score <= INITIAL_TRUST)
            .map(|p| p.id());
        match weakest {
            Some(id) => self.peers.remove(&id).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.peers.contains_key(&addr.id())
    }

    pub fn record_success(&mut self, addr: &PeerAddr) {
        self.insert(addr);
        if let Some(peer) = self.peers.get_mut(&addr.id()) {
            peer.trust_score = clamp_trust(peer.trust_score + SUCCESS_BOOST);
            peer.last_seen = now_millis();
        }
    }

    pub fn record_failure(&mut self, addr: &PeerAddr) {
        if let Some(peer) = self.peers.get_mut(&addr.id()) {
            peer.trust_score = clamp_trust(peer.trust_score - FAILURE_PENALTY);
        }
    }

    pub fn touch(&mut self, addr: &PeerAddr) {
        if let Some(peer) = self.peers.get_mut(&addr.id()) {
            peer.last_seen = now_millis();
        }
    }

    pub fn get(&self, id: &str) -> Option<&KnownPeer> {
        self.peers.get(id)
    }

    /// Highest trust first, most recently seen breaking ties.
    pub fn ranked(&self) -> Vec<KnownPeer> {
        let mut list: Vec<KnownPeer> = self.peers.values().cloned().collect();
        list.sort_by(|a, b| {
            b.trust_score
                .total_cmp(&a.trust_score)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        list
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn clamp_trust(score: f64) -> f64 {
    if score.is_nan() {
        return INITIAL_TRUST;
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn addr(port: u16) -> PeerAddr {
        PeerAddr {
            host: "127.0.0.1".into(),
            port,
        }
    }

    #[test]
    fn parse_addresses() {
        assert_eq!(parse_peer_addr("10.0.0.1:5470"), Some(PeerAddr { host: "10.0.0.1".into(), port: 5470 }));
        assert_eq!(parse_peer_addr("[::1]:80").map(|a| a.host), Some("::1".to_string()));
        assert!(parse_peer_addr("nohost").is_none());
        assert!(parse_peer_addr("host:0").is_none());
        assert!(parse_peer_addr(":5470").is_none());
    }

    #[test]
    fn trust_moves_and_clamps() {
        let mut book = KnownPeerBook::in_memory();
        assert!(book.insert(&addr(1)));
        assert!(!book.insert(&addr(1)));
        assert_eq!(book.get("127.0.0.1:1").unwrap().trust_score, INITIAL_TRUST);
        for _ in 0..10 {
            book.record_success(&addr(1));
        }
        assert_eq!(book.get("127.0.0.1:1").unwrap().trust_score, 1.0);
        for _ in 0..10 {
            book.record_failure(&addr(1));
        }
        let peer = book.get("127.0.0.1:1").unwrap();
        assert_eq!(peer.trust_score, 0.0);
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn failure_on_unknown_peer_is_ignored() {
        let mut book = KnownPeerBook::in_memory();
        book.record_failure(&addr(9));
        assert!(book.is_empty());
    }

    #[test]
    fn ranked_by_trust() {
        let mut book = KnownPeerBook::in_memory();
        book.insert(&addr(1));
        book.insert(&addr(2));
        book.insert(&addr(3));
        book.record_success(&addr(2));
        book.record_failure(&addr(3));
        let ports: Vec<u16> = book.ranked().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![2, 1, 3]);
    }

    #[test]
    fn full_book_evicts_weakest() {
        let mut book = KnownPeerBook::in_memory();
        for port in 1..=MAX_KNOWN_PEERS as u16 {
            assert!(book.insert(&addr(port)));
        }
        book.record_failure(&addr(5));
        book.record_success(&addr(6));
        assert_eq!(book.len(), MAX_KNOWN_PEERS);

        assert!(book.insert(&addr(5000)));
        assert_eq!(book.len(), MAX_KNOWN_PEERS);
        assert!(!book.contains(&addr(5)));
        assert!(book.contains(&addr(6)));
        assert!(book.contains(&addr(5000)));

        // recently seen peers outlast fresh ones
        assert!(book.insert(&addr(5001)));
        assert!(book.contains(&addr(6)));
        assert_eq!(book.len(), MAX_KNOWN_PEERS);
    }

    #[test]
    fn full_book_of_trusted_peers_refuses_newcomers() {
        let mut book = KnownPeerBook::in_memory();
        for port in 1..=MAX_KNOWN_PEERS as u16 {
            book.record_success(&addr(port));
        }
        assert!(!book.insert(&addr(5000)));
        assert!(!book.contains(&addr(5000)));
        assert_eq!(book.len(), MAX_KNOWN_PEERS);
    }

    #[test]
    fn load_truncates_oversized_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("peers.json");
        let list: Vec<KnownPeer> = (1..=MAX_KNOWN_PEERS as u16 + 5)
            .map(|port| KnownPeer {
                host: "127.0.0.1".into(),
                port,
                last_seen: 0,
                trust_score: if port == 1 { 0.9 } else { 0.1 },
            })
            .collect();
        write_json_atomic(&path, &list).unwrap();
        let loaded = KnownPeerBook::load(Some(path)).unwrap();
        assert_eq!(loaded.len(), MAX_KNOWN_PEERS);
        assert!(loaded.get("127.0.0.1:1").is_some());
    }

    #[test]
    fn save_and_load() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("peers.json");
        let mut book = KnownPeerBook::load(Some(path.clone())).unwrap();
        book.record_success(&addr(7));
        book.save().unwrap();
        let loaded = KnownPeerBook::load(Some(path)).unwrap();
        assert_eq!(loaded.len(), 1);
        let peer = loaded.get("127.0.0.1:7").unwrap();
        assert!((peer.trust_score - 0.6).abs() < 1e-9);
        assert!(peer.last_seen > 0);
    }
}
