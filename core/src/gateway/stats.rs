// Traffic counters: per peer and per protocol

use crate::identity::IdUrl;
use crate::transport::Protocol;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// How many recently working protocols are remembered per peer.
const MAX_WORKING: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub packets_in: u64,
    pub packets_in_failed: u64,
    pub packets_out: u64,
    pub packets_out_failed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrafficStats {
    pub peers: HashMap<IdUrl, Counters>,
    pub protocols: HashMap<Protocol, Counters>,
    #[serde(skip)]
    working: HashMap<IdUrl, VecDeque<Protocol>>,
}

impl TrafficStats {
    pub fn inbound(&mut self, peer: Option<&IdUrl>, proto: Protocol, bytes: u64, ok: bool) {
        let mut bump = |c: &mut Counters| {
            if ok {
                c.packets_in += 1;
                c.bytes_in += bytes;
            } else {
                c.packets_in_failed += 1;
            }
        };
        bump(self.protocols.entry(proto).or_default());
        if let Some(peer) = peer {
            bump(self.peers.entry(peer.clone()).or_default());
        }
    }

    pub fn outbound(&mut self, peer: &IdUrl, proto: Protocol, bytes: u64, ok: bool) {
        let mut bump = |c: &mut Counters| {
            if ok {
                c.packets_out += 1;
                c.bytes_out += bytes;
            } else {
                c.packets_out_failed += 1;
            }
        };
        bump(self.protocols.entry(proto).or_default());
        bump(self.peers.entry(peer.clone()).or_default());
    }

    /// `proto` just worked for `peer`; move it to the front.
    pub fn mark_working(&mut self, peer: &IdUrl, proto: Protocol) {
        let list = self.working.entry(peer.clone()).or_default();
        list.retain(|p| *p != proto);
        list.push_front(proto);
        list.truncate(MAX_WORKING);
    }

    pub fn working(&self, peer: &IdUrl) -> Vec<Protocol> {
        self.working
            .get(peer)
            .map(|list| list.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn peer(&self, peer: &IdUrl) -> Counters {
        self.peers.get(peer).cloned().unwrap_or_default()
    }

    pub fn protocol(&self, proto: Protocol) -> Counters {
        self.protocols.get(&proto).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_split_by_peer_and_protocol() {
        let mut stats = TrafficStats::default();
        let bob = IdUrl::new("http://id.local/bob.xml");
        stats.inbound(Some(&bob), Protocol::Tcp, 100, true);
        stats.inbound(None, Protocol::Tcp, 0, false);
        stats.outbound(&bob, Protocol::Udp, 40, true);
        stats.outbound(&bob, Protocol::Udp, 0, false);

        assert_eq!(stats.peer(&bob).packets_in, 1);
        assert_eq!(stats.peer(&bob).bytes_out, 40);
        assert_eq!(stats.peer(&bob).packets_out_failed, 1);
        assert_eq!(stats.protocol(Protocol::Tcp).packets_in_failed, 1);
        assert_eq!(stats.protocol(Protocol::Tcp).bytes_in, 100);
    }

    #[test]
    fn test_working_is_most_recent_first() {
        let mut stats = TrafficStats::default();
        let bob = IdUrl::new("bob");
        stats.mark_working(&bob, Protocol::Tcp);
        stats.mark_working(&bob, Protocol::Udp);
        stats.mark_working(&bob, Protocol::Tcp);
        assert_eq!(stats.working(&bob), vec![Protocol::Tcp, Protocol::Udp]);
        assert!(stats.working(&IdUrl::new("carol")).is_empty());
    }
}
