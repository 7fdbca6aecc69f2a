//! The per-silo DNS listener, served on UDP `{bridge_ip}:53`.
//!
//! Answers A records for three classes of name: `{silo}.silo.`, the
//! well-known labels resolved against the caller's own record, and the
//! host-wide static map. Recursion is always disabled and unmatched
//! questions produce an empty-answer response with TTL-0 semantics.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use super::{DNS_PORT, MetaState};

/// Suffix naming silos by name: `{name}.silo.`.
const SILO_SUFFIX: &str = ".silo.";

/// Labels resolved against the caller's own record. `self.` maps to the
/// caller's routable address; the rest name the caller's bridge (where
/// this service lives).
const SELF_LABEL: &str = "self.";
const BRIDGE_LABELS: [&str; 4] = ["host.", "metadata.", "bridge.", "colex."];

/// Bound on a single UDP read/write.
const IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Accept loop for one silo's DNS listener.
pub(crate) async fn listener(
    state: Arc<MetaState>,
    bridge_ip: Ipv4Addr,
    mut shutdown: watch::Receiver<bool>,
    done: oneshot::Sender<()>,
) {
    let addr = SocketAddr::from((bridge_ip, DNS_PORT));
    let socket = match UdpSocket::bind(addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(listen = %addr, error = %e, "DNS bind failed");
            let _ = done.send(());
            return;
        }
    };

    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let Ok((len, peer)) = result else { continue };
                if let Some(response) = answer(&state, peer.ip(), &buf[..len]) {
                    let send = socket.send_to(&response, peer);
                    if tokio::time::timeout(IO_TIMEOUT, send).await.is_err() {
                        debug!(peer = %peer, "DNS response send timed out");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    let _ = done.send(());
}

/// Build the response datagram for one query, or `None` when the packet
/// is unparseable.
pub(crate) fn answer(state: &MetaState, src: IpAddr, query_bytes: &[u8]) -> Option<Vec<u8>> {
    let query = Message::from_vec(query_bytes).ok()?;

    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(false)
        .set_response_code(ResponseCode::NoError);
    for q in query.queries() {
        response.add_query(q.clone());
    }

    // Only silos may ask.
    let Some(caller_id) = state.silo_id_for_ip(src) else {
        response.set_response_code(ResponseCode::Refused);
        return response.to_vec().ok();
    };

    for q in query.queries() {
        if q.query_type() != RecordType::A {
            continue;
        }
        let qname = q.name().to_utf8().to_lowercase();
        if let Some(ip) = resolve_a(state, &caller_id, &qname) {
            response.add_answer(Record::from_rdata(q.name().clone(), 0, RData::A(A(ip))));
        }
    }
    response.to_vec().ok()
}

/// A-record resolution for a lowercased, dot-terminated name.
pub(crate) fn resolve_a(state: &MetaState, caller_id: &str, qname: &str) -> Option<Ipv4Addr> {
    if let Some(silo_name) = qname.strip_suffix(SILO_SUFFIX) {
        let tables = state.tables.read().expect("metadata tables lock");
        let id = tables.by_name.get(silo_name)?;
        return tables.by_id.get(id)?.routeable_ip;
    }

    if qname == SELF_LABEL {
        let tables = state.tables.read().expect("metadata tables lock");
        return tables.by_id.get(caller_id)?.routeable_ip;
    }
    if BRIDGE_LABELS.contains(&qname) {
        let tables = state.tables.read().expect("metadata tables lock");
        return tables.by_id.get(caller_id)?.bridge_ip;
    }

    let bare = qname.strip_suffix('.').unwrap_or(qname);
    let map = state.host_map.read().expect("host map lock");
    map.get(bare).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetaSilo, Tables};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::RwLock;
    use std::time::SystemTime;

    use colex_core::wire::{Interface, InterfaceKind, InterfaceStats};
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn silo(name: &str, id: &str, bridge: &str, silo_ip: &str) -> MetaSilo {
        MetaSilo {
            name: name.to_string(),
            id_hex: id.to_string(),
            tags: Vec::new(),
            grants: BTreeMap::new(),
            pid: 1,
            started: SystemTime::now(),
            interfaces: vec![Interface {
                kind: InterfaceKind::SiloVeth,
                name: format!("v0-{}s", id),
                address: Some(silo_ip.to_string()),
                stats: InterfaceStats::default(),
            }],
            bridge_ip: Some(bridge.parse().unwrap()),
            routeable_ip: Some(silo_ip.parse().unwrap()),
        }
    }

    fn state_with_silos() -> MetaState {
        let mut tables = Tables {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        };
        for s in [
            silo("web", "aaaaaaaa", "10.0.0.1", "10.0.0.2"),
            silo("db", "bbbbbbbb", "10.0.0.5", "10.0.0.6"),
        ] {
            tables.by_name.insert(s.name.clone(), s.id_hex.clone());
            tables.by_id.insert(s.id_hex.clone(), s);
        }
        let mut host_map = BTreeMap::new();
        host_map.insert("registry.internal".to_string(), "10.9.9.9".parse().unwrap());
        MetaState {
            tables: RwLock::new(tables),
            host_map: RwLock::new(host_map),
        }
    }

    fn a_query(name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg.to_vec().unwrap()
    }

    fn answered_a(state: &MetaState, src: &str, name: &str) -> Option<Ipv4Addr> {
        let bytes = answer(state, src.parse().unwrap(), &a_query(name))?;
        let msg = Message::from_vec(&bytes).unwrap();
        assert_eq!(msg.id(), 4242);
        assert!(!msg.recursion_available());
        msg.answers().first().and_then(|r| match r.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
    }

    #[test]
    fn test_silo_name_resolves_to_routeable_ip() {
        let state = state_with_silos();
        // web asks for db.
        let ip = answered_a(&state, "10.0.0.2", "db.silo.").unwrap();
        assert_eq!(ip, "10.0.0.6".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_self_resolves_to_caller() {
        let state = state_with_silos();
        let ip = answered_a(&state, "10.0.0.6", "self.").unwrap();
        assert_eq!(ip, "10.0.0.6".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_well_known_labels_resolve_to_bridge() {
        let state = state_with_silos();
        for label in ["host.", "metadata.", "bridge.", "colex."] {
            let ip = answered_a(&state, "10.0.0.2", label).unwrap();
            assert_eq!(ip, "10.0.0.1".parse::<Ipv4Addr>().unwrap(), "{}", label);
        }
    }

    #[test]
    fn test_static_host_map_resolves() {
        let state = state_with_silos();
        let ip = answered_a(&state, "10.0.0.2", "registry.internal.").unwrap();
        assert_eq!(ip, "10.9.9.9".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_unknown_name_gets_empty_answer() {
        let state = state_with_silos();
        let bytes = answer(
            &state,
            "10.0.0.2".parse().unwrap(),
            &a_query("unknown.example."),
        )
        .unwrap();
        let msg = Message::from_vec(&bytes).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::NoError);
        assert!(msg.answers().is_empty());
    }

    #[test]
    fn test_non_silo_caller_is_refused() {
        let state = state_with_silos();
        let bytes = answer(
            &state,
            "192.168.99.99".parse().unwrap(),
            &a_query("db.silo."),
        )
        .unwrap();
        let msg = Message::from_vec(&bytes).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::Refused);
        assert!(msg.answers().is_empty());
    }

    #[test]
    fn test_query_name_is_case_insensitive() {
        let state = state_with_silos();
        let ip = answered_a(&state, "10.0.0.2", "DB.SILO.").unwrap();
        assert_eq!(ip, "10.0.0.6".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_answers_have_zero_ttl() {
        let state = state_with_silos();
        let bytes = answer(&state, "10.0.0.2".parse().unwrap(), &a_query("db.silo.")).unwrap();
        let msg = Message::from_vec(&bytes).unwrap();
        assert_eq!(msg.answers()[0].ttl(), 0);
    }

    #[test]
    fn test_garbage_packet_is_dropped() {
        let state = state_with_silos();
        assert!(answer(&state, "10.0.0.2".parse().unwrap(), b"nonsense").is_none());
    }
}
