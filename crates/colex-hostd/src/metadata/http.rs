//! The metadata HTTP surface, served per silo on `{bridge_ip}:17832`.
//!
//! Callers are identified by source IP; a source that is not a known
//! silo-veth address gets 403 for everything. Cross-silo queries
//! additionally require the `query_silos` grant.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use colex_core::wire::SiloStat;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use super::stats;
use super::{GRANT_QUERY_SILOS, METADATA_PORT, MetaState, refresh_interface_stats};

/// Accept loop for one silo's metadata HTTP listener. Runs until the
/// shutdown watch flips, then acknowledges over `done`.
pub(crate) async fn listener(
    state: Arc<MetaState>,
    bridge_ip: Ipv4Addr,
    mut shutdown: watch::Receiver<bool>,
    done: oneshot::Sender<()>,
) {
    let addr = SocketAddr::from((bridge_ip, METADATA_PORT));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(listen = %addr, error = %e, "Metadata HTTP bind failed");
            let _ = done.send(());
            return;
        }
    };

    loop {
        tokio::select! {
            result = listener.accept() => {
                let Ok((stream, peer)) = result else { continue };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        handle(Arc::clone(&state), peer.ip(), req)
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(peer = %peer, error = %e, "Metadata connection error");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    let _ = done.send(());
}

async fn handle(
    state: Arc<MetaState>,
    caller_ip: IpAddr,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(&state, caller_ip, req))
}

fn route(
    state: &MetaState,
    caller_ip: IpAddr,
    req: Request<hyper::body::Incoming>,
) -> Response<Full<Bytes>> {
    let Some(caller_id) = state.silo_id_for_ip(caller_ip) else {
        return plain(StatusCode::FORBIDDEN, "Unauthorized");
    };
    if req.method() != Method::GET {
        return plain(StatusCode::NOT_FOUND, "Not found");
    }

    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    match path.as_str() {
        "/self" => {
            let tables = state.tables.read().expect("metadata tables lock");
            match tables.by_id.get(&caller_id) {
                Some(silo) => json(&silo.info()),
                None => plain(StatusCode::FORBIDDEN, "Unauthorized"),
            }
        }
        "/stats" => {
            let pid = {
                let tables = state.tables.read().expect("metadata tables lock");
                tables.by_id.get(&caller_id).map(|s| s.pid)
            };
            match pid {
                Some(pid) => json(&SiloStat {
                    mem: stats::silo_mem(pid),
                }),
                None => plain(StatusCode::FORBIDDEN, "Unauthorized"),
            }
        }
        "/list" => list(state, &query),
        _ => silo_detail(state, &caller_id, &path),
    }
}

fn list(state: &MetaState, query: &str) -> Response<Full<Bytes>> {
    let with = query_param(query, "with").unwrap_or_default();
    let tables = state.tables.read().expect("metadata tables lock");

    let mut out: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for (name, id) in &tables.by_name {
        let Some(silo) = tables.by_id.get(id) else {
            continue;
        };
        let value = match with.as_str() {
            "run-seconds" => serde_json::json!(silo.run_seconds()),
            "tags" => serde_json::json!(silo.tags),
            "bridge-address" => serde_json::json!(silo.bridge_ip.map(|ip| ip.to_string())),
            "routeable-address" => serde_json::json!(silo.routeable_ip.map(|ip| ip.to_string())),
            _ => serde_json::json!(silo.id_hex),
        };
        out.insert(name.clone(), value);
    }
    json(&out)
}

/// `GET /silo/{id}/{meta|netstats}` — details about another silo, gated
/// by the caller's `query_silos` grant.
fn silo_detail(state: &MetaState, caller_id: &str, path: &str) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let ["silo", target_id, detail] = segments.as_slice() else {
        return plain(StatusCode::NOT_FOUND, "Not found");
    };

    let tables = state.tables.read().expect("metadata tables lock");
    let Some(caller) = tables.by_id.get(caller_id) else {
        return plain(StatusCode::FORBIDDEN, "Unauthorized");
    };
    if !caller.has_grant(GRANT_QUERY_SILOS) {
        return plain(StatusCode::FORBIDDEN, "Missing grant");
    }
    let Some(target) = tables.by_id.get(*target_id) else {
        return plain(StatusCode::NOT_FOUND, "No such silo");
    };

    match *detail {
        "meta" => json(&target.info()),
        "netstats" => json(&refresh_interface_stats(&target.interfaces)),
        _ => plain(StatusCode::NOT_FOUND, "Not found"),
    }
}

fn json<T: serde::Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .expect("static response"),
        Err(e) => plain(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("encode error: {}", e),
        ),
    }
}

fn plain(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response")
}

/// Query-string lookup with form-urlencoding decoding, so free-form
/// values (enrollment names in particular) round-trip from clients that
/// encode them properly.
pub(crate) fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (form_decode(k) == key).then(|| form_decode(v))
    })
}

fn form_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                // Malformed escapes pass through verbatim.
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param("with=tags&x=1", "with").as_deref(),
            Some("tags")
        );
        assert_eq!(query_param("with=tags", "x"), None);
        assert_eq!(query_param("", "with"), None);
    }

    #[test]
    fn test_query_param_takes_first_match() {
        assert_eq!(
            query_param("with=a&with=b", "with").as_deref(),
            Some("a")
        );
    }

    #[test]
    fn test_query_param_decodes_form_encoding() {
        // "ops&admin=true" as a single value, the way a urlencoding
        // client sends it.
        assert_eq!(
            query_param("name=ops%26admin%3Dtrue&key=abc", "name").as_deref(),
            Some("ops&admin=true")
        );
        assert_eq!(
            query_param("name=ops+crew", "name").as_deref(),
            Some("ops crew")
        );
        assert_eq!(
            query_param("name=caf%C3%A9", "name").as_deref(),
            Some("café")
        );
    }

    #[test]
    fn test_query_param_malformed_escape_passes_through() {
        assert_eq!(query_param("name=50%", "name").as_deref(), Some("50%"));
        assert_eq!(
            query_param("name=50%zz", "name").as_deref(),
            Some("50%zz")
        );
    }
}
