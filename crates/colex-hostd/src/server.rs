//! The host server: HTTPS RPC surface, silo registry, reaper.
//!
//! One coarse mutex guards the registry; handler cores are synchronous and
//! run under `spawn_blocking`, so lifecycle transitions (which make real
//! syscalls) never stall the async listeners. Replacing a silo by name
//! happens entirely inside one critical section — no observer ever sees
//! two silos with the same name.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use colex_core::wire::{
    self, DownPacket, DownSelector, ListResponse, SetHostRequest, SiloStat, SiloSummary, UpPacket,
    UpResponse,
};
use colex_controller::bases::{BaseProvider, BindMount};
use colex_controller::error::ControllerError;
use colex_controller::interfaces::{IpInterface, NetProvider};
use colex_controller::ippool::IpPool;
use colex_controller::silo::{Silo, SiloOptions, wait_child};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, Authenticator};
use crate::config::HostConfig;
use crate::metadata::http::query_param;
use crate::metadata::{METADATA_PORT, MetadataEvent, MetadataService, stats};
use crate::tls;

/// Brute-force brake on `/enroll`, taken while the registry lock is held.
const ENROLL_DELAY: Duration = Duration::from_millis(50);

/// The error taxonomy handlers surface to callers.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("{0}")]
    BadRequest(String),
    #[error("not authorized")]
    NotAuthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl HostError {
    pub fn status(&self) -> StatusCode {
        match self {
            HostError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HostError::NotAuthorized => StatusCode::FORBIDDEN,
            HostError::NotFound(_) => StatusCode::NOT_FOUND,
            HostError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AuthError> for HostError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::CertsFile(_) | AuthError::BadRecord(_) => HostError::Internal(e.to_string()),
            _ => HostError::NotAuthorized,
        }
    }
}

impl From<wire::WireError> for HostError {
    fn from(e: wire::WireError) -> Self {
        HostError::BadRequest(e.to_string())
    }
}

impl From<ControllerError> for HostError {
    fn from(e: ControllerError) -> Self {
        HostError::Internal(e.to_string())
    }
}

/// Published by a silo's wait task when its child exits.
#[derive(Debug)]
pub struct SiloFinished {
    pub name: String,
    pub id_hex: String,
    pub status: i32,
}

/// The running state of colexd.
pub struct Server {
    config: HostConfig,
    pool: Arc<IpPool>,
    registry: Mutex<HashMap<String, Silo>>,
    metadata: MetadataService,
    auth: Authenticator,
    finished_tx: mpsc::UnboundedSender<SiloFinished>,
    rt: tokio::runtime::Handle,
}

impl Server {
    /// Build the server state. The returned receiver feeds the reaper.
    pub fn new(
        config: HostConfig,
        rt: tokio::runtime::Handle,
    ) -> Result<(Arc<Server>, mpsc::UnboundedReceiver<SiloFinished>)> {
        let pool = IpPool::new(&config.address_pool)
            .map_err(|e| anyhow::anyhow!("address pool: {}", e))?;
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let metadata = MetadataService::new(rt.clone(), &config.hosts);
        let auth = Authenticator::new(&config.authentication);
        let server = Arc::new(Server {
            config,
            pool: Arc::new(pool),
            registry: Mutex::new(HashMap::new()),
            metadata,
            auth,
            finished_tx,
            rt,
        });
        Ok((server, finished_rx))
    }

    /// Run the daemon until ctrl-c: reaper, TLS accept loop, teardown.
    pub async fn serve(config: HostConfig) -> Result<()> {
        enable_ipv4_forwarding()?;

        let tls_config = tls::server_config(&config.tls)?;
        let acceptor = TlsAcceptor::from(tls_config);
        let listener = TcpListener::bind(&config.listener)
            .await
            .with_context(|| format!("bind {}", config.listener))?;

        let (server, finished_rx) = Server::new(config, tokio::runtime::Handle::current())?;
        tokio::spawn(reaper(Arc::clone(&server), finished_rx));
        info!(listen = %server.config.listener, host = %server.config.host_name, "colexd listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let accept_server = Arc::clone(&server);
        let accept_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&accept_server);
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(acceptor, server, stream, peer).await
                                {
                                    debug!(peer = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Accept error"),
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("listen for ctrl-c")?;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
        let _ = accept_loop.await;

        let closing = Arc::clone(&server);
        tokio::task::spawn_blocking(move || {
            closing.stop_all();
            closing.metadata.close();
        })
        .await
        .ok();
        info!("colexd stopped");
        Ok(())
    }

    // ========================================================================
    // RPC dispatch
    // ========================================================================

    /// Synchronous handler core; runs under `spawn_blocking`.
    pub fn dispatch(
        &self,
        method: &Method,
        path: &str,
        query: &str,
        body: &[u8],
        peer_cert: Option<&[u8]>,
    ) -> Result<Vec<u8>, HostError> {
        self.auth.check(path, peer_cert)?;

        match (method.as_str(), path) {
            ("POST", "/up") => self.handle_up(body),
            ("POST", "/down") => self.handle_down(body),
            ("POST", "/list") => self.handle_list(),
            ("POST", "/set-host") => self.handle_set_host(body),
            ("GET", "/enable-enroll") => self.handle_enable_enroll(),
            ("GET", "/enroll") => self.handle_enroll(query, peer_cert),
            _ => Err(HostError::NotFound("no such endpoint".to_string())),
        }
    }

    fn handle_up(&self, body: &[u8]) -> Result<Vec<u8>, HostError> {
        let pkt: UpPacket = wire::decode(body)?;
        let name = pkt.spec.name.clone();

        let mut registry = self.registry.lock().expect("registry lock");
        // Replace-by-name: the running silo goes down inside this same
        // critical section.
        if registry.contains_key(&name) {
            self.stop_silo_locked(&mut registry, &name)?;
        }
        let response = self.start_silo_locked(&mut registry, pkt)?;
        wire::encode(&response).map_err(|e| HostError::Internal(e.to_string()))
    }

    fn handle_down(&self, body: &[u8]) -> Result<Vec<u8>, HostError> {
        let pkt: DownPacket = wire::decode(body)?;
        let selector = pkt
            .selector()
            .map_err(|e| HostError::BadRequest(e.to_string()))?;

        let mut registry = self.registry.lock().expect("registry lock");
        let name = match selector {
            DownSelector::Name(name) => name,
            DownSelector::Id(id) => registry
                .values()
                .find(|s| s.id_hex == id)
                .map(|s| s.name.clone())
                .ok_or_else(|| HostError::BadRequest(format!("no silo with id {:?}", id)))?,
        };
        // Unknown names surface as 400 here, not 404.
        self.stop_silo_locked(&mut registry, &name)
            .map_err(|e| match e {
                HostError::NotFound(msg) => HostError::BadRequest(msg),
                other => other,
            })?;
        Ok(Vec::new())
    }

    fn handle_list(&self) -> Result<Vec<u8>, HostError> {
        let registry = self.registry.lock().expect("registry lock");
        let mut silos: Vec<SiloSummary> = registry
            .values()
            .map(|silo| SiloSummary {
                name: silo.name.clone(),
                class: silo.class.clone(),
                id_hex: silo.id_hex.clone(),
                tags: silo.tags.clone(),
                interfaces: silo.wire_interfaces(),
                stats: SiloStat {
                    mem: silo.pid().map(stats::silo_mem).unwrap_or_default(),
                },
            })
            .collect();
        silos.sort_by(|a, b| a.name.cmp(&b.name));

        let response = ListResponse {
            host_name: self.config.host_name.clone(),
            silos,
        };
        wire::encode(&response).map_err(|e| HostError::Internal(e.to_string()))
    }

    fn handle_set_host(&self, body: &[u8]) -> Result<Vec<u8>, HostError> {
        let pkt: SetHostRequest = wire::decode(body)?;
        let ip = pkt
            .ip
            .parse()
            .map_err(|_| HostError::BadRequest(format!("bad ip {:?}", pkt.ip)))?;
        self.metadata.set_host(pkt.host, ip);
        Ok(Vec::new())
    }

    fn handle_enable_enroll(&self) -> Result<Vec<u8>, HostError> {
        let window = Duration::from_secs(self.config.authentication.blind_enrollment_seconds);
        let response = self.auth.enable_enrollment(window);
        wire::encode(&response).map_err(|e| HostError::Internal(e.to_string()))
    }

    fn handle_enroll(&self, query: &str, peer_cert: Option<&[u8]>) -> Result<Vec<u8>, HostError> {
        let key = query_param(query, "key").unwrap_or_default();
        let name = query_param(query, "name").unwrap_or_default();

        // Held across the fixed delay: enrollment attempts serialize with
        // everything else, making online brute force infeasible.
        let _registry = self.registry.lock().expect("registry lock");
        std::thread::sleep(ENROLL_DELAY);
        self.auth.try_enroll(&key, &name, peer_cert)?;
        Ok(Vec::new())
    }

    // ========================================================================
    // Silo lifecycle (callers hold the registry lock)
    // ========================================================================

    fn start_silo_locked(
        &self,
        registry: &mut HashMap<String, Silo>,
        pkt: UpPacket,
    ) -> Result<UpResponse, HostError> {
        let spec = pkt.spec;

        let image_path = self
            .config
            .image_path(&spec.base)
            .ok_or_else(|| HostError::BadRequest(format!("unknown image {:?}", spec.base)))?
            .to_path_buf();

        let mut opts = SiloOptions {
            class: spec.class.clone(),
            tags: spec.tags.clone(),
            grants: spec.grants.clone(),
            resources: spec.resources,
            disable_user_namespace: self.config.disable_user_namespaces,
            cmd: spec.invocation.cmd.clone(),
            args: spec.invocation.args.clone(),
            env: spec.invocation.env.clone(),
            ..Default::default()
        };

        opts.add_fs(if spec.base == "img://busybox" {
            BaseProvider::Busybox {
                tar_path: image_path,
            }
        } else {
            BaseProvider::Tarball {
                tar_path: image_path,
            }
        });

        for file in spec.files.iter().chain(pkt.files.iter()) {
            opts.add_fs(match file.kind {
                colex_core::spec::FileKind::Raw => BaseProvider::FileRaw {
                    silo_path: file.silo_path.clone(),
                    data: file.data.clone(),
                },
                colex_core::spec::FileKind::Tarball => BaseProvider::FileTar {
                    silo_path: file.silo_path.clone(),
                    data: file.data.clone(),
                },
            });
        }

        for bind in &spec.binds {
            let allowed = self.config.bind_by_id(&bind.bind_id).ok_or_else(|| {
                HostError::BadRequest(format!("unknown bind id {:?}", bind.bind_id))
            })?;
            opts.add_fs(BaseProvider::Bind(BindMount {
                host_path: allowed.path.clone(),
                silo_path: bind.silo_path.clone(),
                is_file: allowed.is_file,
            }));
        }

        let slice = self.pool.allocate()?;
        let bridge_ip = slice.bridge;
        opts.interfaces.push(NetProvider::Ip(IpInterface::new(
            Arc::clone(&self.pool),
            slice,
            spec.network.internet_access,
        )));
        opts.interfaces.push(NetProvider::Loopback);

        opts.nameservers = spec.network.nameservers.clone();
        opts.host_map = spec.network.hosts.clone().into_iter().collect();
        opts.env
            .push(format!("METADATA_ENDPOINT={}:{}", bridge_ip, METADATA_PORT));
        opts.finalize(Some(bridge_ip));

        let mut silo = Silo::new(spec.name.clone(), opts);
        if let Err(e) = silo.init() {
            rollback_close(&mut silo);
            return Err(e.into());
        }
        if let Err(e) = silo.start() {
            rollback_close(&mut silo);
            return Err(e.into());
        }

        let id_hex = silo.id_hex.clone();
        let interfaces = silo.wire_interfaces();
        self.metadata.handle_event(MetadataEvent::Started {
            name: silo.name.clone(),
            id_hex: id_hex.clone(),
            tags: silo.tags.clone(),
            grants: silo.grants.clone(),
            pid: silo.pid().unwrap_or(0),
            interfaces: interfaces.clone(),
        });
        self.spawn_wait_task(silo.name.clone(), id_hex.clone(), silo.pid());

        info!(silo = %silo.name, id = %id_hex, bridge = %bridge_ip, "Silo started");
        registry.insert(silo.name.clone(), silo);
        Ok(UpResponse { id_hex, interfaces })
    }

    /// Stop one silo. Ordering is load-bearing: the metadata service must
    /// shut its listeners before `close` deletes the bridge IP they are
    /// bound to; only then does the registry forget the name.
    fn stop_silo_locked(
        &self,
        registry: &mut HashMap<String, Silo>,
        name: &str,
    ) -> Result<(), HostError> {
        let id_hex = registry
            .get(name)
            .map(|s| s.id_hex.clone())
            .ok_or_else(|| HostError::NotFound(format!("no silo {:?}", name)))?;

        self.metadata.handle_event(MetadataEvent::Stopped {
            name: name.to_string(),
            id_hex: id_hex.clone(),
        });

        let mut silo = registry.remove(name).expect("checked above");
        if let Err(e) = silo.close() {
            warn!(silo = %name, id = %id_hex, error = %e, "Silo close failed");
            return Err(HostError::Internal(e.to_string()));
        }
        info!(silo = %name, id = %id_hex, "Silo stopped");
        Ok(())
    }

    fn spawn_wait_task(&self, name: String, id_hex: String, pid: Option<i32>) {
        let Some(pid) = pid else { return };
        let tx = self.finished_tx.clone();
        self.rt.spawn_blocking(move || {
            let status = match wait_child(pid) {
                Ok(status) => status,
                Err(e) => {
                    warn!(silo = %name, error = %e, "wait failed");
                    -1
                }
            };
            let _ = tx.send(SiloFinished {
                name,
                id_hex,
                status,
            });
        });
    }

    /// The reaper's entry: verify the exited silo is still the registered
    /// one (an `/up` may have replaced it), then stop it.
    fn reap(&self, done: SiloFinished) {
        let mut registry = self.registry.lock().expect("registry lock");
        let still_current = registry
            .get(&done.name)
            .map(|s| s.id_hex == done.id_hex)
            .unwrap_or(false);
        if !still_current {
            debug!(silo = %done.name, id = %done.id_hex, "Exited silo already replaced");
            return;
        }
        info!(silo = %done.name, id = %done.id_hex, status = done.status, "Silo exited");
        if let Err(e) = self.stop_silo_locked(&mut registry, &done.name) {
            warn!(silo = %done.name, error = %e, "Reap failed");
        }
    }

    /// Stop every silo; used on daemon shutdown.
    pub fn stop_all(&self) {
        let mut registry = self.registry.lock().expect("registry lock");
        let names: Vec<String> = registry.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop_silo_locked(&mut registry, &name) {
                warn!(silo = %name, error = %e, "Stop on shutdown failed");
            }
        }
    }

    /// Registered silo names (tests and introspection).
    pub fn silo_names(&self) -> Vec<String> {
        self.registry
            .lock()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect()
    }
}

fn rollback_close(silo: &mut Silo) {
    // Reclaims the IP slice, cgroups, and root dir; never shadows the
    // original error.
    if let Err(close_err) = silo.close() {
        warn!(silo = %silo.id_hex, error = %close_err, "Rollback close failed");
    }
}

/// Reaper task: one per daemon, serializes end-of-life work.
pub(crate) async fn reaper(server: Arc<Server>, mut rx: mpsc::UnboundedReceiver<SiloFinished>) {
    while let Some(done) = rx.recv().await {
        let server = Arc::clone(&server);
        if let Err(e) = tokio::task::spawn_blocking(move || server.reap(done)).await {
            error!(error = %e, "Reaper task failed");
        }
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    server: Arc<Server>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let tls_stream = acceptor.accept(stream).await.context("TLS handshake")?;
    let peer_cert: Option<Vec<u8>> = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec());

    let service = service_fn(move |req| {
        let server = Arc::clone(&server);
        let peer_cert = peer_cert.clone();
        async move { Ok::<_, Infallible>(route(server, req, peer_cert).await) }
    });
    http1::Builder::new()
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
        .map_err(|e| anyhow::anyhow!("serve connection: {}", e))
}

async fn route(
    server: Arc<Server>,
    req: Request<hyper::body::Incoming>,
    peer_cert: Option<Vec<u8>>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return error_response(&HostError::BadRequest(format!("read body: {}", e))),
    };

    let result = tokio::task::spawn_blocking(move || {
        server.dispatch(&method, &path, &query, &body, peer_cert.as_deref())
    })
    .await;

    match result {
        Ok(Ok(bytes)) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/octet-stream")
            .body(Full::new(Bytes::from(bytes)))
            .expect("static response"),
        Ok(Err(e)) => error_response(&e),
        Err(join_err) => {
            error!(error = %join_err, "Handler task failed");
            error_response(&HostError::Internal("handler failed".to_string()))
        }
    }
}

fn error_response(err: &HostError) -> Response<Full<Bytes>> {
    Response::builder()
        .status(err.status())
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(err.to_string())))
        .expect("static response")
}

fn enable_ipv4_forwarding() -> Result<()> {
    const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
    let current = std::fs::read_to_string(IP_FORWARD).context("read ip_forward")?;
    if current.trim() != "1" {
        std::fs::write(IP_FORWARD, "1").context("enable ip_forward")?;
        info!("Enabled IPv4 forwarding");
    }
    Ok(())
}
