//! The RPC client: HTTPS with a TOFU-pinned server certificate and the
//! client identity presented for SPKI authorization.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use colex_core::wire::{
    self, DownPacket, EnableEnrollResponse, ListRequest, ListResponse, SetHostRequest, UpPacket,
    UpResponse,
};
use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};

use crate::certpin::{self, ClientIdentity};

/// Pins the server certificate on first contact; any later change is a
/// hard failure the user must resolve by removing the pin file.
#[derive(Debug)]
struct TofuVerifier {
    base: PathBuf,
    addr: String,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let pinned = certpin::pinned_cert(&self.base, &self.addr)
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        match pinned {
            None => {
                certpin::pin_certificate(&self.base, &self.addr, end_entity.as_ref())
                    .map_err(|e| rustls::Error::General(e.to_string()))?;
                Ok(ServerCertVerified::assertion())
            }
            Some(der) if der == end_entity.as_ref() => Ok(ServerCertVerified::assertion()),
            Some(_) => Err(rustls::Error::General(format!(
                "server certificate for {} changed since it was pinned",
                self.addr
            ))),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A connection to one colexd.
pub struct Client {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl Client {
    /// Build a client for `addr` (`host:port`), creating the client
    /// identity on first use.
    pub fn connect(addr: &str) -> Result<Client> {
        let base = certpin::colex_dir()?;
        let identity = certpin::load_or_create_identity(&base)?;
        Client::connect_with(addr, base, identity)
    }

    fn connect_with(addr: &str, base: PathBuf, identity: ClientIdentity) -> Result<Client> {
        let verifier = TofuVerifier {
            base,
            addr: addr.to_string(),
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        };

        let _ = CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

        let cert = CertificateDer::from(identity.cert_der);
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key_der));
        let tls = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(vec![cert], key)
            .context("assemble client TLS config")?;

        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("colex/", env!("CARGO_PKG_VERSION")))
            .use_preconfigured_tls(tls)
            .timeout(Duration::from_secs(60))
            .build()
            .context("build HTTP client")?;

        Ok(Client {
            http,
            base_url: format!("https://{}", addr),
        })
    }

    pub fn up(&self, pkt: &UpPacket) -> Result<UpResponse> {
        let body = self.post("/up", wire::encode(pkt)?)?;
        Ok(wire::decode(&body)?)
    }

    pub fn down(&self, pkt: &DownPacket) -> Result<()> {
        self.post("/down", wire::encode(pkt)?)?;
        Ok(())
    }

    pub fn list(&self) -> Result<ListResponse> {
        let body = self.post("/list", wire::encode(&ListRequest {})?)?;
        Ok(wire::decode(&body)?)
    }

    pub fn set_host(&self, host: &str, ip: &str) -> Result<()> {
        let pkt = SetHostRequest {
            host: host.to_string(),
            ip: ip.to_string(),
        };
        self.post("/set-host", wire::encode(&pkt)?)?;
        Ok(())
    }

    pub fn enable_enroll(&self) -> Result<EnableEnrollResponse> {
        let body = self.get("/enable-enroll")?;
        Ok(wire::decode(&body)?)
    }

    pub fn enroll(&self, key: &str, name: &str) -> Result<()> {
        // The name is free-form; let reqwest's query serializer encode it
        // rather than interpolating into the URL by hand.
        let url = format!("{}/enroll", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("key", key), ("name", name)])
            .send()
            .with_context(|| format!("GET {}", url))?;
        read_response(resp, &url)?;
        Ok(())
    }

    fn post(&self, path: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .body(body)
            .send()
            .with_context(|| format!("POST {}", url))?;
        read_response(resp, &url)
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .with_context(|| format!("GET {}", url))?;
        read_response(resp, &url)
    }
}

fn read_response(resp: reqwest::blocking::Response, url: &str) -> Result<Vec<u8>> {
    let status = resp.status();
    let body = resp.bytes().with_context(|| format!("read body of {}", url))?;
    if !status.is_success() {
        bail!(
            "{} returned {}: {}",
            url,
            status,
            String::from_utf8_lossy(&body).trim()
        );
    }
    Ok(body.to_vec())
}
