//! Tang `/rec` client.
//!
//! One POST per call; retries are orchestrated by the unseal loop. Outcomes
//! are classified as success (200), permanent (406/418, meaning the server
//! will never answer positively), or transient (everything else, including
//! transport errors).

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Probed in order at client construction; the first readable bundle wins.
const CA_BUNDLE_PATHS: [&str; 6] = [
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/ssl/cert.pem",
    "/usr/local/share/certs/ca-root-nss.crt",
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
];

/// A tang server connection specification
pub struct TangClient {
    agent: ureq::Agent,
    ca_bundle: PathBuf,
}

impl TangClient {
    /// Create a new client. Locates the system CA bundle up front; a host
    /// without one can never talk to an https tang server, so this is a
    /// permanent failure. If timeout is not specified, it defaults to 120s.
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let ca_bundle = locate_ca_bundle(&CA_BUNDLE_PATHS)?;
        Ok(Self::with_ca_bundle(ca_bundle, timeout))
    }

    /// Use an explicit CA bundle instead of probing the distribution paths.
    pub fn with_ca_bundle(ca_bundle: PathBuf, timeout: Option<Duration>) -> Self {
        let mut builder = ureq::AgentBuilder::new().timeout(timeout.unwrap_or(DEFAULT_TIMEOUT));
        match tls_config_from_bundle(&ca_bundle) {
            Ok(tls) => builder = builder.tls_config(Arc::new(tls)),
            Err(err) => {
                // Plain-http tang servers never touch the TLS stack; keep the
                // default roots for https and record why.
                log::debug!(
                    "CA bundle {} not loaded ({err}), https requests use default roots",
                    ca_bundle.display()
                );
            }
        }
        log::debug!("using CA bundle at {}", ca_bundle.display());
        Self {
            agent: builder.build(),
            ca_bundle,
        }
    }

    pub fn ca_bundle(&self) -> &Path {
        &self.ca_bundle
    }

    /// POST one exchanged public key to `{url}/rec/{kid}` and return the
    /// response body. Does not retry.
    pub fn recover(
        &self,
        url: &str,
        kid: &str,
        key_json: &str,
        query: &str,
        cancelled: &AtomicBool,
    ) -> Result<Vec<u8>> {
        if cancelled.load(Ordering::Relaxed) {
            return Err(Error::TransientTangFailure(
                "cancelled before transport".into(),
            ));
        }

        let complete_url = if query.is_empty() {
            format!("{url}/rec/{kid}")
        } else {
            format!("{url}/rec/{kid}?{query}")
        };
        log::debug!("requesting recovery key from '{complete_url}'");

        let outcome = self
            .agent
            .post(&complete_url)
            .set("Content-Type", "application/jwk+json")
            .send_string(key_json);

        match outcome {
            Ok(response) if response.status() == 200 => {
                let mut body = Vec::new();
                response
                    .into_reader()
                    .take(1 << 20)
                    .read_to_end(&mut body)
                    .map_err(|err| {
                        Error::TransientTangFailure(format!("reading response from {url} - {err}"))
                    })?;
                Ok(body)
            }
            Ok(response) => Err(Error::TransientTangFailure(format!(
                "{url} answered {}",
                response.status()
            ))),
            Err(ureq::Error::Status(code @ (406 | 418), response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(Error::PermanentTangFailure(format!(
                    "{url} answered {code} - {}",
                    body.trim()
                )))
            }
            Err(ureq::Error::Status(code, _)) => Err(Error::TransientTangFailure(format!(
                "{url} answered {code}"
            ))),
            Err(err) => Err(Error::TransientTangFailure(format!("{url} - {err}"))),
        }
    }
}

fn locate_ca_bundle(candidates: &[&str]) -> Result<PathBuf> {
    for candidate in candidates {
        let path = Path::new(candidate);
        if File::open(path).is_ok() {
            return Ok(path.to_path_buf());
        }
    }
    Err(Error::PermanentTangFailure(
        "no CA certificates found on this system".into(),
    ))
}

fn tls_config_from_bundle(path: &Path) -> Result<rustls::ClientConfig> {
    let file = File::open(path).map_err(|err| {
        Error::PermanentTangFailure(format!("CA bundle {} - {err}", path.display()))
    })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<_, _>>()
        .map_err(|err| {
            Error::PermanentTangFailure(format!("CA bundle {} - {err}", path.display()))
        })?;

    let mut roots = rustls::RootCertStore::empty();
    let (added, _skipped) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(Error::PermanentTangFailure(format!(
            "CA bundle {} holds no usable certificates",
            path.display()
        )));
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
