#![forbid(unsafe_code)]

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use populator_contracts::config::{KeyServiceEndpoint, KeySource, MutualTls};
use populator_contracts::key::KeyMaterial;
use serde::Deserialize;
use uuid::Uuid;

pub const DATA_KEY_PATH: &str = "/datakey";
pub const USER_AGENT: &str = "hbase-populate/0.1";

pub const FIXED_PLAINTEXT_KEY: &str = "czMQLgW/OrzBZwFV9u4EBA==";
pub const FIXED_WRAPPED_KEY: &str = "blahblah";
pub const FIXED_KEY_ENCRYPTION_KEY_ID: &str = "1234567890";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyServiceError {
    #[error("data key service unreachable ({kind}) correlation_id={correlation_id}: {detail}")]
    Transport {
        kind: &'static str,
        correlation_id: String,
        detail: String,
    },
    #[error("data key service returned status {status} correlation_id={correlation_id}")]
    Status { status: u16, correlation_id: String },
    #[error("data key service response malformed: {0}")]
    MalformedResponse(String),
    #[error("key service tls setup failed: {0}")]
    Tls(String),
}

pub trait KeyProvider {
    fn fetch(&self) -> Result<KeyMaterial, KeyServiceError>;

    fn describe(&self) -> String;
}

/// Local-profile key triple. Never chosen unless configuration says so.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedKeyProvider;

impl KeyProvider for FixedKeyProvider {
    fn fetch(&self) -> Result<KeyMaterial, KeyServiceError> {
        KeyMaterial::v1(
            FIXED_PLAINTEXT_KEY,
            FIXED_WRAPPED_KEY.to_string(),
            FIXED_KEY_ENCRYPTION_KEY_ID.to_string(),
        )
        .map_err(|e| KeyServiceError::MalformedResponse(e.to_string()))
    }

    fn describe(&self) -> String {
        "fixed local key".to_string()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataKeyResponse {
    plaintext_data_key: Option<String>,
    ciphertext_data_key: Option<String>,
    data_key_encryption_key_id: Option<String>,
}

pub struct HttpKeyProvider {
    url: String,
    agent: ureq::Agent,
}

impl HttpKeyProvider {
    pub fn new(endpoint: &KeyServiceEndpoint) -> Result<Self, KeyServiceError> {
        let timeout = Duration::from_millis(endpoint.timeout_ms.max(100));
        let mut builder = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(USER_AGENT)
            .try_proxy_from_env(false);
        if let Some(tls) = endpoint.tls.as_ref() {
            builder = builder.tls_config(Arc::new(client_tls_config(tls)?));
        }
        Ok(Self {
            url: data_key_url(&endpoint.url),
            agent: builder.build(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl KeyProvider for HttpKeyProvider {
    fn fetch(&self) -> Result<KeyMaterial, KeyServiceError> {
        let correlation_id = Uuid::new_v4().to_string();
        tracing::info!(
            dks_url = %self.url,
            dks_correlation_id = %correlation_id,
            "requesting data key"
        );
        let response = self
            .agent
            .get(&self.url)
            .query("correlationId", &correlation_id)
            .set("Accept", "application/json")
            .call();
        let response = match response {
            Ok(resp) => resp,
            Err(ureq::Error::Status(status, _)) => {
                tracing::warn!(
                    dks_url = %self.url,
                    dks_correlation_id = %correlation_id,
                    status_code = status,
                    "data key service returned bad status code"
                );
                return Err(KeyServiceError::Status {
                    status,
                    correlation_id,
                });
            }
            Err(ureq::Error::Transport(transport)) => {
                let detail = transport.to_string();
                return Err(KeyServiceError::Transport {
                    kind: classify_transport_error_kind(&format!(
                        "{:?} {}",
                        transport.kind(),
                        detail
                    )),
                    correlation_id,
                    detail,
                });
            }
        };
        if !(200..=299).contains(&response.status()) {
            return Err(KeyServiceError::Status {
                status: response.status(),
                correlation_id,
            });
        }
        let body: DataKeyResponse = response
            .into_json()
            .map_err(|e| KeyServiceError::MalformedResponse(format!("json parse: {e}")))?;
        key_material_from_response(body)
    }

    fn describe(&self) -> String {
        format!("data key service at {}", self.url)
    }
}

pub fn key_provider_for(source: &KeySource) -> Result<Box<dyn KeyProvider>, KeyServiceError> {
    match source {
        KeySource::Service(endpoint) => Ok(Box::new(HttpKeyProvider::new(endpoint)?)),
        KeySource::Fixed => Ok(Box::new(FixedKeyProvider)),
    }
}

/// Appends `/datakey` unless the endpoint already names it.
pub fn data_key_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.ends_with(DATA_KEY_PATH) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{DATA_KEY_PATH}")
    }
}

fn key_material_from_response(body: DataKeyResponse) -> Result<KeyMaterial, KeyServiceError> {
    let plaintext = required_field(body.plaintext_data_key, "plaintextDataKey")?;
    let wrapped = required_field(body.ciphertext_data_key, "ciphertextDataKey")?;
    let kek_id = required_field(body.data_key_encryption_key_id, "dataKeyEncryptionKeyId")?;
    KeyMaterial::v1(&plaintext, wrapped, kek_id)
        .map_err(|e| KeyServiceError::MalformedResponse(e.to_string()))
}

fn required_field(value: Option<String>, name: &str) -> Result<String, KeyServiceError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(KeyServiceError::MalformedResponse(format!(
            "missing field {name}"
        ))),
    }
}

fn client_tls_config(tls: &MutualTls) -> Result<rustls::ClientConfig, KeyServiceError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in read_certs(&tls.ca_bundle_pem)? {
        roots
            .add(cert)
            .map_err(|e| KeyServiceError::Tls(format!("ca bundle: {e}")))?;
    }
    let chain = read_certs(&tls.client_cert_pem)?;
    let mut key_reader = BufReader::new(open_pem(&tls.client_key_pem)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| KeyServiceError::Tls(format!("client key: {e}")))?
        .ok_or_else(|| KeyServiceError::Tls("client key: no private key found".to_string()))?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| KeyServiceError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| KeyServiceError::Tls(format!("client certificate: {e}")))
}

fn read_certs(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, KeyServiceError> {
    let mut reader = BufReader::new(open_pem(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KeyServiceError::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(KeyServiceError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn open_pem(path: &Path) -> Result<File, KeyServiceError> {
    File::open(path).map_err(|e| KeyServiceError::Tls(format!("{}: {e}", path.display())))
}

fn classify_transport_error_kind(raw: &str) -> &'static str {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("tls") || lower.contains("ssl") || lower.contains("certificate") {
        "tls"
    } else if lower.contains("dns") {
        "dns"
    } else if lower.contains("connection") || lower.contains("connect") {
        "connection"
    } else {
        "transport"
    }
}
