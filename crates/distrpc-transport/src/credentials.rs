//! Resolves TLS key material and a bearer token for an outbound or inbound call.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration a [`CredentialProvider`] resolves against.
///
/// This is a pure lookup layer: it never prompts, never generates key
/// material, and never fails the process. Anything wrong here is resolved
/// by downgrading to [`Credentials::Insecure`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Subject name the peer's certificate must present; encryption is
    /// enabled if and only if this is set.
    pub certificate_subject_name: Option<String>,
    /// Path to the PEM-encoded root certificate trusted for the peer.
    pub root_cert_path: Option<PathBuf>,
    /// Path to this endpoint's own PEM-encoded certificate (for mTLS).
    pub cert_path: Option<PathBuf>,
    /// Path to this endpoint's own PEM-encoded private key (for mTLS).
    pub key_path: Option<PathBuf>,
    /// Path to a file holding the bearer token used to authenticate calls.
    pub token_path: Option<PathBuf>,
}

/// The resolved credential material for a peer.
#[derive(Clone)]
pub enum Credentials {
    /// No encryption, no authentication.
    Insecure,
    /// TLS (with optional mTLS) is in effect.
    Tls(TlsCredentials),
}

/// Key material and, optionally, a bearer token for an encrypted channel.
#[derive(Clone)]
pub struct TlsCredentials {
    /// PEM-encoded root certificate used to verify the peer.
    pub root_pem: Vec<u8>,
    /// PEM-encoded certificate this endpoint presents.
    pub cert_pem: Vec<u8>,
    /// PEM-encoded private key for `cert_pem`.
    pub key_pem: Vec<u8>,
    /// The subject name the peer's certificate is expected to present.
    pub server_name_override: String,
    /// Bearer token to attach to outbound calls, if authentication is enabled.
    pub call_token: Option<String>,
}

impl std::fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCredentials")
            .field("server_name_override", &self.server_name_override)
            .field("call_token", &self.call_token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// True if encryption is in effect.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Credentials::Tls(_))
    }

    /// True if a bearer token will be attached to outbound calls.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Credentials::Tls(TlsCredentials { call_token: Some(_), .. }))
    }
}

/// Resolves [`Credentials`] for a peer from a [`CredentialConfig`].
#[derive(Debug, Clone)]
pub struct CredentialProvider {
    config: CredentialConfig,
}

impl CredentialProvider {
    /// Construct a provider over the given configuration.
    pub fn new(config: CredentialConfig) -> Self {
        CredentialProvider { config }
    }

    /// Resolve credentials, reading key material and the token file from disk.
    ///
    /// Encryption is enabled iff `certificate_subject_name` is set.
    /// Authentication is enabled iff encryption is enabled AND the token
    /// file resolves to a non-empty token. A missing certificate or an
    /// unreadable token file downgrades to [`Credentials::Insecure`] with a
    /// warning; neither is ever fatal at this layer.
    pub async fn resolve(&self) -> Credentials {
        let Some(server_name_override) = self.config.certificate_subject_name.clone() else {
            return Credentials::Insecure;
        };

        let (root_pem, cert_pem, key_pem) = match self.read_key_material().await {
            Ok(material) => material,
            Err(e) => {
                warn!(error = %e, "failed to read TLS key material; falling back to an insecure channel");
                return Credentials::Insecure;
            }
        };

        let call_token = self.read_token().await;

        Credentials::Tls(TlsCredentials {
            root_pem,
            cert_pem,
            key_pem,
            server_name_override,
            call_token,
        })
    }

    async fn read_key_material(&self) -> std::io::Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let missing = || std::io::Error::new(std::io::ErrorKind::NotFound, "certificate path not configured");
        let root_path = self.config.root_cert_path.as_ref().ok_or_else(missing)?;
        let cert_path = self.config.cert_path.as_ref().ok_or_else(missing)?;
        let key_path = self.config.key_path.as_ref().ok_or_else(missing)?;

        let root_pem = tokio::fs::read(root_path).await?;
        let cert_pem = tokio::fs::read(cert_path).await?;
        let key_pem = tokio::fs::read(key_path).await?;
        Ok((root_pem, cert_pem, key_pem))
    }

    /// Read the token file, if configured. A missing file, unreadable file,
    /// or empty contents are all treated as "no token" rather than an error:
    /// the caller just ends up with authentication disabled.
    async fn read_token(&self) -> Option<String> {
        let path = self.config.token_path.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let token = contents.trim().to_string();
                if token.is_empty() {
                    None
                } else {
                    Some(token)
                }
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to read token file; authentication disabled");
                None
            }
        }
    }
}
