//! Resolution of repo credentials from Kubernetes secrets into libgit2
//! callbacks. Credentials are re-resolved on every flush so secret rotation
//! takes effect without restarting the worker.

use crate::error::{Error, Result};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use git2::cert::Cert;
use git2::{CertificateCheckStatus, Cred, RemoteCallbacks};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

#[derive(Clone, Debug, Default)]
pub enum GitCredentials {
    #[default]
    Anonymous,
    Token {
        username: String,
        token: String,
    },
    Ssh {
        username: String,
        private_key: String,
        known_hosts: Option<String>,
    },
}

impl GitCredentials {
    /// Read the referenced secret. Keys: `username`/`token` (or `password`)
    /// for HTTPS, `ssh-privatekey` plus optional `known_hosts` for SSH.
    pub async fn resolve(
        client: &Client,
        namespace: &str,
        secret_name: Option<&str>,
    ) -> Result<GitCredentials> {
        let Some(name) = secret_name else {
            return Ok(GitCredentials::Anonymous);
        };
        let secret = Api::<Secret>::namespaced(client.clone(), namespace)
            .get(name)
            .await
            .map_err(Error::KubeError)?;
        let data = secret.data.unwrap_or_default();
        let field =
            |key: &str| -> Option<String> { data.get(key).map(|v| String::from_utf8_lossy(&v.0).to_string()) };

        if let Some(private_key) = field("ssh-privatekey") {
            return Ok(GitCredentials::Ssh {
                username: field("username").unwrap_or_else(|| "git".to_string()),
                private_key,
                known_hosts: field("known_hosts"),
            });
        }
        match (field("username"), field("token").or_else(|| field("password"))) {
            (Some(username), Some(token)) => Ok(GitCredentials::Token { username, token }),
            _ => Err(Error::CredentialsError(format!(
                "secret {namespace}/{name} carries neither username/token nor ssh-privatekey"
            ))),
        }
    }

    /// Callbacks for fetch/push. Owned clones move into the closures so the
    /// result does not borrow `self`.
    pub fn callbacks(&self) -> RemoteCallbacks<'static> {
        let mut callbacks = RemoteCallbacks::new();
        match self {
            GitCredentials::Anonymous => {}
            GitCredentials::Token { username, token } => {
                let (username, token) = (username.clone(), token.clone());
                callbacks.credentials(move |_url, _username_from_url, _allowed| {
                    Cred::userpass_plaintext(&username, &token)
                });
            }
            GitCredentials::Ssh {
                username,
                private_key,
                known_hosts,
            } => {
                let (username, private_key) = (username.clone(), private_key.clone());
                callbacks.credentials(move |_url, username_from_url, _allowed| {
                    Cred::ssh_key_from_memory(
                        username_from_url.unwrap_or(&username),
                        None,
                        &private_key,
                        None,
                    )
                });
                if let Some(known_hosts) = known_hosts.clone() {
                    callbacks.certificate_check(move |cert, host| {
                        verify_host_key(&known_hosts, cert, host)
                    });
                }
            }
        }
        callbacks
    }
}

/// Accept the connection only when the presented host key appears in the
/// configured known_hosts blob. Non-SSH transports pass through.
fn verify_host_key(
    known_hosts: &str,
    cert: &Cert<'_>,
    host: &str,
) -> std::result::Result<CertificateCheckStatus, git2::Error> {
    let Some(hostkey) = cert.as_hostkey() else {
        return Ok(CertificateCheckStatus::CertificatePassthrough);
    };
    let Some(raw) = hostkey.hostkey() else {
        return Err(git2::Error::from_str("ssh host presented no key"));
    };
    let encoded = BASE64.encode(raw);
    let listed = known_hosts
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .any(|line| line.split_whitespace().any(|field| field == encoded));
    if listed {
        Ok(CertificateCheckStatus::CertificateOk)
    } else {
        Err(git2::Error::from_str(&format!(
            "host key for {host} not present in known_hosts"
        )))
    }
}
