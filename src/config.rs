/*
 * This file is part of kube-oidc-proxy.
 *
 * kube-oidc-proxy is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * kube-oidc-proxy is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with kube-oidc-proxy.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::collections::BTreeMap;
use std::time::Duration;

use crate::cli::Cli;
use crate::error::ProxyError;

/// Behavioural configuration for the proxy pipeline (spec.md §3's
/// `ProxyConfig`). Immutable after construction; held behind an `Arc` in
/// [`crate::pipeline::AppState`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    disable_impersonation: bool,
    token_review_enabled: bool,
    flush_interval: Duration,
    extra_user_headers: BTreeMap<String, Vec<String>>,
    client_ip_header_enabled: bool,
}

impl ProxyConfig {
    pub fn disable_impersonation(&self) -> bool {
        self.disable_impersonation
    }

    pub fn token_review_enabled(&self) -> bool {
        self.token_review_enabled
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn extra_user_headers(&self) -> &BTreeMap<String, Vec<String>> {
        &self.extra_user_headers
    }

    pub fn client_ip_header_enabled(&self) -> bool {
        self.client_ip_header_enabled
    }
}

/// Configuration for the OIDC authenticator (spec.md §4.2). `ca_file`
/// names a trust anchor distinct from the upstream API server's own CA
/// (see [`crate::transport::build_oidc_client`]), since the OIDC issuer is
/// typically a different service entirely.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    issuer_url: String,
    client_id: String,
    ca_file: Option<String>,
    username_claim: String,
    username_prefix: String,
    groups_claim: Option<String>,
    groups_prefix: String,
    required_claims: BTreeMap<String, String>,
    supported_signing_algs: Vec<String>,
}

impl OidcConfig {
    pub fn issuer_url(&self) -> &str {
        &self.issuer_url
    }

    pub fn ca_file(&self) -> Option<&str> {
        self.ca_file.as_deref()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn username_claim(&self) -> &str {
        &self.username_claim
    }

    pub fn username_prefix(&self) -> &str {
        &self.username_prefix
    }

    pub fn groups_claim(&self) -> Option<&str> {
        self.groups_claim.as_deref()
    }

    pub fn groups_prefix(&self) -> &str {
        &self.groups_prefix
    }

    pub fn required_claims(&self) -> &BTreeMap<String, String> {
        &self.required_claims
    }

    pub fn supported_signing_algs(&self) -> &[String] {
        &self.supported_signing_algs
    }
}

/// Upstream API server connection details, modelled after a Kubernetes
/// rest-config (spec.md §4.1): host, CA trust, and either a client
/// certificate/key pair or a static bearer token for the proxy's own
/// privileged identity.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    host: String,
    ca_file: Option<String>,
    client_cert_file: Option<String>,
    client_key_file: Option<String>,
    token: Option<String>,
}

impl UpstreamConfig {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ca_file(&self) -> Option<&str> {
        self.ca_file.as_deref()
    }

    pub fn client_cert_file(&self) -> Option<&str> {
        self.client_cert_file.as_deref()
    }

    pub fn client_key_file(&self) -> Option<&str> {
        self.client_key_file.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    secure_port: u16,
    tls_cert_file: Option<String>,
    tls_private_key_file: Option<String>,
}

impl ListenerConfig {
    pub fn secure_port(&self) -> u16 {
        self.secure_port
    }

    pub fn tls_cert_file(&self) -> Option<&str> {
        self.tls_cert_file.as_deref()
    }

    pub fn tls_private_key_file(&self) -> Option<&str> {
        self.tls_private_key_file.as_deref()
    }
}

/// All startup configuration resolved from the CLI surface in spec.md §6,
/// bundled for convenient distribution across the components that need a
/// slice of it.
#[derive(Debug, Clone)]
pub struct AppConfig {
    proxy: ProxyConfig,
    oidc: Option<OidcConfig>,
    upstream: UpstreamConfig,
    listener: ListenerConfig,
}

impl AppConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ProxyError> {
        if !cli.token_passthrough && cli.oidc_issuer_url.is_none() {
            return Err(ProxyError::Config(
                "either --oidc-issuer-url or --token-passthrough must be set".to_string(),
            ));
        }

        let oidc = cli
            .oidc_issuer_url
            .as_ref()
            .map(|issuer_url| -> Result<OidcConfig, ProxyError> {
                let client_id = cli.oidc_client_id.clone().ok_or_else(|| {
                    ProxyError::Config("--oidc-client-id is required with --oidc-issuer-url".to_string())
                })?;
                Ok(OidcConfig {
                    issuer_url: issuer_url.clone(),
                    client_id,
                    ca_file: cli.oidc_ca_file.clone(),
                    username_claim: cli.oidc_username_claim.clone(),
                    username_prefix: cli.oidc_username_prefix.clone(),
                    groups_claim: cli.oidc_groups_claim.clone(),
                    groups_prefix: cli.oidc_groups_prefix.clone(),
                    required_claims: cli.oidc_required_claims.iter().cloned().collect(),
                    supported_signing_algs: if cli.oidc_signing_algs.is_empty() {
                        vec!["RS256".to_string()]
                    } else {
                        cli.oidc_signing_algs.clone()
                    },
                })
            })
            .transpose()?;

        Ok(Self {
            proxy: ProxyConfig {
                disable_impersonation: cli.disable_impersonation,
                token_review_enabled: cli.token_passthrough,
                flush_interval: cli.flush_interval,
                extra_user_headers: {
                    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
                    for (k, v) in &cli.extra_user_headers {
                        map.entry(k.clone()).or_default().push(v.clone());
                    }
                    map
                },
                client_ip_header_enabled: cli.extra_user_header_client_ip,
            },
            oidc,
            upstream: UpstreamConfig {
                host: cli.upstream_host,
                ca_file: cli.upstream_ca_file,
                client_cert_file: cli.upstream_client_cert_file,
                client_key_file: cli.upstream_client_key_file,
                token: cli.upstream_token,
            },
            listener: ListenerConfig {
                secure_port: cli.secure_port,
                tls_cert_file: cli.tls_cert_file,
                tls_private_key_file: cli.tls_private_key_file,
            },
        })
    }

    pub fn proxy(&self) -> &ProxyConfig {
        &self.proxy
    }

    pub fn oidc(&self) -> Option<&OidcConfig> {
        self.oidc.as_ref()
    }

    pub fn upstream(&self) -> &UpstreamConfig {
        &self.upstream
    }

    pub fn listener(&self) -> &ListenerConfig {
        &self.listener
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            oidc_issuer_url: Some("https://issuer.example.com".to_string()),
            oidc_client_id: Some("kubernetes".to_string()),
            oidc_ca_file: None,
            oidc_username_claim: "sub".to_string(),
            oidc_username_prefix: String::new(),
            oidc_groups_claim: Some("groups".to_string()),
            oidc_groups_prefix: String::new(),
            oidc_required_claims: vec![],
            oidc_signing_algs: vec![],
            disable_impersonation: false,
            token_passthrough: false,
            flush_interval: Duration::from_millis(5),
            extra_user_headers: vec![],
            extra_user_header_client_ip: false,
            secure_port: 6443,
            tls_cert_file: None,
            tls_private_key_file: None,
            upstream_host: "https://10.0.0.1:6443".to_string(),
            upstream_ca_file: None,
            upstream_client_cert_file: None,
            upstream_client_key_file: None,
            upstream_token: None,
        }
    }

    #[test]
    fn requires_oidc_or_token_passthrough() {
        let mut cli = base_cli();
        cli.oidc_issuer_url = None;
        cli.token_passthrough = false;
        assert!(AppConfig::from_cli(cli).is_err());
    }

    #[test]
    fn token_passthrough_alone_is_valid() {
        let mut cli = base_cli();
        cli.oidc_issuer_url = None;
        cli.oidc_client_id = None;
        cli.token_passthrough = true;
        let config = AppConfig::from_cli(cli).unwrap();
        assert!(config.oidc().is_none());
        assert!(config.proxy().token_review_enabled());
    }

    #[test]
    fn client_id_required_alongside_issuer() {
        let mut cli = base_cli();
        cli.oidc_client_id = None;
        assert!(AppConfig::from_cli(cli).is_err());
    }
}
