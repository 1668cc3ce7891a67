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

use std::fs;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Certificate, Client, Identity};

use crate::config::{OidcConfig, UpstreamConfig};
use crate::error::ProxyError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The two round-trippers the proxy ever sends a request through:
/// `privileged` carries the proxy's own client certificate or service
/// account token and is used whenever impersonation headers are installed;
/// `anonymous` shares only the upstream's trust anchors and is used for
/// `--disable-impersonation`/`--token-passthrough` passthrough and for the
/// `TokenReview` call itself (spec.md §4.1, §4.3).
#[derive(Clone)]
pub struct UpstreamTransports {
    pub privileged: Client,
    pub anonymous: Client,
    pub host: String,
}

fn load_root_ca(builder: reqwest::ClientBuilder, ca_file: Option<&str>) -> Result<reqwest::ClientBuilder, ProxyError> {
    let Some(path) = ca_file else {
        return Ok(builder);
    };
    let pem = fs::read(path)
        .map_err(|e| ProxyError::Config(format!("reading CA bundle {path}: {e}")))?;
    let cert = Certificate::from_pem(&pem)
        .map_err(|e| ProxyError::Config(format!("parsing CA bundle {path}: {e}")))?;
    Ok(builder.add_root_certificate(cert))
}

/// Builds both round-trippers from the upstream rest-config. TLS
/// construction failure is fatal at startup — it is never retried
/// per-request (spec.md §4.1).
pub fn build(config: &UpstreamConfig) -> Result<UpstreamTransports, ProxyError> {
    let mut anonymous_builder = Client::builder().timeout(DEFAULT_TIMEOUT);
    anonymous_builder = load_root_ca(anonymous_builder, config.ca_file())?;
    let anonymous = anonymous_builder
        .build()
        .map_err(|e| ProxyError::Config(format!("building anonymous transport: {e}")))?;

    let mut privileged_builder = Client::builder().timeout(DEFAULT_TIMEOUT);
    privileged_builder = load_root_ca(privileged_builder, config.ca_file())?;

    privileged_builder = match (config.client_cert_file(), config.client_key_file()) {
        (Some(cert_path), Some(key_path)) => {
            let mut pem = fs::read(cert_path)
                .map_err(|e| ProxyError::Config(format!("reading client cert {cert_path}: {e}")))?;
            let mut key_pem = fs::read(key_path)
                .map_err(|e| ProxyError::Config(format!("reading client key {key_path}: {e}")))?;
            pem.append(&mut key_pem);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| ProxyError::Config(format!("building client identity: {e}")))?;
            privileged_builder.identity(identity)
        }
        (None, None) => privileged_builder,
        _ => {
            return Err(ProxyError::Config(
                "client cert and key must both be set or both be omitted".to_string(),
            ))
        }
    };

    if let Some(token) = config.token() {
        let mut headers = HeaderMap::new();
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ProxyError::Config(format!("upstream token is not a valid header value: {e}")))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
        privileged_builder = privileged_builder.default_headers(headers);
    }

    let privileged = privileged_builder
        .build()
        .map_err(|e| ProxyError::Config(format!("building privileged transport: {e}")))?;

    Ok(UpstreamTransports {
        privileged,
        anonymous,
        host: config.host().to_string(),
    })
}

/// Builds the client the OIDC authenticator uses to fetch JWKS. Kept
/// separate from [`build`]'s upstream transports because the OIDC
/// issuer's trust anchor is generally a different CA than the upstream
/// API server's (spec.md §4.2).
pub fn build_oidc_client(config: &OidcConfig) -> Result<Client, ProxyError> {
    let builder = load_root_ca(Client::builder().timeout(DEFAULT_TIMEOUT), config.ca_file())?;
    builder
        .build()
        .map_err(|e| ProxyError::Config(format!("building OIDC issuer transport: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_without_tls_material() {
        // No CA/cert/key configured: both transports should still build,
        // trusting the platform's default root store.
        let config = crate::config::AppConfig::from_cli(crate::cli::Cli {
            oidc_issuer_url: None,
            oidc_client_id: None,
            oidc_ca_file: None,
            oidc_username_claim: "sub".to_string(),
            oidc_username_prefix: String::new(),
            oidc_groups_claim: None,
            oidc_groups_prefix: String::new(),
            oidc_required_claims: vec![],
            oidc_signing_algs: vec![],
            disable_impersonation: false,
            token_passthrough: true,
            flush_interval: Duration::from_millis(5),
            extra_user_headers: vec![],
            extra_user_header_client_ip: false,
            secure_port: 6443,
            tls_cert_file: None,
            tls_private_key_file: None,
            upstream_host: "https://upstream.example.com".to_string(),
            upstream_ca_file: None,
            upstream_client_cert_file: None,
            upstream_client_key_file: None,
            upstream_token: None,
        })
        .unwrap();
        assert!(build(config.upstream()).is_ok());
    }
}
