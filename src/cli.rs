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

use std::time::Duration;

use clap::Parser;

/// Reverse proxy that turns end-user OIDC bearer tokens into Kubernetes
/// user-impersonation headers for a single upstream API server.
#[derive(Debug, Parser)]
#[command(name = "kube-oidc-proxy", version, about)]
pub struct Cli {
    #[arg(long)]
    pub oidc_issuer_url: Option<String>,
    #[arg(long)]
    pub oidc_client_id: Option<String>,
    #[arg(long)]
    pub oidc_ca_file: Option<String>,
    #[arg(long, default_value = "sub")]
    pub oidc_username_claim: String,
    #[arg(long, default_value = "")]
    pub oidc_username_prefix: String,
    #[arg(long)]
    pub oidc_groups_claim: Option<String>,
    #[arg(long, default_value = "")]
    pub oidc_groups_prefix: String,
    #[arg(long = "oidc-required-claim", value_parser = parse_key_value)]
    pub oidc_required_claims: Vec<(String, String)>,
    #[arg(long = "oidc-signing-algs", value_delimiter = ',')]
    pub oidc_signing_algs: Vec<String>,

    #[arg(long)]
    pub disable_impersonation: bool,
    #[arg(long)]
    pub token_passthrough: bool,
    #[arg(long, value_parser = parse_duration, default_value = "5ms")]
    pub flush_interval: Duration,

    #[arg(long = "extra-user-header", value_parser = parse_key_value)]
    pub extra_user_headers: Vec<(String, String)>,
    #[arg(long)]
    pub extra_user_header_client_ip: bool,

    #[arg(long, default_value_t = 6443)]
    pub secure_port: u16,
    #[arg(long)]
    pub tls_cert_file: Option<String>,
    #[arg(long)]
    pub tls_private_key_file: Option<String>,

    #[arg(long)]
    pub upstream_host: String,
    #[arg(long)]
    pub upstream_ca_file: Option<String>,
    #[arg(long)]
    pub upstream_client_cert_file: Option<String>,
    #[arg(long)]
    pub upstream_client_key_file: Option<String>,
    #[arg(long)]
    pub upstream_token: Option<String>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    let (digits, unit) = raw
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| raw.split_at(i))
        .unwrap_or((raw, "ms"));
    let value: u64 = digits.parse().map_err(|_| format!("invalid duration {raw:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        other => Err(format!("unsupported duration unit {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_parses() {
        assert_eq!(
            parse_key_value("department=eng").unwrap(),
            ("department".to_string(), "eng".to_string())
        );
        assert!(parse_key_value("no-equals-sign").is_err());
    }

    #[test]
    fn duration_parses_ms_and_s() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
    }
}
