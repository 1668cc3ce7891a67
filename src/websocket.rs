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

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::client::conn::http1 as client_http1;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{event, Level};

use crate::error::ProxyError;

const AUTH_SUBPROTOCOL_PREFIX: &str = "base64url.bearer.authorization.k8s.io.";

/// True when the request carries the `Connection: Upgrade` /
/// `Upgrade: websocket` pair an exec/attach/port-forward subresource
/// uses to open a streaming connection (spec.md §4.6).
pub fn is_upgrade_request(headers: &axum::http::HeaderMap) -> bool {
    let is_upgrade_connection = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let is_websocket = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    is_upgrade_connection && is_websocket
}

/// Scans `Sec-WebSocket-Protocol` for the bearer-token-carrying
/// subprotocol and decodes the embedded token. The apiserver's WebSocket
/// clients tunnel the bearer token this way because browsers cannot set
/// an `Authorization` header on a WebSocket handshake.
pub fn extract_bearer_from_subprotocols(protocols: &str) -> Option<String> {
    protocols.split(',').map(str::trim).find_map(|p| {
        let encoded = p.strip_prefix(AUTH_SUBPROTOCOL_PREFIX)?;
        let raw = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        String::from_utf8(raw).ok()
    })
}

/// Removes the auth subprotocol from the list forwarded upstream. The
/// original distribution this proxy is modelled on forwarded it verbatim,
/// leaking the bearer token to the upstream's WebSocket protocol
/// negotiation; this proxy strips it once the token has been extracted.
pub fn strip_auth_subprotocol(protocols: &str) -> String {
    protocols
        .split(',')
        .map(str::trim)
        .filter(|p| !p.starts_with(AUTH_SUBPROTOCOL_PREFIX))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Duplex-copies bytes between the client's upgraded connection and a
/// freshly dialed upgraded connection to `upstream_authority`, after the
/// upstream handshake response has already arrived with a `101 Switching
/// Protocols`. Grounded in the CONNECT-tunnel shape of piping two
/// `hyper::upgrade::Upgraded` halves through `tokio::io::copy_bidirectional`.
pub async fn tunnel(client_upgraded: Upgraded, upstream_upgraded: Upgraded) -> Result<(), ProxyError> {
    let mut client_io = TokioIo::new(client_upgraded);
    let mut upstream_io = TokioIo::new(upstream_upgraded);
    match copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((from_client, from_upstream)) => {
            event!(Level::DEBUG, from_client, from_upstream, "websocket tunnel closed");
            Ok(())
        }
        Err(e) => Err(ProxyError::Client(format!("websocket tunnel broken: {e}"))),
    }
}

/// Dials the upstream host:port over plain TCP and sends an HTTP/1.1
/// upgrade handshake, returning the connection's `SendRequest` handle for
/// the caller to drive. TLS dialing is handled by the caller's transport
/// when the upstream scheme requires it; this helper covers the
/// plaintext case used by in-cluster upstreams reachable over a service
/// mesh sidecar.
pub async fn dial_upstream(
    authority: &str,
) -> Result<client_http1::SendRequest<Empty<Bytes>>, ProxyError> {
    let stream = TcpStream::connect(authority)
        .await
        .map_err(|e| ProxyError::Client(format!("dialing upstream {authority}: {e}")))?;
    let io = TokioIo::new(stream);
    let (sender, connection) = client_http1::handshake(io)
        .await
        .map_err(|e| ProxyError::Client(format!("upstream handshake failed: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            event!(Level::WARN, "upstream websocket connection error: {e}");
        }
    });
    Ok(sender)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_token_from_subprotocol_list() {
        let token = URL_SAFE_NO_PAD.encode("abc.def.ghi");
        let protocols = format!("channel.k8s.io, base64url.bearer.authorization.k8s.io.{token}");
        assert_eq!(
            extract_bearer_from_subprotocols(&protocols),
            Some("abc.def.ghi".to_string())
        );
    }

    #[test]
    fn no_auth_subprotocol_yields_none() {
        assert_eq!(extract_bearer_from_subprotocols("channel.k8s.io"), None);
    }

    #[test]
    fn strip_removes_only_the_auth_entry() {
        let token = URL_SAFE_NO_PAD.encode("abc.def.ghi");
        let protocols = format!("channel.k8s.io, base64url.bearer.authorization.k8s.io.{token}");
        assert_eq!(strip_auth_subprotocol(&protocols), "channel.k8s.io");
    }

    #[test]
    fn detects_upgrade_requests() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::CONNECTION, "Upgrade".parse().unwrap());
        headers.insert(axum::http::header::UPGRADE, "websocket".parse().unwrap());
        assert!(is_upgrade_request(&headers));

        let plain = axum::http::HeaderMap::new();
        assert!(!is_upgrade_request(&plain));
    }
}
