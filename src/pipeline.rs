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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http_body_util::Empty;
use hyper::body::Bytes as HyperBytes;
use hyper::upgrade::OnUpgrade;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::audit;
use crate::config::AppConfig;
use crate::context::{AuthenticatedUser, ImpersonationDecision, RequestCtx};
use crate::error::{AuthError, ProxyError};
use crate::impersonation;
use crate::oidc::OidcAuthenticator;
use crate::roundtrip;
use crate::sar::SubjectAccessReviewer;
use crate::tokenreview::{self, TokenReviewAuthenticator};
use crate::transport::UpstreamTransports;
use crate::websocket;

/// Which authenticator produced an [`AuthenticatedUser`]. A request
/// authenticated via TokenReview never gets impersonation headers: the
/// apiserver has already resolved its identity for us, so the proxy
/// forwards the original bearer token as-is (spec.md §4.7's "noMatch+TR
/// → tokenReview ├ ok → proceed (noImpersonation)" branch), exactly as
/// `--disable-impersonation` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthSource {
    Oidc,
    TokenReview,
}

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Default header-read timeout (spec.md §5), surfaced to `main` for
/// startup logging. `axum::serve` has no hook for a header-phase timeout
/// distinct from the rest of the request, so this value is advisory only
/// until the listener is built on a lower-level hyper server.
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a request needs to be authenticated, impersonated, and
/// dispatched: the resolved configuration and the collaborators built
/// from it. Shared across the whole server via `Arc` (spec.md §4.7).
pub struct AppState {
    config: Arc<AppConfig>,
    transports: UpstreamTransports,
    oidc: Option<OidcAuthenticator>,
    token_review: TokenReviewAuthenticator,
    sar: SubjectAccessReviewer,
}

impl AppState {
    pub fn new(config: AppConfig, transports: UpstreamTransports) -> Result<Arc<Self>, ProxyError> {
        let oidc = config
            .oidc()
            .map(|c| -> Result<OidcAuthenticator, ProxyError> {
                let http = crate::transport::build_oidc_client(c)?;
                Ok(OidcAuthenticator::new(c.clone(), http))
            })
            .transpose()?;
        let token_review =
            TokenReviewAuthenticator::new(transports.anonymous.clone(), transports.host.clone());
        let sar = SubjectAccessReviewer::new(transports.privileged.clone(), transports.host.clone());
        Ok(Arc::new(Self {
            config: Arc::new(config),
            transports,
            oidc,
            token_review,
            sar,
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// Assembles the router: a single fallback handler running the whole
/// pipeline, wrapped with the teacher's panic guard and request tracing
/// layers (spec.md §2.7 and the ambient logging additions).
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handle)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn extract_bearer_token(req_headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(protocols) = req_headers
        .get(axum::http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = websocket::extract_bearer_from_subprotocols(protocols) {
            return Some(token);
        }
    }

    req_headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn authenticate(
    state: &AppState,
    token: Option<&str>,
) -> Result<(AuthenticatedUser, AuthSource), ProxyError> {
    let Some(token) = token else {
        return Err(ProxyError::Auth(AuthError::NoToken));
    };

    let oidc_result: Result<AuthenticatedUser, AuthError> = match &state.oidc {
        Some(oidc) => oidc.authenticate(token).await,
        None => Err(AuthError::NoToken),
    };

    if tokenreview::should_fall_back(&oidc_result, state.config.proxy().token_review_enabled()) {
        let user = state.token_review.authenticate(token).await?;
        Ok((user, AuthSource::TokenReview))
    } else {
        oidc_result
            .map(|user| (user, AuthSource::Oidc))
            .map_err(ProxyError::Auth)
    }
}

async fn handle(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    match run(&state, addr, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn run(state: &AppState, addr: SocketAddr, req: Request) -> Result<Response, ProxyError> {
    let (mut parts, body) = req.into_parts();
    let mut ctx = RequestCtx::new(Some(addr));

    let token = extract_bearer_token(&parts.headers);
    let (user, source) = match authenticate(state, token.as_deref()).await {
        Ok(authenticated) => authenticated,
        Err(e) => {
            audit::record_rejected(Some(addr), parts.method.as_str(), parts.uri.path(), &e.to_string());
            return Err(e);
        }
    };

    if let Some(raw) = &token {
        ctx.stash_token(raw.clone());
    }

    if state.config.proxy().disable_impersonation() || source == AuthSource::TokenReview {
        ctx.set_no_impersonation();
    } else {
        let target = match impersonation::parse_headers(&parts.headers) {
            Some(requested) => {
                state.sar.authorize(&requested).await?;
                requested
            }
            None => user.clone(),
        };

        let remote_ip = addr.ip().to_string();
        let headers = impersonation::compose_headers(
            &target,
            state.config.proxy().extra_user_headers(),
            state.config.proxy().client_ip_header_enabled(),
            Some(&remote_ip),
        );
        ctx.set_impersonation(ImpersonationDecision {
            inbound_user: user.clone(),
            impersonated_user: target,
            headers,
        });
    }

    audit::record_dispatch(
        Some(addr),
        &user,
        ctx.impersonation().map(|d| &d.impersonated_user),
        parts.method.as_str(),
        parts.uri.path(),
    );

    if websocket::is_upgrade_request(&parts.headers) {
        return run_upgrade(state, &ctx, &mut parts).await;
    }

    let body_bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::Client(format!("reading request body: {e}")))?;

    let response = roundtrip::dispatch(
        &state.transports,
        &ctx,
        parts.method,
        parts.uri,
        parts.headers,
        body_bytes,
    )
    .await?;

    let (response_parts, response_body) = response.into_parts();
    Ok(Response::from_parts(response_parts, Body::from(response_body)))
}

/// Completes a WebSocket (or other HTTP Upgrade) handshake with the
/// upstream and hands both ends of the tunnel to [`websocket::tunnel`]
/// (spec.md §4.6). Unlike [`roundtrip::dispatch`], this cannot go through
/// `reqwest`, which buffers a complete response and has no notion of an
/// upgraded connection — the upstream leg is dialed with `hyper` directly.
async fn run_upgrade(state: &AppState, ctx: &RequestCtx, parts: &mut Parts) -> Result<Response, ProxyError> {
    let on_upgrade = parts
        .extensions
        .remove::<OnUpgrade>()
        .ok_or(ProxyError::Assertion("upgrade request carries no OnUpgrade extension"))?;

    let mut headers = parts.headers.clone();
    headers.remove(axum::http::header::AUTHORIZATION);

    if ctx.no_impersonation() {
        if let Some(token) = ctx.bearer_token() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ProxyError::Client(format!("bearer token unusable as header: {e}")))?;
            headers.insert(axum::http::header::AUTHORIZATION, value);
        }
    } else if let Some(decision) = ctx.impersonation() {
        for (name, value) in &decision.headers {
            headers.append(name.clone(), value.clone());
        }
    } else {
        return Err(ProxyError::Assertion(
            "websocket upgrade reached with neither an impersonation decision nor no_impersonation set",
        ));
    }

    if let Some(protocols) = headers
        .get(axum::http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
    {
        let stripped = websocket::strip_auth_subprotocol(protocols);
        if stripped.is_empty() {
            headers.remove(axum::http::header::SEC_WEBSOCKET_PROTOCOL);
        } else {
            let value = HeaderValue::from_str(&stripped)
                .map_err(|e| ProxyError::Client(format!("subprotocol list unusable as header: {e}")))?;
            headers.insert(axum::http::header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }

    let authority = upstream_authority(&state.transports.host)?;
    let mut sender = websocket::dial_upstream(&authority).await?;

    let mut upstream_request_builder = hyper::Request::builder()
        .method(parts.method.clone())
        .uri(parts.uri.clone());
    for (name, value) in headers.iter() {
        upstream_request_builder = upstream_request_builder.header(name, value);
    }
    let upstream_request = upstream_request_builder
        .body(Empty::<HyperBytes>::new())
        .map_err(|e| ProxyError::Client(format!("building upstream upgrade request: {e}")))?;

    let mut upstream_response = sender
        .send_request(upstream_request)
        .await
        .map_err(|e| ProxyError::Client(format!("upstream upgrade request failed: {e}")))?;

    if upstream_response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(ProxyError::Client(format!(
            "upstream refused websocket upgrade: {}",
            upstream_response.status()
        )));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);

    let mut client_response_builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in upstream_response.headers().iter() {
        client_response_builder = client_response_builder.header(name, value);
    }
    let client_response = client_response_builder
        .body(Body::empty())
        .map_err(|e| ProxyError::Client(format!("building client upgrade response: {e}")))?;

    tokio::spawn(async move {
        let client_upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!("client websocket upgrade failed: {e}");
                return;
            }
        };
        let upstream_upgraded = match upstream_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!("upstream websocket upgrade failed: {e}");
                return;
            }
        };
        if let Err(e) = websocket::tunnel(client_upgraded, upstream_upgraded).await {
            tracing::warn!("websocket tunnel ended: {e}");
        }
    });

    Ok(client_response)
}

/// Resolves the upstream's `host:port` authority for a raw TCP dial.
/// `transports.host` is a full URL (scheme included) because `reqwest`
/// wants one; this is the one place the proxy needs the bare authority.
fn upstream_authority(host: &str) -> Result<String, ProxyError> {
    let uri: Uri = host
        .parse()
        .map_err(|e| ProxyError::Config(format!("upstream host {host} is not a valid URI: {e}")))?;
    let authority = uri
        .authority()
        .ok_or_else(|| ProxyError::Config(format!("upstream host {host} has no authority")))?;
    if authority.port().is_some() {
        return Ok(authority.as_str().to_string());
    }
    let port = match uri.scheme_str() {
        Some("https") | None => 443,
        Some("http") => 80,
        Some(other) => {
            return Err(ProxyError::Config(format!(
                "upstream host {host} has unsupported scheme {other}"
            )))
        }
    };
    Ok(format!("{}:{port}", authority.host()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_from_authorization_header() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc.def.ghi".parse().unwrap(),
        );
        assert_eq!(extract_bearer_token(&headers), Some("abc.def.ghi".to_string()));
    }

    #[test]
    fn no_authorization_header_yields_none() {
        assert_eq!(extract_bearer_token(&axum::http::HeaderMap::new()), None);
    }
}
