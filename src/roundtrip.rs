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

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Response, StatusCode, Uri};
use axum::response::IntoResponse;

use crate::context::RequestCtx;
use crate::error::ProxyError;
use crate::transport::UpstreamTransports;

/// The terminal stage of the pipeline (spec.md §4.8): reads the
/// [`RequestCtx`] exactly once and picks the round-tripper its state
/// dictates. Every other state the context could be in at this point is a
/// programming error upstream of here, not a condition this function
/// recovers from.
pub async fn dispatch(
    transports: &UpstreamTransports,
    ctx: &RequestCtx,
    method: Method,
    uri: Uri,
    mut headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Bytes>, ProxyError> {
    let client = if ctx.no_impersonation() {
        headers.remove(axum::http::header::AUTHORIZATION);
        if let Some(token) = ctx.bearer_token() {
            let value = axum::http::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ProxyError::Client(format!("bearer token unusable as header: {e}")))?;
            headers.insert(axum::http::header::AUTHORIZATION, value);
        }
        &transports.anonymous
    } else if let Some(decision) = ctx.impersonation() {
        headers.remove(axum::http::header::AUTHORIZATION);
        for (name, value) in &decision.headers {
            headers.append(name.clone(), value.clone());
        }
        &transports.privileged
    } else {
        return Err(ProxyError::Assertion(
            "dispatch reached with neither an impersonation decision nor no_impersonation set",
        ));
    };

    let url = format!(
        "{}{}",
        transports.host.trim_end_matches('/'),
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or(uri.path())
    );

    let mut request_headers = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            request_headers.append(name, value);
        }
    }

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| ProxyError::Client(format!("unsupported method: {e}")))?;

    let upstream_response = client
        .request(reqwest_method, &url)
        .headers(request_headers)
        .body(body)
        .send()
        .await
        .map_err(ProxyError::Upstream)?;

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers().iter() {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.append(name, value);
        }
    }
    let response_body = upstream_response.bytes().await.map_err(ProxyError::Upstream)?;

    let mut response = Response::new(response_body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Adapts [`dispatch`]'s typed response into an `axum` handler response.
pub fn into_axum_response(result: Result<Response<Bytes>, ProxyError>) -> axum::response::Response {
    match result {
        Ok(response) => response.into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AuthenticatedUser, ImpersonationDecision};

    fn transports() -> UpstreamTransports {
        UpstreamTransports {
            privileged: reqwest::Client::new(),
            anonymous: reqwest::Client::new(),
            host: "https://upstream.example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_an_unconfigured_context() {
        let ctx = RequestCtx::new(None);
        let result = dispatch(
            &transports(),
            &ctx,
            Method::GET,
            Uri::from_static("/api/v1/pods"),
            HeaderMap::new(),
            Bytes::new(),
        )
        .await;
        assert!(matches!(result, Err(ProxyError::Assertion(_))));
    }

    #[test]
    fn builds_decision_headers_from_sample_user() {
        let user = AuthenticatedUser::new("alice");
        let mut ctx = RequestCtx::new(None);
        ctx.set_impersonation(ImpersonationDecision {
            inbound_user: user.clone(),
            impersonated_user: user,
            headers: vec![],
        });
        assert!(ctx.is_dispatchable());
    }
}
