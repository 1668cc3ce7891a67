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

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{event, Level};

/// Reasons an [`AuthError`] was raised, matching the OIDC authenticator's
/// own failure taxonomy so the TokenReview fallback can tell a definite
/// reject apart from "this issuer doesn't recognize the token".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorReason {
    NoToken,
    BadToken,
    NoName,
    IssuerUnreachable,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no bearer token presented")]
    NoToken,
    #[error("token rejected: {0}")]
    BadToken(String),
    #[error("token has no usable username")]
    NoName,
    #[error("oidc issuer unreachable: {0}")]
    IssuerUnreachable(String),
}

impl AuthError {
    pub fn reason(&self) -> AuthErrorReason {
        match self {
            AuthError::NoToken => AuthErrorReason::NoToken,
            AuthError::BadToken(_) => AuthErrorReason::BadToken,
            AuthError::NoName => AuthErrorReason::NoName,
            AuthError::IssuerUnreachable(_) => AuthErrorReason::IssuerUnreachable,
        }
    }

    /// A definite reject is a token that *matched* this issuer but failed
    /// validation (bad signature, wrong audience, expired, required claim
    /// mismatch). It is distinct from "no match", which occurs only when
    /// the token carries no `Authorization: Bearer` at all, or the OIDC
    /// issuer is simply unreachable. Per spec.md §7 and §9, TokenReview
    /// fallback runs on no-match, never on a definite reject.
    pub fn is_definite_reject(&self) -> bool {
        matches!(self, AuthError::BadToken(_) | AuthError::NoName)
    }
}

/// Top-level error kind for the proxy's request pipeline. Every error that
/// can reach the edge of the pipeline is one of these six kinds; the
/// [`IntoResponse`] impl below is the single place that turns a kind into
/// wire bytes.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("impersonation not permitted")]
    Authz,
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("pipeline invariant violated: {0}")]
    Assertion(&'static str),
    #[error("malformed client request: {0}")]
    Client(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            ProxyError::Config(msg) => {
                event!(Level::ERROR, "configuration error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
            ProxyError::Auth(cause) => {
                event!(Level::INFO, reason = ?cause.reason(), "authentication rejected: {cause}");
                (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
            }
            ProxyError::Authz => {
                event!(Level::INFO, "impersonation denied by SubjectAccessReview");
                (StatusCode::FORBIDDEN, "Forbidden").into_response()
            }
            ProxyError::Upstream(cause) => {
                event!(Level::WARN, "upstream transport error: {cause}");
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
            ProxyError::Assertion(what) => {
                event!(Level::ERROR, "assertion failed: {what}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
            ProxyError::Client(msg) => {
                event!(Level::DEBUG, "malformed request: {msg}");
                (StatusCode::BAD_REQUEST, "Bad Request").into_response()
            }
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
