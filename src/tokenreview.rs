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

use serde::{Deserialize, Serialize};

use crate::context::AuthenticatedUser;
use crate::error::{AuthError, ProxyError};

const TOKENREVIEW_PATH: &str = "/apis/authentication.k8s.io/v1/tokenreviews";

#[derive(Debug, Serialize)]
struct TokenReviewRequest<'a> {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    spec: TokenReviewSpec<'a>,
}

#[derive(Debug, Serialize)]
struct TokenReviewSpec<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenReviewResponse {
    status: TokenReviewStatus,
}

#[derive(Debug, Deserialize, Default)]
struct TokenReviewStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    user: Option<TokenReviewUserInfo>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenReviewUserInfo {
    username: String,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    extra: BTreeMap<String, Vec<String>>,
}

/// Submits a bearer token to the upstream API server's TokenReview API as
/// a fallback when OIDC authentication returns no-match (spec.md §4.3).
/// Uses the anonymous transport — this call carries no impersonation
/// headers of its own.
pub struct TokenReviewAuthenticator {
    http: reqwest::Client,
    host: String,
}

impl TokenReviewAuthenticator {
    pub fn new(http: reqwest::Client, host: String) -> Self {
        Self { http, host }
    }

    /// Transport and parse failures surface as [`ProxyError::Upstream`]
    /// (502), matching spec.md §4.3/§7's `upstreamError` policy — they are
    /// not an authentication verdict, unlike an `authenticated: false`
    /// response, which is a definite reject ([`AuthError::BadToken`]).
    pub async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, ProxyError> {
        let url = format!("{}{}", self.host.trim_end_matches('/'), TOKENREVIEW_PATH);
        let body = TokenReviewRequest {
            api_version: "authentication.k8s.io/v1",
            kind: "TokenReview",
            spec: TokenReviewSpec { token },
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ProxyError::Upstream)?;

        let review: TokenReviewResponse = response.json().await.map_err(ProxyError::Upstream)?;

        if !review.status.authenticated {
            let reason = review.status.error.unwrap_or_else(|| "not authenticated".to_string());
            return Err(ProxyError::Auth(AuthError::BadToken(reason)));
        }

        let info = review.status.user.ok_or(ProxyError::Auth(AuthError::NoName))?;
        if info.username.is_empty() {
            return Err(ProxyError::Auth(AuthError::NoName));
        }

        let mut user = AuthenticatedUser::new(info.username);
        if let Some(uid) = info.uid {
            user = user.with_uid(uid);
        }
        user = user.with_groups(info.groups);
        for (key, values) in info.extra {
            user = user.with_extra(key, values);
        }
        Ok(user)
    }
}

/// Callers invoke TokenReview only after OIDC authentication reports
/// no-match — either because OIDC is not configured at all (pure
/// `--token-passthrough`) or because no bearer token was presented. A
/// definite reject from OIDC (bad signature, wrong audience, expired,
/// required-claim mismatch) never reaches this function.
pub fn should_fall_back(oidc_result: &Result<AuthenticatedUser, AuthError>, token_review_enabled: bool) -> bool {
    token_review_enabled
        && match oidc_result {
            Ok(_) => false,
            Err(e) => !e.is_definite_reject(),
        }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_on_no_token() {
        let result: Result<AuthenticatedUser, AuthError> = Err(AuthError::NoToken);
        assert!(should_fall_back(&result, true));
    }

    #[test]
    fn does_not_fall_back_on_definite_reject() {
        let result: Result<AuthenticatedUser, AuthError> = Err(AuthError::BadToken("bad sig".to_string()));
        assert!(!should_fall_back(&result, true));
    }

    #[test]
    fn does_not_fall_back_when_disabled() {
        let result: Result<AuthenticatedUser, AuthError> = Err(AuthError::NoToken);
        assert!(!should_fall_back(&result, false));
    }

    #[test]
    fn does_not_fall_back_on_success() {
        let result: Result<AuthenticatedUser, AuthError> = Ok(AuthenticatedUser::new("alice"));
        assert!(!should_fall_back(&result, true));
    }

    #[tokio::test]
    async fn authenticates_against_a_successful_review() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", TOKENREVIEW_PATH)
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"status":{"authenticated":true,"user":{"username":"alice","uid":"1234","groups":["devs"]}}}"#,
            )
            .create_async()
            .await;

        let authenticator = TokenReviewAuthenticator::new(reqwest::Client::new(), server.url());
        let user = authenticator.authenticate("some.jwt.token").await.unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(user.uid, Some("1234".to_string()));
        assert!(user.groups.contains("devs"));
    }

    #[tokio::test]
    async fn rejects_an_unauthenticated_review() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", TOKENREVIEW_PATH)
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":{"authenticated":false,"error":"invalid bearer token"}}"#)
            .create_async()
            .await;

        let authenticator = TokenReviewAuthenticator::new(reqwest::Client::new(), server.url());
        let err = authenticator.authenticate("bad.jwt.token").await.unwrap_err();
        assert!(matches!(err, ProxyError::Auth(AuthError::BadToken(_))));
    }
}
