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

use serde::{Deserialize, Serialize};

use crate::context::AuthenticatedUser;
use crate::error::ProxyError;

const SAR_PATH: &str = "/apis/authorization.k8s.io/v1/subjectaccessreviews";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImpersonationKind {
    User,
    Group,
    Uid,
    Extra,
}

impl ImpersonationKind {
    fn resource(self) -> &'static str {
        match self {
            ImpersonationKind::User => "users",
            ImpersonationKind::Group => "groups",
            ImpersonationKind::Uid => "uids",
            ImpersonationKind::Extra => "userextras",
        }
    }
}

#[derive(Debug, Serialize)]
struct SarRequest<'a> {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    spec: SarSpec<'a>,
}

#[derive(Debug, Serialize)]
struct SarSpec<'a> {
    #[serde(rename = "resourceAttributes")]
    resource_attributes: SarResourceAttributes<'a>,
}

#[derive(Debug, Serialize)]
struct SarResourceAttributes<'a> {
    verb: &'static str,
    resource: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subresource: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SarResponse {
    status: SarStatus,
}

#[derive(Debug, Deserialize, Default)]
struct SarStatus {
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Gates an already-authenticated caller's *own* impersonation request
/// (spec.md §4.4): triggered only when the inbound request itself carries
/// `Impersonate-*` headers (nested impersonation). Every named subject —
/// the user, each group, the uid if present, and each extra key — must be
/// individually authorized to `impersonate`, or the whole request is
/// denied.
pub struct SubjectAccessReviewer {
    http: reqwest::Client,
    host: String,
}

impl SubjectAccessReviewer {
    pub fn new(http: reqwest::Client, host: String) -> Self {
        Self { http, host }
    }

    async fn check(&self, kind: ImpersonationKind, name: &str, subresource: Option<&str>) -> Result<(), ProxyError> {
        let url = format!("{}{}", self.host.trim_end_matches('/'), SAR_PATH);
        let body = SarRequest {
            api_version: "authorization.k8s.io/v1",
            kind: "SubjectAccessReview",
            spec: SarSpec {
                resource_attributes: SarResourceAttributes {
                    verb: "impersonate",
                    resource: kind.resource(),
                    name,
                    subresource,
                },
            },
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ProxyError::Upstream)?;

        let review: SarResponse = response.json().await.map_err(ProxyError::Upstream)?;
        if !review.status.allowed {
            tracing::event!(
                tracing::Level::INFO,
                resource = kind.resource(),
                name,
                reason = review.status.reason.as_deref().unwrap_or(""),
                "impersonation denied by SubjectAccessReview"
            );
            return Err(ProxyError::Authz);
        }
        Ok(())
    }

    /// Authorizes every subject named by `requested` on behalf of
    /// `caller`. Any single denial fails the whole gate (spec.md §4.4).
    pub async fn authorize(&self, requested: &AuthenticatedUser) -> Result<(), ProxyError> {
        self.check(ImpersonationKind::User, &requested.name, None).await?;
        for group in &requested.groups {
            self.check(ImpersonationKind::Group, group, None).await?;
        }
        if let Some(uid) = &requested.uid {
            self.check(ImpersonationKind::Uid, uid, None).await?;
        }
        for (key, values) in &requested.extra {
            for value in values {
                self.check(ImpersonationKind::Extra, value, Some(key)).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_match_k8s_api() {
        assert_eq!(ImpersonationKind::User.resource(), "users");
        assert_eq!(ImpersonationKind::Group.resource(), "groups");
        assert_eq!(ImpersonationKind::Uid.resource(), "uids");
        assert_eq!(ImpersonationKind::Extra.resource(), "userextras");
    }

    #[tokio::test]
    async fn authorizes_every_named_subject() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", SAR_PATH)
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":{"allowed":true}}"#)
            .expect(2) // one user check, one group check
            .create_async()
            .await;

        let reviewer = SubjectAccessReviewer::new(reqwest::Client::new(), server.url());
        let target = AuthenticatedUser::new("alice").with_groups(["ops".to_string()]);
        reviewer.authorize(&target).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_single_denial_fails_the_whole_gate() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", SAR_PATH)
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":{"allowed":false,"reason":"not permitted"}}"#)
            .create_async()
            .await;

        let reviewer = SubjectAccessReviewer::new(reqwest::Client::new(), server.url());
        let target = AuthenticatedUser::new("mallory");
        let result = reviewer.authorize(&target).await;
        assert!(matches!(result, Err(ProxyError::Authz)));
    }
}
