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

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use axum::http::{HeaderName, HeaderValue};

/// An identity established by one of the authenticators (OIDC or
/// TokenReview). Groups and extras are kept in sorted containers so that
/// header composition (see [`crate::impersonation`]) never needs a
/// separate sort pass to satisfy the reproducible-ordering invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub name: String,
    pub uid: Option<String>,
    pub groups: BTreeSet<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

impl AuthenticatedUser {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            groups: BTreeSet::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = String>) -> Self {
        self.groups.extend(groups);
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.extra.entry(key.into()).or_default().extend(values);
        self
    }
}

/// The outcome of the impersonation decision, computed once after
/// authentication (and, when applicable, the SubjectAccessReview gate) and
/// read exactly once by the round-tripper (spec.md §3, §4.8).
#[derive(Debug, Clone)]
pub struct ImpersonationDecision {
    pub inbound_user: AuthenticatedUser,
    pub impersonated_user: AuthenticatedUser,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

/// Per-request scratch area threading authenticated identity, the
/// impersonation decision, the remote address, and the original bearer
/// token from the auth middleware down to the round-tripper.
///
/// This is a typed struct carried via `Extension`, not a stringly-keyed
/// context map — see spec.md §9's "Request-context carrier" redesign note.
/// Re-reading a field is idempotent; writing a field twice is a
/// programming error and panics in debug builds so the mistake surfaces
/// in tests rather than silently overwriting state the round-tripper
/// depends on.
#[derive(Debug, Clone, Default)]
pub struct RequestCtx {
    bearer_token: Option<String>,
    no_impersonation: bool,
    impersonation: Option<ImpersonationDecision>,
    remote_addr: Option<SocketAddr>,
}

impl RequestCtx {
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            remote_addr,
            ..Default::default()
        }
    }

    /// Stash the raw bearer token so it can be restored verbatim later
    /// under `disableImpersonation` or a positive TokenReview passthrough.
    /// Callers remove the inbound `Authorization` header themselves once
    /// this is called.
    pub fn stash_token(&mut self, raw: String) {
        debug_assert!(
            self.bearer_token.is_none(),
            "bearer token stashed twice on the same request"
        );
        self.bearer_token = Some(raw);
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    pub fn set_no_impersonation(&mut self) {
        debug_assert!(
            !self.no_impersonation,
            "no_impersonation set twice on the same request"
        );
        self.no_impersonation = true;
    }

    pub fn no_impersonation(&self) -> bool {
        self.no_impersonation
    }

    pub fn set_impersonation(&mut self, decision: ImpersonationDecision) {
        debug_assert!(
            self.impersonation.is_none(),
            "impersonation decision attached twice on the same request"
        );
        self.impersonation = Some(decision);
    }

    pub fn impersonation(&self) -> Option<&ImpersonationDecision> {
        self.impersonation.as_ref()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The invariant from spec.md §3: a request may reach the upstream
    /// only if an impersonation decision has been attached, or impersonation
    /// has been explicitly disabled for this request. Any other state is a
    /// programming error.
    pub fn is_dispatchable(&self) -> bool {
        self.impersonation.is_some() || self.no_impersonation
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fresh_context_is_not_dispatchable() {
        let ctx = RequestCtx::new(None);
        assert!(!ctx.is_dispatchable());
    }

    #[test]
    fn no_impersonation_makes_it_dispatchable() {
        let mut ctx = RequestCtx::new(None);
        ctx.set_no_impersonation();
        assert!(ctx.is_dispatchable());
    }

    #[test]
    fn impersonation_decision_makes_it_dispatchable() {
        let mut ctx = RequestCtx::new(None);
        let user = AuthenticatedUser::new("alice");
        ctx.set_impersonation(ImpersonationDecision {
            inbound_user: user.clone(),
            impersonated_user: user,
            headers: Vec::new(),
        });
        assert!(ctx.is_dispatchable());
    }

    #[test]
    fn stash_and_recall_bearer_token() {
        let mut ctx = RequestCtx::new(None);
        ctx.stash_token("abc.def.ghi".to_string());
        assert_eq!(ctx.bearer_token(), Some("abc.def.ghi"));
    }

    #[test]
    #[should_panic(expected = "bearer token stashed twice")]
    fn stashing_twice_panics_in_debug() {
        let mut ctx = RequestCtx::new(None);
        ctx.stash_token("one".to_string());
        ctx.stash_token("two".to_string());
    }

    #[test]
    fn groups_are_kept_sorted() {
        let user = AuthenticatedUser::new("alice")
            .with_groups(["ops".to_string(), "dev".to_string()]);
        let ordered: Vec<&String> = user.groups.iter().collect();
        assert_eq!(ordered, vec!["dev", "ops"]);
    }
}
