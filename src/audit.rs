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

use tracing::{event, Level};

use crate::context::AuthenticatedUser;

/// Emits the structured log line recording who a request was impersonated
/// as and whether the round-tripper dispatched it (spec.md §4.7's audit
/// trail). The proxy has no persistence layer of its own — these are
/// `tracing` events, left to whatever subscriber the operator wires up.
pub fn record_dispatch(
    remote_addr: Option<SocketAddr>,
    inbound: &AuthenticatedUser,
    impersonated: Option<&AuthenticatedUser>,
    method: &str,
    path: &str,
) {
    match impersonated {
        Some(target) => event!(
            Level::INFO,
            remote_addr = ?remote_addr,
            inbound_user = %inbound.name,
            impersonated_user = %target.name,
            method,
            path,
            "dispatching impersonated request"
        ),
        None => event!(
            Level::INFO,
            remote_addr = ?remote_addr,
            inbound_user = %inbound.name,
            method,
            path,
            "dispatching passthrough request"
        ),
    }
}

pub fn record_rejected(remote_addr: Option<SocketAddr>, method: &str, path: &str, reason: &str) {
    event!(
        Level::INFO,
        remote_addr = ?remote_addr,
        method,
        path,
        reason,
        "rejected request"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_dispatch_does_not_panic_without_impersonation() {
        let user = AuthenticatedUser::new("alice");
        record_dispatch(None, &user, None, "GET", "/api/v1/pods");
    }

    #[test]
    fn record_dispatch_does_not_panic_with_impersonation() {
        let inbound = AuthenticatedUser::new("alice");
        let target = AuthenticatedUser::new("bob");
        record_dispatch(None, &inbound, Some(&target), "GET", "/api/v1/pods");
    }
}
