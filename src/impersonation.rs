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
use std::str::FromStr;

use axum::http::{HeaderName, HeaderValue};

use crate::context::AuthenticatedUser;

const IMPERSONATE_USER: &str = "Impersonate-User";
const IMPERSONATE_GROUP: &str = "Impersonate-Group";
const IMPERSONATE_UID: &str = "Impersonate-Uid";
const IMPERSONATE_EXTRA_PREFIX: &str = "Impersonate-Extra-";
const CLIENT_IP_EXTRA_KEY: &str = "remote-client-ip";

/// Percent-encodes a byte sequence the way a Kubernetes `Impersonate-Extra-*`
/// header name expects its key segment: unreserved characters pass through,
/// everything else becomes `%XX`.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Composes the `Impersonate-*` header set for `target` (spec.md §4.7).
/// Pure function of its inputs: calling it twice with the same arguments
/// yields byte-identical headers, satisfying the reproducible-ordering
/// property in spec.md §8. Groups are sorted because
/// [`AuthenticatedUser::groups`] is a `BTreeSet`; extras are sorted by key
/// for the same reason.
pub fn compose_headers(
    target: &AuthenticatedUser,
    extra_user_headers: &BTreeMap<String, Vec<String>>,
    client_ip_header_enabled: bool,
    remote_ip: Option<&str>,
) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = Vec::new();

    headers.push((
        HeaderName::from_static("impersonate-user"),
        HeaderValue::from_str(&target.name).unwrap_or_else(|_| HeaderValue::from_static("")),
    ));

    for group in &target.groups {
        if let Ok(value) = HeaderValue::from_str(group) {
            headers.push((HeaderName::from_static("impersonate-group"), value));
        }
    }

    if let Some(uid) = &target.uid {
        if let Ok(value) = HeaderValue::from_str(uid) {
            headers.push((HeaderName::from_static("impersonate-uid"), value));
        }
    }

    push_extra(&mut headers, &target.extra);
    push_extra(&mut headers, extra_user_headers);

    if client_ip_header_enabled {
        if let Some(ip) = remote_ip {
            let mut single = BTreeMap::new();
            single.insert(CLIENT_IP_EXTRA_KEY.to_string(), vec![ip.to_string()]);
            push_extra(&mut headers, &single);
        }
    }

    headers
}

fn push_extra(headers: &mut Vec<(HeaderName, HeaderValue)>, extra: &BTreeMap<String, Vec<String>>) {
    for (key, values) in extra {
        let name = format!(
            "{IMPERSONATE_EXTRA_PREFIX}{}",
            percent_encode(&key.to_lowercase())
        );
        let Ok(header_name) = HeaderName::from_str(&name) else {
            continue;
        };
        for value in values {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                headers.push((header_name.clone(), header_value));
            }
        }
    }
}

/// The fixed set of header name prefixes/exact names this module ever
/// emits, used by the inbound-request SAR gate to detect nested
/// impersonation attempts (spec.md §4.4).
pub fn is_impersonation_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == IMPERSONATE_USER.to_ascii_lowercase()
        || lower == IMPERSONATE_GROUP.to_ascii_lowercase()
        || lower == IMPERSONATE_UID.to_ascii_lowercase()
        || lower.starts_with(&IMPERSONATE_EXTRA_PREFIX.to_ascii_lowercase())
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Reconstructs an [`AuthenticatedUser`] from a set of inbound
/// `Impersonate-*` headers, returning `None` when none are present. Used
/// by the SubjectAccessReview gate to learn what the caller is *asking*
/// to impersonate (spec.md §4.4) — this is the inverse of
/// [`compose_headers`].
pub fn parse_headers(headers: &axum::http::HeaderMap) -> Option<AuthenticatedUser> {
    let name = headers
        .get("impersonate-user")
        .and_then(|v| v.to_str().ok())?
        .to_string();

    let mut user = AuthenticatedUser::new(name);

    let groups: Vec<String> = headers
        .get_all("impersonate-group")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    user = user.with_groups(groups);

    if let Some(uid) = headers.get("impersonate-uid").and_then(|v| v.to_str().ok()) {
        user = user.with_uid(uid);
    }

    let prefix_lower = IMPERSONATE_EXTRA_PREFIX.to_ascii_lowercase();
    for name in headers.keys() {
        let lower = name.as_str().to_ascii_lowercase();
        if let Some(encoded_key) = lower.strip_prefix(&prefix_lower) {
            let key = percent_decode(encoded_key);
            let values: Vec<String> = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::to_string)
                .collect();
            user = user.with_extra(key, values);
        }
    }

    Some(user)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_user() -> AuthenticatedUser {
        AuthenticatedUser::new("alice")
            .with_uid("1234")
            .with_groups(["ops".to_string(), "dev".to_string()])
            .with_extra("department", vec!["eng".to_string()])
    }

    #[test]
    fn header_composition_is_pure() {
        let user = sample_user();
        let extra = BTreeMap::new();
        let first = compose_headers(&user, &extra, false, None);
        let second = compose_headers(&user, &extra, false, None);
        assert_eq!(
            first
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_str().unwrap().to_string()))
                .collect::<Vec<_>>(),
            second
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_str().unwrap().to_string()))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn groups_come_out_sorted() {
        let user = sample_user();
        let headers = compose_headers(&user, &BTreeMap::new(), false, None);
        let groups: Vec<&str> = headers
            .iter()
            .filter(|(n, _)| n.as_str() == "impersonate-group")
            .map(|(_, v)| v.to_str().unwrap())
            .collect();
        assert_eq!(groups, vec!["dev", "ops"]);
    }

    #[test]
    fn extra_key_is_percent_encoded_and_lowercased() {
        let user = AuthenticatedUser::new("alice").with_extra("Department Name", vec!["eng".to_string()]);
        let headers = compose_headers(&user, &BTreeMap::new(), false, None);
        let found = headers
            .iter()
            .any(|(n, _)| n.as_str() == "impersonate-extra-department%20name");
        assert!(found);
    }

    #[test]
    fn client_ip_header_only_added_when_enabled() {
        let user = AuthenticatedUser::new("alice");
        let without = compose_headers(&user, &BTreeMap::new(), false, Some("10.0.0.5"));
        assert!(without
            .iter()
            .all(|(n, _)| n.as_str() != "impersonate-extra-remote-client-ip"));

        let with = compose_headers(&user, &BTreeMap::new(), true, Some("10.0.0.5"));
        assert!(with
            .iter()
            .any(|(n, _)| n.as_str() == "impersonate-extra-remote-client-ip"));
    }

    #[test]
    fn recognizes_all_impersonation_header_shapes() {
        assert!(is_impersonation_header("Impersonate-User"));
        assert!(is_impersonation_header("impersonate-group"));
        assert!(is_impersonation_header("Impersonate-Extra-Department"));
        assert!(!is_impersonation_header("Authorization"));
    }

    #[test]
    fn parse_headers_returns_none_without_impersonate_user() {
        assert!(parse_headers(&axum::http::HeaderMap::new()).is_none());
    }

    #[test]
    fn parse_headers_round_trips_compose_headers() {
        let user = sample_user();
        let headers = compose_headers(&user, &BTreeMap::new(), false, None);
        let mut map = axum::http::HeaderMap::new();
        for (name, value) in headers {
            map.append(name, value);
        }
        let parsed = parse_headers(&map).unwrap();
        assert_eq!(parsed.name, user.name);
        assert_eq!(parsed.groups, user.groups);
        assert_eq!(parsed.uid, user.uid);
        assert_eq!(parsed.extra, user.extra);
    }
}
