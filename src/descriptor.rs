//! Connection descriptor strings handed to client software.
//!
//! `vless://<identity>@<host>:<port>?<params>#<display>`, with parameters in
//! a fixed order so the same inputs always produce the same bytes.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use uuid::Uuid;

use crate::config::{BackendDescriptor, EndpointProfile, SecurityMode};

/// Everything except RFC 3986 unreserved characters.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Fingerprint assumed when a reality endpoint does not name one.
const DEFAULT_FINGERPRINT: &str = "chrome";

/// Build the descriptor for `identity` on `backend` using `profile`.
pub fn build(
    identity: Uuid,
    label: &str,
    backend: &BackendDescriptor,
    profile: &EndpointProfile,
) -> String {
    let port = profile.port.unwrap_or(backend.port);
    let params = params(backend, profile)
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, encode(&value)))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "vless://{}@{}:{}?{}#{}",
        identity,
        backend.public_host(),
        port,
        params,
        encode(&display_name(label, profile))
    )
}

/// `"<prefix> <label>"` when a prefix is configured, else the bare label.
pub fn display_name(label: &str, profile: &EndpointProfile) -> String {
    match profile.name_prefix.as_deref().filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{} {}", prefix, label),
        None => label.to_string(),
    }
}

fn params(backend: &BackendDescriptor, profile: &EndpointProfile) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("type", profile.network.clone()),
        ("encryption", "none".to_string()),
    ];

    match profile.network.as_str() {
        "grpc" => {
            params.push((
                "serviceName",
                profile.service_name.clone().unwrap_or_default(),
            ));
            params.push(("mode", "gun".to_string()));
        }
        "ws" => {
            push_some(&mut params, "path", &profile.path);
            push_some(&mut params, "host", &profile.host);
        }
        _ => {}
    }

    params.push(("security", profile.security.as_str().to_string()));

    match profile.security {
        SecurityMode::Reality => {
            push_some(&mut params, "pbk", &profile.public_key);
            let fingerprint = profile
                .fingerprint
                .clone()
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| DEFAULT_FINGERPRINT.to_string());
            params.push(("fp", fingerprint));
            push_some(&mut params, "sni", &profile.sni);
            push_some(&mut params, "sid", &profile.short_id);
            push_some(&mut params, "flow", &profile.flow);
            params.push(("spx", "/".to_string()));
        }
        SecurityMode::Tls => {
            push_some(&mut params, "fp", &profile.fingerprint);
            // The certificate is issued for the host clients dial.
            let sni = profile
                .sni
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| backend.public_host().to_string());
            params.push(("sni", sni));
            push_some(&mut params, "flow", &profile.flow);
        }
        SecurityMode::None => {}
    }

    params
}

fn push_some(params: &mut Vec<(&'static str, String)>, key: &'static str, value: &Option<String>) {
    if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
        params.push((key, value.to_string()));
    }
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}
