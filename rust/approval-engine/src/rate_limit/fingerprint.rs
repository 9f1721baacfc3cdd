//! Client fingerprints for the per-client tier.
//!
//! A fingerprint combines the best network origin available with a subject
//! marker: the authenticated user id, or for anonymous callers a hash of the
//! user agent. Changing one signal alone moves the caller to a new bucket only
//! when the other signal changes with it.

use std::net::IpAddr;

use crate::domain::RequestOrigin;

const FINGERPRINT_HEX_LEN: usize = 32;

/// Best available origin address, or `unknown`.
#[must_use]
pub fn best_origin(origin: &RequestOrigin) -> String {
    let forwarded = origin
        .forwarded_for
        .as_deref()
        .and_then(|header| {
            header
                .split(',')
                .map(str::trim)
                .find_map(|candidate| candidate.parse::<IpAddr>().ok())
        });

    forwarded
        .or_else(|| {
            origin
                .real_ip
                .as_deref()
                .and_then(|raw| raw.trim().parse::<IpAddr>().ok())
        })
        .or(origin.remote_addr)
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
}

/// Derive the client fingerprint.
#[must_use]
pub fn client_fingerprint(origin: &RequestOrigin, authenticated_subject: Option<&str>) -> String {
    let marker = match authenticated_subject {
        Some(subject) => format!("auth:{subject}"),
        None => {
            let agent = origin.user_agent.as_deref().unwrap_or_default();
            let digest = blake3::hash(agent.as_bytes()).to_hex();
            format!("anon:{}", &digest[..16])
        }
    };

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"client-fingerprint-v1:");
    hasher.update(best_origin(origin).as_bytes());
    hasher.update(b"|");
    hasher.update(marker.as_bytes());
    hasher.finalize().to_hex()[..FINGERPRINT_HEX_LEN].to_string()
}
