use std::net::{IpAddr, SocketAddr};

use axum::http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;
const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;

#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV32_OFFSET, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV32_PRIME)
    })
}

#[must_use]
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV64_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV64_PRIME)
    })
}

/// Stable 16-hex-char fingerprint of a rate policy, appended to bucket keys.
#[must_use]
pub fn policy_suffix(requests_per_minute: u32, burst: u32) -> String {
    format!(
        "{:016x}",
        fnv1a_64(format!("{requests_per_minute}:{burst}").as_bytes())
    )
}

/// Which forwarded headers are trusted when resolving the client address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyTrust {
    /// Transport peer only.
    #[default]
    None,
    /// `CF-Connecting-IP`.
    Cloudflare,
    /// `X-Real-IP`.
    Proxy,
    /// `CF-Connecting-IP`, then `X-Real-IP`.
    All,
}

impl ProxyTrust {
    fn trusted_headers(self) -> &'static [&'static str] {
        match self {
            Self::None => &[],
            Self::Cloudflare => &["cf-connecting-ip"],
            Self::Proxy => &["x-real-ip"],
            Self::All => &["cf-connecting-ip", "x-real-ip"],
        }
    }

    /// Resolve the client address. Falls back to the peer when no trusted
    /// header carries a parseable IP.
    #[must_use]
    pub fn client_ip(self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        for name in self.trusted_headers() {
            if let Some(ip) = headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .and_then(|v| v.parse::<IpAddr>().ok())
            {
                return ip.to_string();
            }
        }

        peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
    }
}

/// `ip:method:path`.
#[must_use]
pub fn default_key(ip: &str, method: &Method, path: &str) -> String {
    format!("{ip}:{method}:{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn fnv_known_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn policy_suffix_is_stable_and_distinct() {
        let a = policy_suffix(60, 5);
        assert_eq!(a.len(), 16);
        assert_eq!(a, policy_suffix(60, 5));
        assert_ne!(a, policy_suffix(60, 6));
        assert_ne!(a, policy_suffix(120, 5));
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("1.1.1.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("2.2.2.2"));
        headers
    }

    #[test]
    fn client_ip_follows_trust_policy() {
        let peer: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let headers = headers();

        assert_eq!(ProxyTrust::None.client_ip(&headers, Some(peer)), "10.0.0.1");
        assert_eq!(
            ProxyTrust::Cloudflare.client_ip(&headers, Some(peer)),
            "1.1.1.1"
        );
        assert_eq!(ProxyTrust::Proxy.client_ip(&headers, Some(peer)), "2.2.2.2");
        assert_eq!(ProxyTrust::All.client_ip(&headers, Some(peer)), "1.1.1.1");

        let mut only_real = HeaderMap::new();
        only_real.insert("x-real-ip", HeaderValue::from_static("2.2.2.2"));
        assert_eq!(ProxyTrust::All.client_ip(&only_real, Some(peer)), "2.2.2.2");
    }

    #[test]
    fn client_ip_ignores_garbage_and_missing_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("not-an-ip"));
        assert_eq!(ProxyTrust::Proxy.client_ip(&headers, None), "unknown");
    }

    #[test]
    fn default_key_shape() {
        assert_eq!(
            default_key("1.2.3.4", &Method::POST, "/api/auth/login"),
            "1.2.3.4:POST:/api/auth/login"
        );
    }
}
