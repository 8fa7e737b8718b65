//! Remote artifact download
//!
//! Every download is checked before any bytes hit disk: the scheme must be
//! HTTPS, the path must carry an allowed archive extension, and every address
//! the host resolves to must be public. The connection is then pinned to the
//! checked addresses so a second DNS answer cannot redirect it. Bodies are
//! streamed into a staging file with a hard size ceiling and hashed on the way.

use futures_util::{Stream, StreamExt};
use notehost_core::config::FetcherConfig;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::cache::{ArtifactCache, ArtifactOrigin, ArtifactRecord, is_sha256_hex};

const BLOCKED_HOSTNAMES: [&str; 3] = ["localhost", "metadata.google.internal", "metadata.azure.com"];

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid artifact URL '{0}'")]
    InvalidUrl(String),

    #[error("artifact URL must use https, got '{0}'")]
    InvalidScheme(String),

    #[error("unsupported archive type for '{0}'")]
    UnsupportedArchiveType(String),

    #[error("host '{0}' resolves to a private or internal address")]
    BlockedHost(String),

    #[error("artifact exceeds the {limit} byte download limit")]
    SizeExceeded { limit: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid checksum '{0}': expected 64 hex characters")]
    InvalidChecksum(String),

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("artifact IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::NetworkTimeout(e.to_string())
        } else {
            Self::NetworkError(e.to_string())
        }
    }
}

/// Addresses a plugin must never reach: loopback, private, link-local,
/// carrier-grade NAT, multicast, and unspecified ranges. IPv6 forms that
/// carry an IPv4 address are judged by that address.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(embedded) = embedded_v4(v6) {
                return is_blocked_v4(embedded);
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
                || (first & 0xffc0) == 0xfe80 // link local fe80::/10
                || (first & 0xffc0) == 0xfec0 // site local fec0::/10
        }
    }
}

/// IPv4 address inside a mapped, compatible, NAT64 or 6to4 IPv6 address
fn embedded_v4(v6: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(mapped) = v6.to_ipv4_mapped() {
        return Some(mapped);
    }
    let s = v6.segments();
    let low = Ipv4Addr::new((s[6] >> 8) as u8, s[6] as u8, (s[7] >> 8) as u8, s[7] as u8);
    match s {
        // ::a.b.c.d, leaving :: and ::1 to the checks above
        [0, 0, 0, 0, 0, 0, hi, lo] if hi != 0 || lo > 1 => Some(low),
        // 64:ff9b::/96
        [0x64, 0xff9b, 0, 0, 0, 0, _, _] => Some(low),
        // 2002:AABB:CCDD::/48
        [0x2002, hi, lo, ..] => Some(Ipv4Addr::new((hi >> 8) as u8, hi as u8, (lo >> 8) as u8, lo as u8)),
        _ => None,
    }
}

fn is_blocked_v4(v4: Ipv4Addr) -> bool {
    let [a, b, ..] = v4.octets();
    a == 0 // 0.0.0.0/8
        || v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_broadcast()
        || v4.is_multicast()
        || (a == 100 && (64..128).contains(&b)) // 100.64.0.0/10
}

/// Resolve `url`'s host and refuse it if any answer is non-public.
///
/// Returns the checked addresses for domain hosts so callers can pin the
/// connection to them; IP literals return an empty list.
pub async fn ensure_public_host(url: &Url, allow_private: bool) -> Result<Vec<SocketAddr>, FetchError> {
    let port = url.port_or_known_default().unwrap_or(443);
    let host = url
        .host()
        .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;

    match host {
        Host::Ipv4(v4) => check_literal(IpAddr::V4(v4), allow_private),
        Host::Ipv6(v6) => check_literal(IpAddr::V6(v6), allow_private),
        Host::Domain(domain) => {
            let lower = domain.trim_end_matches('.').to_ascii_lowercase();
            let named_internal = BLOCKED_HOSTNAMES
                .iter()
                .any(|blocked| lower == *blocked || lower.ends_with(&format!(".{}", blocked)));
            if named_internal && !allow_private {
                return Err(FetchError::BlockedHost(domain.to_string()));
            }

            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((lower.as_str(), port))
                .await
                .map_err(|e| FetchError::NetworkError(format!("cannot resolve '{}': {}", domain, e)))?
                .collect();
            if addrs.is_empty() {
                return Err(FetchError::NetworkError(format!("'{}' did not resolve", domain)));
            }
            if !allow_private && addrs.iter().any(|addr| is_blocked_ip(addr.ip())) {
                return Err(FetchError::BlockedHost(domain.to_string()));
            }
            Ok(addrs)
        }
    }
}

fn check_literal(ip: IpAddr, allow_private: bool) -> Result<Vec<SocketAddr>, FetchError> {
    if !allow_private && is_blocked_ip(ip) {
        return Err(FetchError::BlockedHost(ip.to_string()));
    }
    Ok(Vec::new())
}

fn archive_extension(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

pub struct ArtifactFetcher {
    config: FetcherConfig,
    cache: Arc<ArtifactCache>,
}

impl ArtifactFetcher {
    pub fn new(config: FetcherConfig, cache: Arc<ArtifactCache>) -> Self {
        Self { config, cache }
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    /// Download a plugin archive into the cache.
    ///
    /// When `expected_checksum` names content that is already cached, no
    /// network traffic happens at all.
    pub async fn fetch(
        &self,
        url: &str,
        expected_checksum: Option<&str>,
    ) -> Result<ArtifactRecord, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        if parsed.scheme() != "https" {
            return Err(FetchError::InvalidScheme(parsed.scheme().to_string()));
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }

        let extension = archive_extension(&parsed)
            .ok_or_else(|| FetchError::UnsupportedArchiveType(url.to_string()))?;
        if !self
            .config
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
        {
            return Err(FetchError::UnsupportedArchiveType(url.to_string()));
        }

        let expected = match expected_checksum {
            Some(raw) => {
                let normalized = raw.trim().to_ascii_lowercase();
                if !is_sha256_hex(&normalized) {
                    return Err(FetchError::InvalidChecksum(raw.to_string()));
                }
                Some(normalized)
            }
            None => None,
        };

        if let Some(hash) = &expected {
            if let Some(record) = self.cache.lookup(hash) {
                debug!(url, sha256 = %hash, "Artifact served from cache");
                return Ok(record);
            }
        }

        let pinned = ensure_public_host(&parsed, self.config.allow_private_hosts).await?;

        let builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .timeout(Duration::from_secs(self.config.read_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("notehost/", env!("CARGO_PKG_VERSION")));
        let client = pin_resolution(builder, &parsed, &pinned).build()?;

        info!(url, "Downloading plugin artifact");
        let response = client.get(parsed.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::NetworkError(format!("{} returned HTTP {}", url, status)));
        }

        let declared_len = response.content_length();
        self.store_body(url, declared_len, response.bytes_stream(), expected)
            .await
    }

    /// Stream a response body into the cache under the download ceiling.
    ///
    /// Nothing is committed unless the body stays under the limit and matches
    /// `expected`; the staging file is removed on every failure.
    async fn store_body<S, B, E>(
        &self,
        url: &str,
        declared_len: Option<u64>,
        body: S,
        expected: Option<String>,
    ) -> Result<ArtifactRecord, FetchError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        FetchError: From<E>,
    {
        let limit = self.config.max_download_bytes;
        if declared_len.is_some_and(|len| len > limit) {
            warn!(url, limit, "Artifact Content-Length over limit");
            return Err(FetchError::SizeExceeded { limit });
        }

        let staged = self.cache.staging_path();
        let (actual, size) = match stream_to_file(body, &staged, limit).await {
            Ok(done) => done,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(e);
            }
        };

        if let Some(expected) = expected {
            if expected != actual {
                let _ = tokio::fs::remove_file(&staged).await;
                warn!(url, %expected, %actual, "Artifact checksum mismatch");
                return Err(FetchError::ChecksumMismatch { expected, actual });
            }
        }

        let record = self.cache.commit(
            &staged,
            &actual,
            size,
            ArtifactOrigin::Remote {
                url: url.to_string(),
            },
        )?;
        info!(url, sha256 = %record.sha256, size_bytes = record.size_bytes, "Artifact downloaded");
        Ok(record)
    }
}

/// Point the client's resolver for `url`'s domain at the vetted addresses so
/// later lookups cannot move the connection elsewhere
pub(crate) fn pin_resolution(
    builder: reqwest::ClientBuilder,
    url: &Url,
    vetted: &[SocketAddr],
) -> reqwest::ClientBuilder {
    match url.domain() {
        Some(domain) if !vetted.is_empty() => builder.resolve_to_addrs(domain, vetted),
        _ => builder,
    }
}

async fn stream_to_file<S, B, E>(body: S, staged: &Path, limit: u64) -> Result<(String, u64), FetchError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    FetchError: From<E>,
{
    let mut file = tokio::fs::File::create(staged).await?;
    let mut hasher = Sha256::new();
    let mut total = 0u64;
    let mut body = std::pin::pin!(body);

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let chunk = chunk.as_ref();
        total += chunk.len() as u64;
        if total > limit {
            return Err(FetchError::SizeExceeded { limit });
        }
        hasher.update(chunk);
        file.write_all(chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok((hex::encode(hasher.finalize()), total))
}
