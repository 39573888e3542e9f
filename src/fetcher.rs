use std::error::Error as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use axum::body::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use reqwest::redirect::{Attempt, Policy};
use url::{Host, Url};

use crate::config::ALLOWED_IMAGE_TYPES;
use crate::error::{LimitExceeded, ModerationError};

const MAX_REDIRECTS: usize = 5;

/// Downloads remote images, refusing URLs that point at the local machine
/// or private networks.
///
/// Only IP literals are screened. Domain names are not resolved here, so a
/// public name that resolves to a private address is not caught.
#[derive(Debug, Clone)]
pub struct SafeFetcher {
    client: Client,
    max_bytes: usize,
}

impl SafeFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nsfw-moderation-api/", env!("CARGO_PKG_VERSION")))
            .redirect(Policy::custom(screen_redirect))
            .build()?;

        Ok(Self { client, max_bytes })
    }

    pub async fn fetch(&self, url: &str) -> Result<Bytes, ModerationError> {
        let url = check_url(url)?;
        self.download(url).await
    }

    async fn download(&self, url: Url) -> Result<Bytes, ModerationError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(fetch_error)?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_allowed_content_type(&content_type) {
            return Err(ModerationError::InvalidContentType(content_type));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(LimitExceeded::Bytes {
                    size: usize::try_from(length).unwrap_or(usize::MAX),
                    max: self.max_bytes,
                }
                .into());
            }
        }

        // Content-Length can lie or be absent; cap what is actually read.
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(fetch_error)? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(LimitExceeded::Bytes {
                    size: body.len() + chunk.len(),
                    max: self.max_bytes,
                }
                .into());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(Bytes::from(body))
    }
}

fn fetch_error(err: reqwest::Error) -> ModerationError {
    if err.is_timeout() {
        return ModerationError::FetchTimeout;
    }

    // A redirect refused by `screen_redirect` carries our own error as its source.
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(ModerationError::InvalidUrl(reason)) = cause.downcast_ref::<ModerationError>() {
            return ModerationError::InvalidUrl(reason.clone());
        }
        source = cause.source();
    }

    ModerationError::FetchFailed(err.to_string())
}

fn screen_redirect(attempt: Attempt) -> reqwest::redirect::Action {
    // `previous` includes the original URL, so this allows MAX_REDIRECTS hops.
    if attempt.previous().len() > MAX_REDIRECTS {
        return attempt.error("too many redirects");
    }
    match check_host(attempt.url()) {
        Ok(()) => attempt.follow(),
        Err(err) => attempt.error(err),
    }
}

/// Parses `raw` and rejects anything that is not a public http(s) target.
pub fn check_url(raw: &str) -> Result<Url, ModerationError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| ModerationError::InvalidUrl(format!("{raw}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ModerationError::InvalidUrl(
            "URL must start with http:// or https://".into(),
        ));
    }
    check_host(&url)?;
    Ok(url)
}

fn check_host(url: &Url) -> Result<(), ModerationError> {
    let blocked = match url.host() {
        None => return Err(ModerationError::InvalidUrl("URL has no host".into())),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.');
            domain.eq_ignore_ascii_case("localhost")
                || domain.to_ascii_lowercase().ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => is_blocked_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_blocked_ip(IpAddr::V6(ip)),
    };

    if blocked {
        Err(ModerationError::InvalidUrl(
            "Localhost and private IP addresses are not allowed".into(),
        ))
    } else {
        Ok(())
    }
}

pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_blocked_v4(ip),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(mapped) => is_blocked_v4(mapped),
            None => is_blocked_v6(ip),
        },
    }
}

/// Non-global IPv4 ranges: "this network", RFC 1918, loopback, link-local,
/// IETF protocol assignments, documentation, benchmarking, reserved and
/// limited broadcast.
const BLOCKED_V4: &[(Ipv4Addr, u32)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(240, 0, 0, 0), 4),
    (Ipv4Addr::new(255, 255, 255, 255), 32),
];

/// Non-global IPv6 ranges. v4-mapped addresses are screened as IPv4.
const BLOCKED_V6: &[(Ipv6Addr, u32)] = &[
    (Ipv6Addr::UNSPECIFIED, 128),
    (Ipv6Addr::LOCALHOST, 128),
    (Ipv6Addr::new(0x64, 0xff9b, 1, 0, 0, 0, 0, 0), 48),
    (Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), 64),
    (Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 23),
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
];

/// Globally reachable carve-outs inside 2001::/23.
const GLOBAL_V6: &[(Ipv6Addr, u32)] = &[
    (Ipv6Addr::new(0x2001, 1, 0, 0, 0, 0, 0, 1), 128),
    (Ipv6Addr::new(0x2001, 1, 0, 0, 0, 0, 0, 2), 128),
    (Ipv6Addr::new(0x2001, 3, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0x2001, 4, 0x112, 0, 0, 0, 0, 0), 48),
    (Ipv6Addr::new(0x2001, 0x20, 0, 0, 0, 0, 0, 0), 28),
    (Ipv6Addr::new(0x2001, 0x30, 0, 0, 0, 0, 0, 0), 28),
];

fn in_v4_net(ip: Ipv4Addr, (net, prefix): (Ipv4Addr, u32)) -> bool {
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    u32::from(ip) & mask == u32::from(net) & mask
}

fn in_v6_net(ip: Ipv6Addr, (net, prefix): (Ipv6Addr, u32)) -> bool {
    let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
    u128::from(ip) & mask == u128::from(net) & mask
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    BLOCKED_V4.iter().any(|&net| in_v4_net(ip, net))
        // PCP and TURN anycast are globally reachable.
        && !matches!(ip.octets(), [192, 0, 0, 9] | [192, 0, 0, 10])
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    BLOCKED_V6.iter().any(|&net| in_v6_net(ip, net))
        && !GLOBAL_V6.iter().any(|&net| in_v6_net(ip, net))
}

fn is_allowed_content_type(header: &str) -> bool {
    let essence = header
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    ALLOWED_IMAGE_TYPES.contains(&essence.as_str())
}
