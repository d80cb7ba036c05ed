//! Outbound request target filtering.
//!
//! Every call to a user-supplied URL goes through [`EgressPolicy::check`]
//! first, so a remote server registration cannot point the pipeline at the
//! internal network. Redirects are checked hop by hop through
//! [`EgressPolicy::redirect_policy`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::config::EgressConfig;
use crate::error::{DeployError, DeployResult};

/// Hops followed before a redirect chain is abandoned.
const MAX_REDIRECTS: usize = 10;

/// Decides whether an outbound URL may be requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct EgressPolicy {
    allow_private: bool,
}

impl EgressPolicy {
    /// Policy that rejects internal targets.
    #[must_use]
    pub const fn strict() -> Self {
        Self {
            allow_private: false,
        }
    }

    /// Policy that permits loopback and private targets.
    #[must_use]
    pub const fn permissive() -> Self {
        Self {
            allow_private: true,
        }
    }

    /// Whether plain-HTTP and internal targets are allowed.
    #[must_use]
    pub const fn allows_private(&self) -> bool {
        self.allow_private
    }

    /// Parse `raw` and reject it if it targets a disallowed host.
    pub fn check(&self, raw: &str) -> DeployResult<Url> {
        let url = Url::parse(raw)
            .map_err(|e| DeployError::EgressBlocked(format!("invalid URL {raw}: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(DeployError::EgressBlocked(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        if self.allow_private {
            return Ok(url);
        }

        match url.host() {
            None => Err(DeployError::EgressBlocked(format!("{raw} has no host"))),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if domain == "localhost" || domain.ends_with(".localhost") {
                    Err(DeployError::EgressBlocked(format!("{domain} is local")))
                } else {
                    Ok(url)
                }
            }
            Some(Host::Ipv4(ip)) => reject_internal(IpAddr::V4(ip)).map(|()| url),
            Some(Host::Ipv6(ip)) => reject_internal(IpAddr::V6(ip)).map(|()| url),
        }
    }
}

impl EgressPolicy {
    /// Redirect policy for HTTP clients that applies [`check`](Self::check)
    /// to every hop.
    #[must_use]
    pub fn redirect_policy(self) -> reqwest::redirect::Policy {
        reqwest::redirect::Policy::custom(move |attempt| {
            if let Err(e) = self.check(attempt.url().as_str()) {
                attempt.error(e.to_string())
            } else if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else {
                attempt.follow()
            }
        })
    }
}

impl From<EgressConfig> for EgressPolicy {
    fn from(config: EgressConfig) -> Self {
        Self {
            allow_private: config.allow_private,
        }
    }
}

fn reject_internal(ip: IpAddr) -> DeployResult<()> {
    if is_internal(ip) {
        Err(DeployError::EgressBlocked(format!("{ip} is an internal address")))
    } else {
        Ok(())
    }
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or_else(|| is_internal_v6(v6), is_internal_v4),
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..128).contains(&b))
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}
