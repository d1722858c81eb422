use crate::error::RelayError;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Policy applied to caller-supplied upstream targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamPolicy {
    /// Permit loopback, private and link-local destinations
    pub allow_private: bool,
}

impl UpstreamPolicy {
    pub fn new(allow_private: bool) -> Self {
        Self { allow_private }
    }

    /// Check that `target` is safe to fetch on a caller's behalf.
    ///
    /// IP literals are checked against blocked ranges. Hostnames other than
    /// `localhost` are accepted without DNS resolution, so DNS rebinding is
    /// not covered.
    ///
    /// # Errors
    /// [`RelayError::BlockedUpstream`] for non-HTTP(S) schemes, a missing host,
    /// or a private destination while `allow_private` is off.
    pub fn check(&self, target: &Url) -> Result<(), RelayError> {
        match target.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(RelayError::BlockedUpstream(format!(
                    "scheme '{scheme}' not allowed"
                )));
            }
        }

        let host = target
            .host()
            .ok_or_else(|| RelayError::BlockedUpstream(format!("no host in {target}")))?;

        if self.allow_private {
            return Ok(());
        }

        let blocked = match host {
            Host::Ipv4(ip) => is_blocked_ipv4(ip),
            Host::Ipv6(ip) => is_blocked_ipv6(ip),
            Host::Domain(name) => {
                let name = name.trim_end_matches('.').to_ascii_lowercase();
                name == "localhost" || name.ends_with(".localhost")
            }
        };

        if blocked {
            return Err(RelayError::BlockedUpstream(format!(
                "private or reserved destination not allowed: {host}"
            )));
        }
        Ok(())
    }
}

/// Private, loopback, link-local, unspecified and broadcast ranges
fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    ip.octets()[0] == 0
        || ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
}

fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xffc0) == 0xfe80 // fe80::/10 link-local
        || (first & 0xfe00) == 0xfc00 // fc00::/7 unique-local
}
