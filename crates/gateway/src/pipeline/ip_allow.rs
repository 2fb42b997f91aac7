//! Client address allow list.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use super::{AdmissionContext, Verdict};
use crate::{api::ApiSpec, error::RejectionReason};

/// Rejects clients outside the API's allowed addresses.
///
/// Entries are CIDR ranges or single addresses. Unparseable entries are
/// logged and ignored. An enabled list with no valid entry admits nobody.
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    enabled: bool,
    networks: Vec<IpNet>,
}

impl IpAllowList {
    /// The allow list configured on `spec`.
    #[must_use]
    pub fn from_spec(spec: &ApiSpec) -> Self {
        if spec.enable_ip_whitelisting {
            Self::new(&spec.allowed_ips)
        } else {
            Self::default()
        }
    }

    /// An enabled list of `entries`.
    #[must_use]
    pub fn new(entries: &[String]) -> Self {
        let networks = entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.trim();
                match entry.parse::<IpNet>() {
                    Ok(net) => Some(net),
                    Err(_) => match entry.parse::<IpAddr>() {
                        Ok(IpAddr::V4(v4)) => Ipv4Net::new(v4, 32).ok().map(IpNet::V4),
                        Ok(IpAddr::V6(v6)) => Ipv6Net::new(v6, 128).ok().map(IpNet::V6),
                        Err(_) => {
                            tracing::warn!(entry, "ignoring invalid allow list entry");
                            None
                        },
                    },
                }
            })
            .collect();
        Self { enabled: true, networks }
    }

    /// Whether the list is enforced.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `ip` may call the API.
    #[must_use]
    pub fn allows(&self, ip: IpAddr) -> bool {
        !self.enabled || self.networks.iter().any(|net| net.contains(&ip))
    }

    pub(crate) fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Verdict {
        if !self.enabled {
            return Verdict::Continue;
        }
        match ctx.request.client_ip() {
            Some(ip) if self.allows(ip) => Verdict::Continue,
            client => {
                tracing::info!(client = ?client, "request from address outside allow list");
                Verdict::reject(RejectionReason::IpBlocked)
            },
        }
    }
}
