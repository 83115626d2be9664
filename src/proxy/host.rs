//! Host table construction.
//!
//! A [`Host`] binds one public domain to the service behind it. The table is
//! rebuilt from the store every refresh cycle and published together with
//! the backend pools.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ipnet::IpNet;

use crate::error::GatewayError;
use crate::store::{Authority, ClientCertificate, Domain, Node, Service, Store};

pub struct Host {
    pub service: Service,
    pub domain: Domain,
    pub whitelist_networks: Vec<IpNet>,
    pub client_authority: Option<Authority>,
    pub client_certificate: Option<ClientCertificate>,
    whitelist_disabled: AtomicBool,
}

impl Host {
    pub fn new(
        service: Service,
        domain: Domain,
        whitelist_networks: Vec<IpNet>,
        client_authority: Option<Authority>,
        client_certificate: Option<ClientCertificate>,
    ) -> Self {
        Self {
            service,
            domain,
            whitelist_networks,
            client_authority,
            client_certificate,
            whitelist_disabled: AtomicBool::new(false),
        }
    }

    /// Networks are configured and have not been disabled.
    pub fn whitelist_active(&self) -> bool {
        !self.whitelist_networks.is_empty() && !self.whitelist_disabled.load(Ordering::Acquire)
    }

    /// Stop honoring whitelist networks for the rest of this generation.
    pub fn disable_whitelist(&self) {
        self.whitelist_disabled.store(true, Ordering::Release);
    }

    pub fn whitelisted(&self, ip: IpAddr) -> bool {
        self.whitelist_active() && self.whitelist_networks.iter().any(|n| n.contains(&ip))
    }
}

/// Second-factor origin data derived from every node and service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origins {
    pub app_id: String,
    pub facets: Vec<String>,
}

pub struct HostTable {
    /// Keyed by lowercase domain.
    pub hosts: HashMap<String, Arc<Host>>,
    pub origins: Origins,
}

/// Build the host table for `node`.
///
/// Bad whitelist entries and missing authorities degrade the affected host;
/// any other store error fails the whole rebuild.
pub async fn rebuild(store: &dyn Store, node: &Node) -> Result<HostTable, GatewayError> {
    let nodes = store.nodes().await?;
    let services = store.services().await?;

    let mut facets = Vec::new();
    for nde in &nodes {
        if !nde.user_domain.is_empty() {
            facets.push(format!("https://{}", nde.user_domain));
        }
        if !nde.management_domain.is_empty() {
            facets.push(format!("https://{}", nde.management_domain));
        }
    }

    let app_domain = std::iter::once(node.user_domain.as_str())
        .chain(nodes.iter().map(|n| n.user_domain.as_str()))
        .chain(nodes.iter().map(|n| n.management_domain.as_str()))
        .find(|d| !d.is_empty());
    let app_id = app_domain
        .map(|d| format!("https://{}/auth/u2f/app.json", d))
        .unwrap_or_default();

    let mut hosts = HashMap::new();
    for srvc in services {
        for domain in &srvc.domains {
            facets.push(format!("https://{}", domain.domain));
        }

        if !node.services.contains(&srvc.id) {
            continue;
        }

        let networks = parse_networks(&srvc.whitelist_networks);

        let authority = match &srvc.client_authority {
            Some(id) => match store.authority(id).await {
                Ok(authority) => Some(authority),
                Err(e) if e.is_not_found() => {
                    tracing::warn!(
                        service_id = %srvc.id,
                        client_authority_id = %id,
                        "Service client authority not found"
                    );
                    None
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        for domain in &srvc.domains {
            let certificate = match &authority {
                Some(authority) => Some(store.issue_client_certificate(authority).await?),
                None => None,
            };

            let host = Host::new(
                srvc.clone(),
                domain.clone(),
                networks.clone(),
                authority.clone(),
                certificate,
            );
            hosts.insert(domain.domain.to_lowercase(), Arc::new(host));
        }
    }

    Ok(HostTable {
        hosts,
        origins: Origins { app_id, facets },
    })
}

/// Parse CIDRs, accepting bare addresses as host networks. Bad entries are
/// logged and skipped.
fn parse_networks(entries: &[String]) -> Vec<IpNet> {
    entries
        .iter()
        .filter_map(|entry| {
            let entry = entry.trim();
            match entry.parse::<IpNet>() {
                Ok(net) => Some(net.trunc()),
                Err(e) => match entry.parse::<IpAddr>() {
                    Ok(ip) => Some(IpNet::from(ip)),
                    Err(_) => {
                        tracing::error!(network = %entry, error = %e, "Invalid whitelist network");
                        None
                    }
                },
            }
        })
        .collect()
}
