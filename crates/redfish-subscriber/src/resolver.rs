//! Cached host name resolution.
//!
//! The relay prefers component xnames (the site convention: names beginning
//! with `x`) when a host resolves to more than one name. Lookups go through
//! the system name service once per key and are memoized for the process
//! lifetime. Resolution never fails loudly: anything that cannot be resolved
//! comes back unchanged.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use tracing::{debug, trace};

/// Process-lifetime memoized forward/reverse resolver.
///
/// Safe for concurrent readers. The first writer wins for any given key;
/// duplicated lookups during a race are acceptable and cheaper than holding
/// the lock across a name-service call.
#[derive(Debug, Default)]
pub struct HostResolver {
    cache: RwLock<HashMap<String, String>>,
}

impl HostResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `host` (a name or address literal) to its preferred canonical
    /// name. Returns the input unchanged when the name service has nothing
    /// better to offer.
    pub fn resolve(&self, host: &str) -> String {
        if let Ok(cache) = self.cache.read() {
            if let Some(name) = cache.get(host) {
                return name.clone();
            }
        }

        let resolved = lookup(host).unwrap_or_else(|| host.to_string());
        trace!(host, resolved, "host lookup");

        if let Ok(mut cache) = self.cache.write() {
            // First writer wins; a racing lookup for the same key already
            // produced an equivalent answer.
            cache.entry(host.to_string()).or_insert_with(|| resolved.clone());
        }
        resolved
    }

    /// Resolve an already-parsed client address, as seen by the listener.
    pub fn resolve_addr(&self, addr: IpAddr) -> String {
        self.resolve(&addr.to_string())
    }
}

/// One pass through the name service: forward-resolve the input when it is a
/// name, then reverse-resolve each address and collect the candidate names.
fn lookup(host: &str) -> Option<String> {
    let addrs: Vec<IpAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => match dns_lookup::lookup_host(host) {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(host, error = %e, "forward lookup failed");
                return None;
            }
        },
    };

    let mut candidates = Vec::new();
    for addr in addrs {
        match dns_lookup::lookup_addr(&addr) {
            Ok(name) => {
                if !candidates.contains(&name) {
                    candidates.push(name);
                }
            }
            Err(e) => debug!(host, %addr, error = %e, "reverse lookup failed"),
        }
    }
    pick_name(&candidates)
}

/// Prefer the first xname (leading `x`), else the first candidate that is
/// not just an address literal echoed back.
fn pick_name(candidates: &[String]) -> Option<String> {
    if let Some(xname) = candidates.iter().find(|n| n.starts_with('x')) {
        return Some(xname.clone());
    }
    candidates
        .iter()
        .find(|n| n.parse::<IpAddr>().is_err())
        .or_else(|| candidates.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_name_prefers_xname() {
        let names = vec![
            "node12.mgmt".to_string(),
            "x9000c1s0b0".to_string(),
        ];
        assert_eq!(pick_name(&names).unwrap(), "x9000c1s0b0");
    }

    #[test]
    fn test_pick_name_skips_address_literals() {
        let names = vec!["10.1.2.3".to_string(), "node12.mgmt".to_string()];
        assert_eq!(pick_name(&names).unwrap(), "node12.mgmt");
    }

    #[test]
    fn test_pick_name_empty() {
        assert!(pick_name(&[]).is_none());
    }

    #[test]
    fn test_unresolvable_host_returned_unchanged() {
        let resolver = HostResolver::new();
        let garbage = "no-such-host.invalid.";
        assert_eq!(resolver.resolve(garbage), garbage);
    }

    #[test]
    fn test_cache_returns_same_answer() {
        let resolver = HostResolver::new();
        let first = resolver.resolve("127.0.0.1");
        let second = resolver.resolve("127.0.0.1");
        assert_eq!(first, second);
        assert_eq!(resolver.cache.read().unwrap().len(), 1);
    }
}
