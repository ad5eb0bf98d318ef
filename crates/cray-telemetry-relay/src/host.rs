//! Hostname detection and cluster naming.
//!
//! The relay's identity matters twice: the `hosts` config section is keyed
//! by relay hostname, and every bus record carries the cluster name. Both
//! must be stable across restarts, so an explicit `RELAY_HOSTNAME` override
//! outranks everything (containerized relays rarely want the pod name),
//! and a lookup that comes up empty degrades to `"unknown"` rather than
//! refusing to start.

use std::env;

use tracing::warn;

/// Get this relay's hostname: `RELAY_HOSTNAME` override, then `HOSTNAME`,
/// then the kernel's idea of it.
#[must_use]
pub fn get_hostname() -> String {
    env_name("RELAY_HOSTNAME")
        .or_else(|| env_name("HOSTNAME"))
        .or_else(kernel_hostname)
        .unwrap_or_else(|| {
            warn!("no usable hostname; config matching and cluster tagging degrade to 'unknown'");
            "unknown".to_string()
        })
}

fn env_name(var: &str) -> Option<String> {
    env::var(var).ok().filter(|name| !name.is_empty())
}

fn kernel_hostname() -> Option<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| warn!(error = %e, "gethostname() failed"))
        .ok()?;
    name.into_string().ok().filter(|name| !name.is_empty())
}

/// Cluster name: the hostname with its domain and trailing digits stripped,
/// so `foo-sms02.mgmt.net` tags records as cluster `foo-sms`.
#[must_use]
pub fn cluster_name(hostname: &str) -> String {
    let short = hostname.split('.').next().unwrap_or(hostname);
    short.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
}

/// Names under which this relay may appear in the per-host configuration
/// sections: full hostname, short hostname, cluster name.
#[must_use]
pub fn local_names() -> Vec<String> {
    let hostname = get_hostname();
    let short = hostname.split('.').next().unwrap_or(&hostname).to_string();
    let cluster = cluster_name(&hostname);

    let mut names = vec![hostname];
    if !names.contains(&short) {
        names.push(short);
    }
    if !names.contains(&cluster) {
        names.push(cluster);
    }
    names
}
