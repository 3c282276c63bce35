//! Machine identity for key derivation.
//!
//! The identity string is built from stable hardware/OS facts: hostname,
//! platform, architecture, the first CPU model, and the sorted set of
//! non-internal MAC addresses. The primary variant also mixes in the
//! username; the fallback omits it so that decryption survives a user
//! account rename.

use std::path::Path;

/// Components of the machine-bound identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentity {
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    pub cpu_model: String,
    /// Sorted, lowercase, non-internal MAC addresses.
    pub macs: Vec<String>,
    pub username: Option<String>,
}

impl MachineIdentity {
    /// Collect the identity from the running system.
    pub fn collect() -> Self {
        MachineIdentity {
            hostname: read_hostname(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_model: read_cpu_model(),
            macs: read_macs(),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok(),
        }
    }

    /// Primary derivation password: includes the username when known.
    pub fn primary_password(&self) -> String {
        let mut parts = self.stable_parts();
        if let Some(user) = &self.username {
            parts.push(user.clone());
        }
        parts.join("|")
    }

    /// Stable fallback password: identity without the username.
    ///
    /// Tried second on decrypt so stores survive account migration.
    pub fn fallback_password(&self) -> String {
        self.stable_parts().join("|")
    }

    fn stable_parts(&self) -> Vec<String> {
        vec![
            self.hostname.clone(),
            self.platform.clone(),
            self.arch.clone(),
            self.cpu_model.clone(),
            self.macs.join(","),
        ]
    }
}

fn read_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    "unknown-host".to_string()
}

fn read_cpu_model() -> String {
    if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
        for line in cpuinfo.lines() {
            if let Some(rest) = line.strip_prefix("model name") {
                if let Some(model) = rest.split(':').nth(1) {
                    return model.trim().to_string();
                }
            }
        }
    }
    "unknown-cpu".to_string()
}

fn read_macs() -> Vec<String> {
    let mut macs = Vec::new();
    let net = Path::new("/sys/class/net");
    let Ok(entries) = std::fs::read_dir(net) else {
        return macs;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "lo" {
            continue;
        }
        if let Ok(addr) = std::fs::read_to_string(entry.path().join("address")) {
            let addr = addr.trim().to_lowercase();
            if !addr.is_empty() && addr != "00:00:00:00:00:00" {
                macs.push(addr);
            }
        }
    }
    macs.sort();
    macs.dedup();
    macs
}
