//! Host and process fingerprint.
//!
//! Gathers identifiers that distinguish (not identify) the machine, the
//! container, and this process, grouped by how long they live: persistent,
//! semi-persistent, semi-volatile, and volatile. Each tier is hashed with
//! SHA-512 and the four hex digests compose the opaque `id=` token sent on
//! `/rec` requests. The server may use it for rate-limiting, audit, or
//! policy; we attach no semantics to it.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha512};

const ITEM_SEPARATOR: &str = "::";
const TIER_SEPARATOR: &str = "~~";

#[derive(Clone, Debug, Default)]
pub struct Composition {
    persistent: String,
    semi_persistent: String,
    semi_volatile: String,
    volatile: String,
}

impl Composition {
    pub fn collect() -> Self {
        let mut composition = Self::default();

        push_item(&mut composition.persistent, read_all("/etc/machine-id"));

        push_item(&mut composition.semi_persistent, read_all("/etc/hostname"));

        push_item(&mut composition.semi_volatile, read_all("/etc/hostname"));
        let cgroup_ns = read_symlink("/proc/self/ns/cgroup");
        if cgroup_ns.is_empty() {
            // No cgroup namespace; the flat /proc view still distinguishes us
            push_item(&mut composition.semi_volatile, read_all("/proc/self/cgroup"));
        } else {
            push_item(&mut composition.semi_volatile, cgroup_ns);
        }
        for name in ["ca.crt", "namespace", "token"] {
            let path = format!("/var/run/secrets/kubernetes.io/serviceaccount/{name}");
            push_item(&mut composition.semi_volatile, read_symlink(&path));
        }

        composition.volatile = process_identity();

        composition
    }

    /// `persistent ~~ semi_persistent ~~ semi_volatile ~~ volatile`, each a
    /// SHA-512 hex digest.
    pub fn composed_hash(&self) -> String {
        [
            self.persistent_hash(),
            self.semi_persistent_hash(),
            self.semi_volatile_hash(),
            self.volatile_hash(),
        ]
        .join(TIER_SEPARATOR)
    }

    pub fn persistent_hash(&self) -> String {
        hash_tier(&self.persistent)
    }

    pub fn semi_persistent_hash(&self) -> String {
        hash_tier(&self.semi_persistent)
    }

    pub fn semi_volatile_hash(&self) -> String {
        hash_tier(&self.semi_volatile)
    }

    pub fn volatile_hash(&self) -> String {
        hash_tier(&self.volatile)
    }

    pub fn print_info(&self) {
        log::info!("basic process information");
        log::info!("\tPID                 {}", unsafe { libc::getpid() });
        log::info!("\tParent PID          {}", unsafe { libc::getppid() });
        log::info!("\tUser ID             {}", unsafe { libc::getuid() });
        log::info!("\tEffective user ID   {}", unsafe { libc::geteuid() });
        log::info!("\tGroup ID            {}", unsafe { libc::getgid() });
        log::info!("\tEffective group ID  {}", unsafe { libc::getegid() });
    }
}

fn hash_tier(data: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

fn push_item(tier: &mut String, item: String) {
    if item.is_empty() {
        return;
    }
    if !tier.is_empty() {
        tier.push_str(ITEM_SEPARATOR);
    }
    tier.push_str(&item);
}

/// Missing or unreadable files contribute nothing; never fatal.
fn read_all(path: impl AsRef<Path>) -> String {
    fs::read_to_string(path)
        .map(|data| data.trim_end_matches('\n').to_owned())
        .unwrap_or_default()
}

fn read_symlink(path: impl AsRef<Path>) -> String {
    fs::read_link(path)
        .map(|target| target.display().to_string())
        .unwrap_or_default()
}

fn process_identity() -> String {
    let exe = fs::canonicalize("/proc/self/exe")
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    let start_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();

    // Real and effective ids, pids, the canonical executable and a start
    // timestamp; stable for the life of the process.
    unsafe {
        format!(
            "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{exe}{sep}{start_ns}",
            libc::getuid(),
            libc::geteuid(),
            libc::getgid(),
            libc::getegid(),
            libc::getpid(),
            libc::getppid(),
            sep = ITEM_SEPARATOR,
        )
    }
}
