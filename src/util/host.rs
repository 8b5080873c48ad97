use std::fs;

/// Local hostname, lowercased. Falls back to `localhost` when neither the
/// kernel nor `/etc/hostname` can tell.
pub fn local_hostname() -> String {
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(text) = fs::read_to_string(path) {
            let name = text.trim();
            if !name.is_empty() {
                return name.to_ascii_lowercase();
            }
        }
    }
    "localhost".to_string()
}

/// Lock marker content: `<lowercased-hostname>-<pid>`.
pub fn lock_identity(hostname: &str, pid: u32) -> String {
    format!("{}-{}", hostname.to_ascii_lowercase(), pid)
}

pub fn current_lock_identity() -> String {
    lock_identity(&local_hostname(), std::process::id())
}

pub fn is_local_host(hostname: &str) -> bool {
    let hostname = hostname.to_ascii_lowercase();
    hostname.contains("localhost") || hostname.contains("127.0.0.1") || hostname == local_hostname()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_lowercased() {
        assert_eq!(lock_identity("PVE01", 4242), "pve01-4242");
    }

    #[test]
    fn localhost_is_local() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("127.0.0.1"));
    }
}
