use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Derives a stable per-host identifier from whatever host signals are
/// available (hostname, OS, CPU count). There's no portable OS-level
/// fingerprint to draw on across platforms, so this falls back to
/// `std::env` signals that are unambiguous everywhere.
pub fn device_id() -> String {
    let mut hasher = DefaultHasher::new();
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
        .hash(&mut hasher);
    std::env::consts::OS.hash(&mut hasher);
    std::env::consts::ARCH.hash(&mut hasher);
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Generates a fresh session identifier, scoping a single run of the engine.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_stable_across_calls() {
        assert_eq!(device_id(), device_id());
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }
}
