//! Deterministic names for the OS objects backing one SHM connection.
//!
//! POSIX has tight limits on shm/sem name length (macOS in particular), so
//! the identifiers stay short:
//! - `hash8`: FNV-1a of the sanitized bus name, stable per bus
//! - `conn8`: the first 8 hex digits of the per-connection id
//!
//! One segment and four counting semaphores hang off the
//! `d<hash8><conn8>` prefix; the rendezvous socket only depends on the bus
//! name so dialers can find the listener.

use std::path::PathBuf;

/// Length of a connection id: 16 lowercase hex digits.
pub const CONN_ID_LEN: usize = 16;

/// Connection id used by the listener side when deriving the rendezvous
/// path (the per-connection parts are unused there).
pub const LISTENER_CONN_ID: &str = "0000000000000000";

/// Keep alphanumerics and `_`; everything else becomes `_`. An empty result
/// falls back to `"duct"`.
pub fn sanitize_name(s: &str) -> String {
    let mut out: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() {
        out.push_str("duct");
    }
    out
}

/// 32-bit FNV-1a.
pub fn fnv1a_32(s: &str) -> u32 {
    let mut h: u32 = 2_166_136_261;
    for b in s.bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(16_777_619);
    }
    h
}

/// A fresh random connection id.
pub fn random_conn_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// True for a well-formed 16-digit lowercase hex connection id.
pub fn is_valid_conn_id(s: &str) -> bool {
    s.len() == CONN_ID_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// All derived names for one connection on one bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNames {
    /// Sanitized bus name.
    pub base: String,
    /// 16-hex-digit connection id.
    pub conn_id: String,
    /// `shm_open` name (starts with '/').
    pub segment: String,
    /// `sem_open` names (start with '/').
    pub c2s_items: String,
    pub c2s_spaces: String,
    pub s2c_items: String,
    pub s2c_spaces: String,
    /// Filesystem path of the rendezvous unix socket.
    pub rendezvous: PathBuf,
}

impl ShmNames {
    pub fn derive(bus_name: &str, conn_id: &str) -> ShmNames {
        let base = sanitize_name(bus_name);
        let hash8 = format!("{:08x}", fnv1a_32(&base));
        let conn8 = &conn_id[..conn_id.len().min(8)];
        let prefix = format!("d{hash8}{conn8}");

        ShmNames {
            base,
            conn_id: conn_id.to_string(),
            segment: format!("/{prefix}m"),
            c2s_items: format!("/{prefix}a"),
            c2s_spaces: format!("/{prefix}b"),
            s2c_items: format!("/{prefix}c"),
            s2c_spaces: format!("/{prefix}d"),
            rendezvous: PathBuf::from(format!("/tmp/duct_shm_{hash8}.sock")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_word_chars() {
        assert_eq!(sanitize_name("my_bus01"), "my_bus01");
        assert_eq!(sanitize_name("my-bus.01"), "my_bus_01");
        assert_eq!(sanitize_name(""), "duct");
    }

    #[test]
    fn fnv1a_reference_vectors() {
        // Offset basis and the classic "a" vector.
        assert_eq!(fnv1a_32(""), 0x811c_9dc5);
        assert_eq!(fnv1a_32("a"), 0xe40c_292c);
    }

    #[test]
    fn names_are_stable_and_short() {
        let n = ShmNames::derive("testbus", "0123456789abcdef");
        assert_eq!(n, ShmNames::derive("testbus", "0123456789abcdef"));
        assert_eq!(n.segment, format!("/d{:08x}01234567m", fnv1a_32("testbus")));
        for name in [&n.segment, &n.c2s_items, &n.c2s_spaces, &n.s2c_items, &n.s2c_spaces] {
            assert!(name.starts_with('/'));
            // POSIX requires shm/sem names to fit well under NAME_MAX; macOS
            // caps sem names around 30 chars.
            assert!(name.len() <= 19, "{name}");
        }
    }

    #[test]
    fn rendezvous_depends_only_on_bus() {
        let a = ShmNames::derive("bus", "aaaaaaaaaaaaaaaa");
        let b = ShmNames::derive("bus", "bbbbbbbbbbbbbbbb");
        assert_eq!(a.rendezvous, b.rendezvous);
        assert_ne!(a.segment, b.segment);
    }

    #[test]
    fn conn_id_generation_and_validation() {
        let id = random_conn_id();
        assert_eq!(id.len(), CONN_ID_LEN);
        assert!(is_valid_conn_id(&id));
        assert!(is_valid_conn_id("0123456789abcdef"));
        assert!(!is_valid_conn_id("0123456789ABCDEF"));
        assert!(!is_valid_conn_id("short"));
        assert!(!is_valid_conn_id("ghghghghghghghgh"));
    }
}
