//! Deterministic network device names.
//!
//! Every device belonging to a silo carries the silo's 8-hex-char ID, so
//! leaked devices can always be traced back (and `ip link` output stays
//! greppable). Kernel interface names are capped at 15 bytes (IFNAMSIZ-1);
//! the longest name produced here is `v{i}-{8 hex}h` at 12 bytes for a
//! single-digit index.

/// Name of the per-silo bridge for interface `index`.
pub fn bridge_name(index: usize, id_hex: &str) -> String {
    format!("b{}-{}", index, id_hex)
}

/// Shared prefix of a veth pair for interface `index`.
pub fn veth_prefix(index: usize, id_hex: &str) -> String {
    format!("v{}-{}", index, id_hex)
}

/// Host-side veth device name for interface `index`.
pub fn host_veth_name(index: usize, id_hex: &str) -> String {
    format!("{}h", veth_prefix(index, id_hex))
}

/// Silo-side veth device name for interface `index`.
pub fn silo_veth_name(index: usize, id_hex: &str) -> String {
    format!("{}s", veth_prefix(index, id_hex))
}

/// Strip characters that would corrupt a space- or line-delimited record.
pub fn sanitize_token(s: &str) -> String {
    s.chars().filter(|c| *c != ' ' && *c != '\n' && *c != '\r').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_names() {
        assert_eq!(bridge_name(0, "deadbeef"), "b0-deadbeef");
        assert_eq!(host_veth_name(0, "deadbeef"), "v0-deadbeefh");
        assert_eq!(silo_veth_name(0, "deadbeef"), "v0-deadbeefs");
    }

    #[test]
    fn test_names_fit_ifnamsiz() {
        for name in [
            bridge_name(9, "01234567"),
            host_veth_name(9, "01234567"),
            silo_veth_name(9, "01234567"),
        ] {
            assert!(name.len() <= 15, "{} exceeds IFNAMSIZ-1", name);
        }
    }

    #[test]
    fn test_sanitize_token() {
        assert_eq!(sanitize_token("evil name\nwith lines"), "evilnamewithlines");
        assert_eq!(sanitize_token("clean"), "clean");
    }
}
