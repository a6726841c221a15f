//! Fixed size limits shared by both ends of a control connection.
//!
//! These are protocol constants, not tunables: a peer that accepts more than
//! the values below can be wedged by a peer that sends less conservatively,
//! so every limit is enforced at the decoding boundary.

/// Maximum frame payload size in bytes (10 MiB).
///
/// A declared length above this is rejected before any allocation happens.
pub const MAX_FRAME_PAYLOAD: u32 = 10 * 1024 * 1024;

/// Maximum HTTP body size carried through a tunnel (10 MiB).
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Maximum aggregate size of all header names and values (16 KiB).
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Maximum size of a single header value (8 KiB).
pub const MAX_HEADER_VALUE_BYTES: usize = 8 * 1024;

/// Maximum number of headers on a forwarded request.
pub const MAX_HEADER_COUNT: usize = 100;

/// Maximum request path length in bytes (2 KiB).
pub const MAX_PATH_BYTES: usize = 2 * 1024;

/// Minimum subdomain label length.
pub const MIN_SUBDOMAIN_LEN: usize = 3;

/// Maximum subdomain label length (DNS label limit).
pub const MAX_SUBDOMAIN_LEN: usize = 63;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_payload_limit_is_ten_mebibytes() {
        assert_eq!(MAX_FRAME_PAYLOAD, 10_485_760);
    }

    #[test]
    fn subdomain_bounds_match_dns_label_rules() {
        assert_eq!(MIN_SUBDOMAIN_LEN, 3);
        assert_eq!(MAX_SUBDOMAIN_LEN, 63);
    }
}
