//! Peer transport addresses as carried in marker payloads.

/// Length of a `AA:BB:CC:DD:EE:FF` address.
pub const ADDRESS_LEN: usize = 17;
/// Suffix a peer appends to its own address while it is braking.
pub const STOP_SUFFIX: &str = ":STOP";

/// Whether `payload` is a six-octet, colon-separated hex address.
pub fn is_peer_address(payload: &str) -> bool {
    if payload.len() != ADDRESS_LEN {
        return false;
    }
    let mut octets = 0;
    for octet in payload.split(':') {
        if octet.len() != 2 || !octet.bytes().all(|b| b.is_ascii_hexdigit()) {
            return false;
        }
        octets += 1;
    }
    octets == 6
}

/// Stop-marker payload for `address`.
pub fn stop_payload(address: &str) -> String {
    format!("{address}{STOP_SUFFIX}")
}

/// Base address of a stop-marker payload.
pub fn strip_stop(payload: &str) -> Option<&str> {
    payload.strip_suffix(STOP_SUFFIX)
}
