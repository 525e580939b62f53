use std::borrow::Cow;

use crate::overlay::PeerId;

/// Listen address that means "mount as an overlay protocol handler" instead
/// of binding a local socket. Only the exact marker is accepted; sub-paths
/// like `peer/x` are rejected by the admin surface.
pub const OVERLAY_MARKER: &str = "peer";

const PEER_SCHEME: &str = "peer:";

/// Normalize a bind/listen address.
///
/// Docs and configs commonly use the shorthand `":PORT"` to mean "bind on
/// all interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs do not
/// accept `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Render a peer identity as an overlay address string.
pub fn peer_addr(id: &PeerId) -> String {
    format!("{PEER_SCHEME}{id}")
}

/// Parse a target peer address. Accepts both `peer:<id>` and a bare `<id>`.
pub fn parse_peer_addr(s: &str) -> Option<PeerId> {
    let s = s.trim();
    if s == OVERLAY_MARKER {
        return None;
    }
    let id = s.strip_prefix(PEER_SCHEME).unwrap_or(s);
    if id.is_empty() {
        return None;
    }
    Some(PeerId::new(id))
}

/// Whether a target address points back into the overlay (used to reject
/// protocol-to-protocol chaining on remote forwards).
pub fn is_overlay_target(s: &str) -> bool {
    let s = s.trim();
    s == OVERLAY_MARKER || s.starts_with(PEER_SCHEME)
}

/// Whether a listen address expresses overlay-handler intent, including
/// malformed sub-path forms that must be rejected.
pub fn wants_overlay_listener(s: &str) -> bool {
    let s = s.trim();
    s == OVERLAY_MARKER || s.starts_with("peer/") || s.starts_with(PEER_SCHEME)
}
