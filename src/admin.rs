//! Administrative surface over [`Mounts`]: open tunnels from address
//! strings, list and close listeners and streams. This is the contract the
//! CLI/daemon layer of an embedding application programs against.

use std::sync::Arc;

use crate::error::AdminError;
use crate::mount::{Listener, ListenerInfo, Mounts, StreamInfo};
use crate::net;

/// Open a tunnel from user-supplied address strings.
///
/// A listen address that is exactly the overlay marker (`peer`) mounts a
/// remote forward: the node becomes the overlay handler for `protocol` and
/// forwards incoming streams to `target`. Any other listen address mounts a
/// local forward toward the peer named by `target`.
pub async fn forward(
    mounts: &Mounts,
    protocol: &str,
    listen: &str,
    target: &str,
) -> Result<Arc<dyn Listener>, AdminError> {
    let protocol = protocol.trim();
    if protocol.is_empty() {
        return Err(AdminError::EmptyProtocol);
    }
    let listen = listen.trim();
    let target = target.trim();

    if net::wants_overlay_listener(listen) {
        if listen != net::OVERLAY_MARKER {
            return Err(AdminError::BadListenAddress(listen.to_string()));
        }
        if net::is_overlay_target(target) {
            return Err(AdminError::ProtocolChain);
        }
        Ok(mounts.forward_remote(protocol, target).await?)
    } else {
        let peer = net::parse_peer_addr(target)
            .ok_or_else(|| AdminError::BadTargetAddress(target.to_string()))?;
        Ok(mounts.forward_local(peer, protocol, listen).await?)
    }
}

/// Snapshot of the open listeners.
pub fn list_listeners(mounts: &Mounts) -> Vec<ListenerInfo> {
    mounts
        .listeners()
        .list()
        .iter()
        .map(|l| ListenerInfo {
            protocol: l.protocol().to_string(),
            listen_address: l.listen_address(),
            target_address: l.target_address(),
        })
        .collect()
}

/// Snapshot of the live streams, in handle order.
pub fn list_streams(mounts: &Mounts) -> Vec<StreamInfo> {
    mounts.streams().list().iter().map(|s| s.info()).collect()
}

/// Match criteria for [`close_listeners`]. Set fields combine with AND.
#[derive(Debug, Clone, Default)]
pub struct CloseMatch {
    pub protocol: Option<String>,
    pub listen_address: Option<String>,
    pub target_address: Option<String>,
    pub all: bool,
}

/// Close every listener matching the criteria; returns the count closed.
/// Closing with no criteria at all is refused.
pub async fn close_listeners(mounts: &Mounts, m: CloseMatch) -> Result<usize, AdminError> {
    if !m.all
        && m.protocol.is_none()
        && m.listen_address.is_none()
        && m.target_address.is_none()
    {
        return Err(AdminError::EmptyMatch);
    }

    let mut closed = 0;
    for l in mounts.listeners().list() {
        let keep = !m.all
            && (m.protocol.as_deref().is_some_and(|p| p != l.protocol())
                || m.listen_address
                    .as_deref()
                    .is_some_and(|a| a != l.listen_address())
                || m.target_address
                    .as_deref()
                    .is_some_and(|a| a != l.target_address()));
        if keep {
            continue;
        }
        l.close().await;
        closed += 1;
    }
    Ok(closed)
}

/// Reset the stream with the given handle.
pub fn close_stream(mounts: &Mounts, handle: u64) -> Result<(), AdminError> {
    let stream = mounts
        .streams()
        .get(handle)
        .ok_or(AdminError::StreamNotFound(handle))?;
    stream.reset();
    Ok(())
}

/// Reset every live stream; returns the count closed.
pub fn close_all_streams(mounts: &Mounts) -> usize {
    let streams = mounts.streams().list();
    for s in &streams {
        s.reset();
    }
    streams.len()
}

/// Render listeners as an aligned text table, optionally with a header row.
pub fn render_listeners(listeners: &[ListenerInfo], headers: bool) -> String {
    let mut rows: Vec<[String; 3]> = Vec::new();
    if headers {
        rows.push([
            "Protocol".to_string(),
            "Listen Address".to_string(),
            "Target Address".to_string(),
        ]);
    }
    for l in listeners {
        rows.push([
            l.protocol.clone(),
            l.listen_address.clone(),
            l.target_address.clone(),
        ]);
    }
    render_table(&rows)
}

/// Render streams as an aligned text table, optionally with a header row.
pub fn render_streams(streams: &[StreamInfo], headers: bool) -> String {
    let mut rows: Vec<[String; 4]> = Vec::new();
    if headers {
        rows.push([
            "Handle".to_string(),
            "Protocol".to_string(),
            "Origin".to_string(),
            "Target".to_string(),
        ]);
    }
    for s in streams {
        rows.push([
            s.handle.to_string(),
            s.protocol.clone(),
            s.origin_address.clone(),
            s.target_address.clone(),
        ]);
    }
    render_table(&rows)
}

fn render_table<const N: usize>(rows: &[[String; N]]) -> String {
    let mut widths = [0usize; N];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut out = String::new();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i + 1 == N {
                out.push_str(cell);
            } else {
                out.push_str(&format!("{cell:<width$}  ", width = widths[i]));
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountOptions;
    use crate::overlay::memory::MemoryNet;

    fn mounts() -> Mounts {
        Mounts::new(MemoryNet::new().host("local"), MountOptions::default())
    }

    #[tokio::test]
    async fn forward_dispatches_on_overlay_marker() {
        let m = mounts();

        forward(&m, "echo", "peer", "127.0.0.1:9999").await.unwrap();
        let ls = list_listeners(&m);
        assert_eq!(ls.len(), 1);
        assert_eq!(ls[0].protocol, "echo");
        assert_eq!(ls[0].listen_address, "peer:local");
        assert_eq!(ls[0].target_address, "127.0.0.1:9999");
    }

    #[tokio::test]
    async fn forward_rejects_marker_subpath() {
        let m = mounts();
        let err = forward(&m, "echo", "peer/extra", "127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::BadListenAddress(_)));
    }

    #[tokio::test]
    async fn forward_rejects_protocol_chaining() {
        let m = mounts();
        let err = forward(&m, "echo", "peer", "peer:other").await.unwrap_err();
        assert!(matches!(err, AdminError::ProtocolChain));
    }

    #[tokio::test]
    async fn forward_rejects_empty_protocol() {
        let m = mounts();
        let err = forward(&m, "  ", "peer", "127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, AdminError::EmptyProtocol));
    }

    #[tokio::test]
    async fn forward_local_requires_a_peer_target() {
        let m = mounts();
        let err = forward(&m, "echo", "127.0.0.1:0", "").await.unwrap_err();
        assert!(matches!(err, AdminError::BadTargetAddress(_)));

        forward(&m, "echo", "127.0.0.1:0", "peer:remote")
            .await
            .unwrap();
        let ls = list_listeners(&m);
        assert_eq!(ls[0].target_address, "peer:remote");
    }

    #[tokio::test]
    async fn close_listeners_matches_and_counts() {
        let m = mounts();
        forward(&m, "one", "peer", "127.0.0.1:1").await.unwrap();
        forward(&m, "two", "peer", "127.0.0.1:2").await.unwrap();

        let err = close_listeners(&m, CloseMatch::default()).await.unwrap_err();
        assert!(matches!(err, AdminError::EmptyMatch));

        let n = close_listeners(
            &m,
            CloseMatch {
                protocol: Some("one".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(list_listeners(&m).len(), 1);

        let n = close_listeners(
            &m,
            CloseMatch {
                all: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(n, 1);
        assert!(list_listeners(&m).is_empty());
    }

    #[tokio::test]
    async fn close_stream_not_found() {
        let m = mounts();
        let err = close_stream(&m, 42).unwrap_err();
        assert!(matches!(err, AdminError::StreamNotFound(42)));
        assert_eq!(close_all_streams(&m), 0);
    }

    #[test]
    fn tables_align_and_honor_headers() {
        let listeners = vec![
            ListenerInfo {
                protocol: "echo".into(),
                listen_address: "127.0.0.1:4567".into(),
                target_address: "peer:QmPeer".into(),
            },
            ListenerInfo {
                protocol: "db".into(),
                listen_address: "peer:local".into(),
                target_address: "127.0.0.1:5432".into(),
            },
        ];

        let plain = render_listeners(&listeners, false);
        assert_eq!(plain.lines().count(), 2);
        assert!(plain.contains("echo"));

        let with_headers = render_listeners(&listeners, true);
        assert_eq!(with_headers.lines().count(), 3);
        assert!(with_headers.starts_with("Protocol"));

        // Columns line up: the second column starts at the same offset in
        // every row ("Protocol" is the widest first-column cell).
        let lines: Vec<&str> = with_headers.lines().collect();
        assert!(lines[0][10..].starts_with("Listen Address"));
        assert!(lines[1][10..].starts_with("127.0.0.1:4567"));
        assert!(lines[2][10..].starts_with("peer:local"));
    }
}
