//! Identifier validation and address parsing
//!
//! Message-IDs are the primary key across the daemon: they name blob files on disk
//! and rows in the index, so the validator also rejects anything that could escape
//! the blob directory (`/`, `..`).

use crate::error::{NntpdError, Result};

/// Check a Message-ID against the `<local@domain>` shape
///
/// Requirements:
/// - wrapped in exactly one pair of angle brackets,
/// - no `<`, `>`, or space inside,
/// - exactly one `@` with at least one character on each side,
/// - no `@@`, no `/`, no `..` anywhere.
pub fn is_valid_message_id(id: &str) -> bool {
    if id.len() < 5 || !id.starts_with('<') || !id.ends_with('>') {
        return false;
    }
    let inner = &id[1..id.len() - 1];
    if inner.contains('<') || inner.contains('>') || inner.contains(' ') {
        return false;
    }
    if id.contains("@@") || id.contains('/') || id.contains("..") {
        return false;
    }
    match inner.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !domain.contains('@')
        }
        None => false,
    }
}

/// Parse `host:port` or `[ipv6]:port` into `(host, port)`
///
/// IPv6 hosts keep their brackets, matching the feed section naming in the
/// feeds config.
pub fn parse_addr(addr: &str) -> Result<(String, u16)> {
    let addr = addr.trim();
    let (host, port) = if addr.starts_with('[') {
        let idx = addr
            .find("]:")
            .ok_or_else(|| NntpdError::Config(format!("bad address: {}", addr)))?;
        (&addr[..idx + 1], &addr[idx + 2..])
    } else {
        let idx = addr
            .rfind(':')
            .ok_or_else(|| NntpdError::Config(format!("bad address: {}", addr)))?;
        (&addr[..idx], &addr[idx + 1..])
    };
    if host.is_empty() {
        return Err(NntpdError::Config(format!("bad address: {}", addr)));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| NntpdError::Config(format!("bad port in address: {}", addr)))?;
    Ok((host.to_string(), port))
}

/// Strip the brackets a parsed IPv6 host keeps, for dialing
pub fn dial_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Sanitize a filename so it cannot traverse out of a directory
pub fn sanitize_filename(fname: &str) -> String {
    fname.replace('.', "_").replace('/', "_")
}
