//! Peer capability set parsing (RFC 3977 Section 5.2)
//!
//! The outbound role probes a peer with CAPABILITIES and keys its behavior off
//! the result: STREAMING selects CHECK/TAKETHIS, otherwise IHAVE.

use std::collections::HashMap;

/// Capabilities advertised by a peer
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Capability name (uppercased) to its arguments
    capabilities: HashMap<String, Vec<String>>,
}

impl Capabilities {
    /// Parse capabilities from the multi-line CAPABILITIES response
    ///
    /// Each line is `CAPABILITY [arg1 arg2 ...]`; blank lines are skipped.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut capabilities = HashMap::new();
        for line in lines {
            let mut parts = line.as_ref().split_whitespace();
            let Some(name) = parts.next() else { continue };
            capabilities.insert(
                name.to_uppercase(),
                parts.map(str::to_string).collect::<Vec<_>>(),
            );
        }
        Self { capabilities }
    }

    /// Check if a capability is advertised
    pub fn has(&self, capability: &str) -> bool {
        self.capabilities.contains_key(&capability.to_uppercase())
    }

    /// Arguments for a capability, None when absent
    pub fn args(&self, capability: &str) -> Option<&[String]> {
        self.capabilities
            .get(&capability.to_uppercase())
            .map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let caps = Capabilities::parse(&["VERSION 2", "POST", "STREAMING"]);
        assert!(caps.has("VERSION"));
        assert!(caps.has("POST"));
        assert!(caps.has("STREAMING"));
        assert!(!caps.has("IHAVE"));
    }

    #[test]
    fn test_case_insensitive() {
        let caps = Capabilities::parse(&["streaming"]);
        assert!(caps.has("STREAMING"));
        assert!(caps.has("streaming"));
    }

    #[test]
    fn test_args() {
        let caps = Capabilities::parse(&["VERSION 2", "READER"]);
        assert_eq!(caps.args("VERSION"), Some(&["2".to_string()][..]));
        assert_eq!(caps.args("READER"), Some(&[][..]));
        assert_eq!(caps.args("STREAMING"), None);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let caps = Capabilities::parse(&["", "POST", ""]);
        assert!(caps.has("POST"));
    }
}
