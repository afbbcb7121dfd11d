//! NNTP response codes and status-line parsing

use crate::error::{NntpdError, Result};

/// Parse a single-line NNTP response into `(code, rest)`
///
/// The rest is everything after the code with the leading space removed.
pub fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let line = line.trim_end();
    if line.len() < 3 {
        return Err(NntpdError::InvalidResponse(format!(
            "response too short: {:?}",
            line
        )));
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| NntpdError::InvalidResponse(format!("bad status code: {:?}", line)))?;
    let rest = line[3..].trim_start().to_string();
    Ok((code, rest))
}

/// NNTP response codes used by this daemon (RFC 3977 / RFC 4644 subset)
pub mod codes {
    /// Capability list follows
    pub const CAPABILITY_LIST: u16 = 101;
    /// Server ready, posting allowed
    pub const READY_POSTING_ALLOWED: u16 = 200;
    /// Streaming OK (RFC 4644)
    pub const STREAMING_OK: u16 = 203;
    /// Closing connection
    pub const CLOSING_CONNECTION: u16 = 205;
    /// Group selected
    pub const GROUP_SELECTED: u16 = 211;
    /// List of newsgroups follows
    pub const LIST_INFORMATION_FOLLOWS: u16 = 215;
    /// Article follows
    pub const ARTICLE_FOLLOWS: u16 = 220;
    /// Head follows
    pub const HEAD_FOLLOWS: u16 = 221;
    /// Article transferred OK (IHAVE)
    pub const ARTICLE_TRANSFERRED: u16 = 235;
    /// Send article via TAKETHIS (RFC 4644)
    pub const CHECK_SEND: u16 = 238;
    /// Article received OK (RFC 4644)
    pub const TAKETHIS_RECEIVED: u16 = 239;
    /// Article posted successfully
    pub const ARTICLE_POSTED: u16 = 240;
    /// XSECRET accepted
    pub const XSECRET_ACCEPTED: u16 = 290;
    /// Send article to be transferred (IHAVE)
    pub const SEND_ARTICLE_TRANSFER: u16 = 335;
    /// Send article to be posted
    pub const SEND_ARTICLE: u16 = 340;
    /// No such newsgroup
    pub const NO_SUCH_GROUP: u16 = 411;
    /// No newsgroup selected
    pub const NO_GROUP_SELECTED: u16 = 412;
    /// No current article / not implemented overview
    pub const NO_CURRENT_ARTICLE: u16 = 420;
    /// No article with that number
    pub const NO_SUCH_ARTICLE_NUMBER: u16 = 432;
    /// Article not wanted
    pub const ARTICLE_NOT_WANTED: u16 = 435;
    /// Transfer rejected; do not retry
    pub const TRANSFER_REJECTED: u16 = 437;
    /// Article not wanted (CHECK)
    pub const CHECK_NOT_WANTED: u16 = 438;
    /// Article rejected (TAKETHIS)
    pub const TAKETHIS_REJECTED: u16 = 439;
    /// Posting not permitted
    pub const POSTING_NOT_PERMITTED: u16 = 440;
    /// Posting failed
    pub const POSTING_FAILED: u16 = 441;
    /// Authentication rejected
    pub const AUTH_REJECTED: u16 = 481;
    /// Command not recognized in this mode
    pub const COMMAND_NOT_RECOGNIZED: u16 = 500;
    /// Command syntax error
    pub const COMMAND_SYNTAX_ERROR: u16 = 501;
    /// Feature not supported
    pub const FEATURE_NOT_SUPPORTED: u16 = 503;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_line() {
        let (code, rest) = parse_status_line("238 <a@b>\r\n").unwrap();
        assert_eq!(code, 238);
        assert_eq!(rest, "<a@b>");
    }

    #[test]
    fn test_parse_status_line_no_message() {
        let (code, rest) = parse_status_line("205").unwrap();
        assert_eq!(code, 205);
        assert_eq!(rest, "");
    }

    #[test]
    fn test_parse_status_line_garbage() {
        assert!(parse_status_line("lol").is_err());
        assert!(parse_status_line("").is_err());
        assert!(parse_status_line("ab3 hi").is_err());
    }
}
