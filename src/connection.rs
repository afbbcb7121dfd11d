//! Per-connection NNTP state machine
//!
//! One `NntpConnection` drives one socket, inbound or outbound. Inbound
//! connections serve the command table below; outbound connections are owned
//! by an outfeed and push queued articles with CHECK/TAKETHIS (or IHAVE when
//! the peer does not stream). Command handlers never escape to the mainloop:
//! everything that can go wrong inside a command turns into a protocol
//! response, and only transport errors end the session.

use crate::capabilities::Capabilities;
use crate::daemon::DaemonShared;
use crate::error::{NntpdError, Result};
use crate::feed::Outfeed;
use crate::message::Message;
use crate::response::{codes, parse_status_line};
use crate::validation::is_valid_message_id;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on one article payload; lines past it are consumed and dropped
const MAX_ARTICLE_BYTES: usize = 16 * 1024 * 1024;

const WELCOME: &str = "200 ayyyy lmao overchan nntpd, post it faget";

const CAPS: &[&str] = &[
    "101 i support some things",
    "VERSION 2",
    "IMPLEMENTATION overchan-nntpd 0.1.0",
    "POST",
    "IHAVE",
    "READER",
    "XSECRET",
    "STREAMING",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Initial,
    Stream,
    Reader,
}

/// One NNTP session over a TCP stream
pub struct NntpConnection {
    stream: BufReader<TcpStream>,
    shared: Arc<DaemonShared>,
    name: String,
    state: SessionState,
    current_group: Option<String>,
    authorized: bool,
}

impl NntpConnection {
    /// Wrap an accepted inbound peer socket
    pub fn inbound(stream: TcpStream, shared: Arc<DaemonShared>, name: String) -> Self {
        Self::new(stream, shared, name)
    }

    /// Wrap a freshly dialed outbound socket
    pub fn outbound(stream: TcpStream, shared: Arc<DaemonShared>, name: String) -> Self {
        Self::new(stream, shared, name)
    }

    fn new(stream: TcpStream, shared: Arc<DaemonShared>, name: String) -> Self {
        Self {
            stream: BufReader::new(stream),
            shared,
            name,
            state: SessionState::Initial,
            current_group: None,
            authorized: false,
        }
    }

    // ------------------------------------------------------------------
    // wire I/O

    async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        let io = async {
            self.stream.get_mut().write_all(data).await?;
            self.stream.get_mut().flush().await?;
            Ok::<_, std::io::Error>(())
        };
        timeout(SEND_TIMEOUT, io)
            .await
            .map_err(|_| NntpdError::Timeout)??;
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        trace!("{} <- {}", self.name, line);
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.send_raw(&data).await
    }

    /// Read one line, stripped of its terminator; None at EOF
    async fn read_line(&mut self) -> Result<Option<String>> {
        let mut bytes = Vec::with_capacity(512);
        self.stream.read_until(b'\n', &mut bytes).await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&bytes);
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        trace!("{} -> {}", self.name, line);
        Ok(Some(line))
    }

    /// Read payload lines until the lone `.` terminator
    ///
    /// `\r` is stripped and dot-stuffing removed. Returns the lines and
    /// whether the payload blew the size cap (the remainder is consumed
    /// either way so the session stays in sync).
    async fn read_data_block(&mut self) -> Result<(Vec<String>, bool)> {
        let mut lines = Vec::new();
        let mut total = 0usize;
        let mut truncated = false;
        loop {
            let Some(line) = self.read_line().await? else {
                return Err(NntpdError::ConnectionClosed);
            };
            if line == "." {
                break;
            }
            total += line.len() + 1;
            if total > MAX_ARTICLE_BYTES {
                truncated = true;
                continue;
            }
            let line = match line.strip_prefix("..") {
                Some(rest) => format!(".{}", rest),
                None => line,
            };
            lines.push(line);
        }
        Ok((lines, truncated))
    }

    // ------------------------------------------------------------------
    // inbound role

    /// Serve an inbound peer until QUIT or transport error
    pub async fn run_inbound(&mut self) -> Result<()> {
        self.send_line(WELCOME).await?;
        loop {
            let Some(line) = self.read_line().await? else {
                debug!("{} hung up", self.name);
                break;
            };
            let mut parts = line.split_whitespace();
            let Some(cmd) = parts.next() else { continue };
            let cmd = cmd.to_uppercase();
            let args: Vec<&str> = parts.collect();
            match cmd.as_str() {
                "CAPABILITIES" => self.handle_capabilities().await?,
                "MODE" => self.handle_mode(&args).await?,
                "QUIT" => {
                    self.send_line("205 bai").await?;
                    break;
                }
                "GROUP" => self.handle_group(&args).await?,
                "LIST" => self.handle_list(&args).await?,
                "HEAD" => self.handle_article(&args, false).await?,
                "ARTICLE" => self.handle_article(&args, true).await?,
                "XOVER" => self.handle_xover().await?,
                "XSECRET" => self.handle_xsecret(&args).await?,
                "POST" => self.handle_post().await?,
                "CHECK" => self.handle_check(&args).await?,
                "TAKETHIS" => self.handle_takethis(&args).await?,
                "IHAVE" => self.handle_ihave(&args).await?,
                other => {
                    self.send_line(&format!("503 {} not implemented", other))
                        .await?
                }
            }
        }
        Ok(())
    }

    async fn handle_capabilities(&mut self) -> Result<()> {
        for cap in CAPS {
            self.send_line(cap).await?;
        }
        self.send_line(".").await
    }

    async fn handle_mode(&mut self, args: &[&str]) -> Result<()> {
        match args.first().map(|m| m.to_uppercase()).as_deref() {
            Some("STREAM") => {
                self.state = SessionState::Stream;
                self.send_line("203 stream as desired").await
            }
            Some("READER") => {
                self.state = SessionState::Reader;
                self.send_line("200 posting allowed").await
            }
            _ => self.send_line("501 unknown mode").await,
        }
    }

    async fn handle_group(&mut self, args: &[&str]) -> Result<()> {
        if self.state == SessionState::Reader {
            if let Some(group) = args.first() {
                if self.shared.store.has_group(group).unwrap_or(false) {
                    let (count, low, high) =
                        self.shared.store.get_group_info(group).unwrap_or((0, 0, 0));
                    self.current_group = Some(group.to_string());
                    return self
                        .send_line(&format!("211 {} {} {} {}", count, low, high, group))
                        .await;
                }
            }
        }
        self.send_line("411 no such newsgroup").await
    }

    async fn handle_list(&mut self, args: &[&str]) -> Result<()> {
        if args
            .first()
            .is_some_and(|a| a.eq_ignore_ascii_case("overview.fmt"))
        {
            return self.send_line("503 overview.fmt not maintained").await;
        }
        if self.state != SessionState::Reader {
            return self.send_line("500 mode reader first").await;
        }
        self.send_line("215 list of newsgroups follows").await?;
        let groups = self.shared.store.get_all_groups().unwrap_or_default();
        for group in groups {
            let (_, low, high) = self.shared.store.get_group_info(&group).unwrap_or((0, 0, 0));
            self.send_line(&format!("{} {} {} y", group, high, low))
                .await?;
        }
        self.send_line(".").await
    }

    async fn handle_article(&mut self, args: &[&str], full: bool) -> Result<()> {
        let found = match (self.current_group.as_deref(), args.first()) {
            (Some(group), Some(n)) => match n.parse::<u64>() {
                Ok(n) => self
                    .shared
                    .store
                    .get_article_id_for_post(group, n)
                    .unwrap_or(None)
                    .map(|id| (n, id)),
                Err(_) => None,
            },
            _ => None,
        };
        let Some((n, article_id)) = found else {
            return self.send_line("432 no such article").await;
        };
        if !self.shared.store.has_article(&article_id).unwrap_or(false) {
            return self.send_line("432 no such article").await;
        }
        let file = match self.shared.store.open_article(&article_id, true) {
            Ok(f) => f,
            Err(_) => return self.send_line("432 no such article").await,
        };
        let mut payload = Vec::new();
        let mut in_headers = true;
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            if !full {
                if line.is_empty() {
                    break;
                }
            } else if in_headers && line.is_empty() {
                in_headers = false;
            }
            if line.starts_with('.') {
                payload.push(format!(".{}", line));
            } else {
                payload.push(line);
            }
        }
        let status = if full {
            format!("220 {} {}", n, article_id)
        } else {
            format!("221 {} {}", n, article_id)
        };
        self.send_line(&status).await?;
        let mut data = Vec::new();
        for line in &payload {
            data.extend_from_slice(line.as_bytes());
            data.extend_from_slice(b"\r\n");
        }
        data.extend_from_slice(b".\r\n");
        self.send_raw(&data).await
    }

    async fn handle_xover(&mut self) -> Result<()> {
        if self.current_group.is_none() {
            self.send_line("412 no newsgroup selected").await
        } else {
            self.send_line("420 xover not implemented").await
        }
    }

    async fn handle_xsecret(&mut self, args: &[&str]) -> Result<()> {
        if let [user, passwd] = args {
            if self.shared.store.check_user_login(user, passwd).unwrap_or(false) {
                self.authorized = true;
                info!("{} authorized as {}", self.name, user);
                return self.send_line("290 access granted").await;
            }
        }
        self.send_line("481 access denied").await
    }

    async fn handle_post(&mut self) -> Result<()> {
        if !self.authorized {
            return self.send_line("440 posting not allowed").await;
        }
        self.send_line("340 send article to be posted. End with <CR-LF>.<CR-LF>")
            .await?;
        let (mut lines, truncated) = self.read_data_block().await?;
        if truncated {
            return self.send_line("441 posting failed").await;
        }
        let article_id = match ensure_message_id(&lines) {
            Some(id) => id,
            None => {
                let id = self.shared.generate_id();
                lines.insert(0, format!("Message-ID: {}", id));
                id
            }
        };
        if self.shared.store.has_article(&article_id).unwrap_or(false) {
            // a stored blob is never rewritten
            return self.send_line("441 posting failed").await;
        }
        inject_path(&mut lines, &self.shared.config.instance_name);
        match self.ingest_article(&article_id, &lines) {
            Ok(Some(msg)) => {
                self.send_line("240 article posted").await?;
                self.shared.got_article(&msg.message_id, &msg.groups);
                Ok(())
            }
            _ => self.send_line("441 posting failed").await,
        }
    }

    async fn handle_check(&mut self, args: &[&str]) -> Result<()> {
        let Some(article_id) = args.first().map(|s| s.to_string()) else {
            return self.send_line("501 syntax: CHECK <message-id>").await;
        };
        let banned = self.shared.store.article_banned(&article_id).unwrap_or(false);
        let line = if !is_valid_message_id(&article_id) || banned {
            format!("437 {}", article_id)
        } else if self.shared.store.has_article(&article_id).unwrap_or(false) {
            format!("435 {}", article_id)
        } else {
            format!("238 {}", article_id)
        };
        self.send_line(&line).await
    }

    async fn handle_takethis(&mut self, args: &[&str]) -> Result<()> {
        let article_id = args.first().map(|s| s.to_string()).unwrap_or_default();
        // the peer sends the payload unconditionally, so always consume it
        let (mut lines, truncated) = self.read_data_block().await?;
        if !is_valid_message_id(&article_id) || truncated {
            return self
                .send_line(&format!("439 {}", article_id))
                .await;
        }
        if self.shared.store.has_article(&article_id).unwrap_or(false) {
            debug!("{} already have {}", self.name, article_id);
            return self
                .send_line(&format!("239 {}", article_id))
                .await;
        }
        inject_path(&mut lines, &self.shared.config.instance_name);
        match self.ingest_article(&article_id, &lines) {
            Ok(Some(msg)) => {
                self.send_line(&format!("239 {}", article_id)).await?;
                self.shared.got_article(&msg.message_id, &msg.groups);
                Ok(())
            }
            _ => self.send_line(&format!("439 {}", article_id)).await,
        }
    }

    async fn handle_ihave(&mut self, args: &[&str]) -> Result<()> {
        let article_id = args.first().map(|s| s.to_string()).unwrap_or_default();
        let banned = self.shared.store.article_banned(&article_id).unwrap_or(false);
        if !is_valid_message_id(&article_id) || banned {
            return self.send_line("437 transfer rejected").await;
        }
        if self.shared.store.has_article(&article_id).unwrap_or(false) {
            return self.send_line("435 article not wanted").await;
        }
        self.send_line("335 send it. End with <CR-LF>.<CR-LF>")
            .await?;
        let (mut lines, truncated) = self.read_data_block().await?;
        if truncated {
            return self.send_line("437 transfer rejected").await;
        }
        inject_path(&mut lines, &self.shared.config.instance_name);
        match self.ingest_article(&article_id, &lines) {
            Ok(Some(msg)) => {
                self.send_line("235 article transferred ok").await?;
                self.shared.got_article(&msg.message_id, &msg.groups);
                Ok(())
            }
            _ => self.send_line("437 transfer rejected").await,
        }
    }

    fn ingest_article(&self, article_id: &str, lines: &[String]) -> Result<Option<Message>> {
        self.shared.store_article(article_id, lines)
    }

    // ------------------------------------------------------------------
    // outbound role

    /// Drive an outbound session for a feed until the peer or the queue goes
    /// away
    pub async fn run_outbound(
        &mut self,
        queue: &mut mpsc::UnboundedReceiver<String>,
        feed: &Outfeed,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let Some(greeting) = self.read_line().await? else {
            return Err(NntpdError::ConnectionClosed);
        };
        if !greeting.starts_with("200 ") {
            warn!("{} unexpected greeting: {}", self.name, greeting);
            self.send_line("QUIT").await.ok();
            return Err(NntpdError::InvalidResponse(greeting));
        }
        self.send_line("CAPABILITIES").await?;
        let caps = self.read_capabilities().await?;
        let mut streaming = false;
        if caps.has("STREAMING") {
            self.send_line("MODE STREAM").await?;
            let Some(resp) = self.read_line().await? else {
                return Err(NntpdError::ConnectionClosed);
            };
            streaming = resp.starts_with("203");
        }
        info!(
            "{} connected, streaming={}",
            self.name, streaming
        );
        loop {
            let article_id = tokio::select! {
                _ = shutdown.changed() => break,
                id = queue.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };
            feed.clear_queued(&article_id);
            if !self.shared.store.has_article(&article_id).unwrap_or(false) {
                debug!("{} skipping vanished article {}", self.name, article_id);
                continue;
            }
            if streaming {
                self.stream_article(&article_id).await?;
            } else {
                self.ihave_article(&article_id).await?;
            }
        }
        self.send_line("QUIT").await.ok();
        Ok(())
    }

    async fn read_capabilities(&mut self) -> Result<Capabilities> {
        let Some(status) = self.read_line().await? else {
            return Err(NntpdError::ConnectionClosed);
        };
        let (code, _) = parse_status_line(&status)?;
        if code != codes::CAPABILITY_LIST {
            return Err(NntpdError::InvalidResponse(status));
        }
        let mut lines = Vec::new();
        loop {
            let Some(line) = self.read_line().await? else {
                return Err(NntpdError::ConnectionClosed);
            };
            if line == "." {
                break;
            }
            lines.push(line);
        }
        Ok(Capabilities::parse(&lines))
    }

    async fn stream_article(&mut self, article_id: &str) -> Result<()> {
        self.send_line(&format!("CHECK {}", article_id)).await?;
        let Some(resp) = self.read_line().await? else {
            return Err(NntpdError::ConnectionClosed);
        };
        let (code, _) = parse_status_line(&resp)?;
        match code {
            codes::CHECK_SEND => {
                self.send_line(&format!("TAKETHIS {}", article_id)).await?;
                self.send_article_body(article_id).await?;
                let Some(fin) = self.read_line().await? else {
                    return Err(NntpdError::ConnectionClosed);
                };
                let (code, _) = parse_status_line(&fin)?;
                if code == codes::TAKETHIS_RECEIVED {
                    debug!("{} accepted {}", self.name, article_id);
                } else {
                    warn!("{} rejected {}: {}", self.name, article_id, fin);
                }
            }
            codes::CHECK_NOT_WANTED | codes::ARTICLE_NOT_WANTED | codes::TRANSFER_REJECTED => {
                debug!("{} does not want {}: {}", self.name, article_id, resp);
            }
            _ => {
                warn!("{} odd CHECK response for {}: {}", self.name, article_id, resp);
            }
        }
        Ok(())
    }

    async fn ihave_article(&mut self, article_id: &str) -> Result<()> {
        self.send_line(&format!("IHAVE {}", article_id)).await?;
        let Some(resp) = self.read_line().await? else {
            return Err(NntpdError::ConnectionClosed);
        };
        let (code, _) = parse_status_line(&resp)?;
        match code {
            codes::SEND_ARTICLE_TRANSFER => {
                self.send_article_body(article_id).await?;
                let Some(fin) = self.read_line().await? else {
                    return Err(NntpdError::ConnectionClosed);
                };
                let (code, _) = parse_status_line(&fin)?;
                if code == codes::ARTICLE_TRANSFERRED {
                    debug!("{} transferred {}", self.name, article_id);
                } else {
                    warn!("{} refused {}: {}", self.name, article_id, fin);
                }
            }
            codes::ARTICLE_NOT_WANTED | codes::TRANSFER_REJECTED => {
                debug!("{} does not want {}: {}", self.name, article_id, resp);
            }
            _ => {
                warn!("{} odd IHAVE response for {}: {}", self.name, article_id, resp);
            }
        }
        Ok(())
    }

    /// Send the stored blob, `\n` rewritten to `\r\n`, dot-stuffed, terminated
    /// with `.\r\n`
    async fn send_article_body(&mut self, article_id: &str) -> Result<()> {
        let file = self.shared.store.open_article(article_id, true)?;
        let mut data = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            if line.starts_with('.') {
                data.push(b'.');
            }
            data.extend_from_slice(line.as_bytes());
            data.extend_from_slice(b"\r\n");
        }
        data.extend_from_slice(b".\r\n");
        self.send_raw(&data).await
    }
}

/// Message-ID from the header block, when present and well formed
fn ensure_message_id(lines: &[String]) -> Option<String> {
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.to_ascii_lowercase().starts_with("message-id:") {
            let id = line.split_once(':').map(|(_, v)| v.trim())?;
            if is_valid_message_id(id) {
                return Some(id.to_string());
            }
            return None;
        }
    }
    None
}

/// Rewrite the Path header, prepending this instance
///
/// A missing Path header becomes `Path: <instance>`.
fn inject_path(lines: &mut Vec<String>, instance: &str) {
    let mut path_at = None;
    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() {
            break;
        }
        if line.to_ascii_lowercase().starts_with("path:") {
            path_at = Some(i);
            break;
        }
    }
    match path_at {
        Some(i) => {
            let value = lines[i]
                .split_once(':')
                .map(|(_, v)| v.trim().to_string())
                .unwrap_or_default();
            lines[i] = format!("Path: {}!{}", instance, value);
        }
        None => lines.insert(0, format!("Path: {}", instance)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_path_rewrites_existing() {
        let mut lines = vec![
            "Subject: hi".to_string(),
            "Path: remote.tld".to_string(),
            "".to_string(),
            "Path: not a header".to_string(),
        ];
        inject_path(&mut lines, "local.tld");
        assert_eq!(lines[1], "Path: local.tld!remote.tld");
        assert_eq!(lines[3], "Path: not a header");
    }

    #[test]
    fn test_inject_path_inserts_when_missing() {
        let mut lines = vec!["Subject: hi".to_string(), "".to_string()];
        inject_path(&mut lines, "local.tld");
        assert_eq!(lines[0], "Path: local.tld");
    }

    #[test]
    fn test_ensure_message_id() {
        let lines = vec![
            "Subject: hi".to_string(),
            "Message-ID: <have@id.tld>".to_string(),
            "".to_string(),
        ];
        assert_eq!(ensure_message_id(&lines), Some("<have@id.tld>".to_string()));
    }

    #[test]
    fn test_ensure_message_id_absent_or_bad() {
        assert_eq!(ensure_message_id(&["Subject: hi".to_string()]), None);
        assert_eq!(
            ensure_message_id(&["Message-ID: garbage".to_string()]),
            None
        );
        // headers end at the blank line; a Message-ID in the body is not one
        let lines = vec![
            "Subject: hi".to_string(),
            "".to_string(),
            "Message-ID: <body@id.tld>".to_string(),
        ];
        assert_eq!(ensure_message_id(&lines), None);
    }

    #[test]
    fn test_capability_list_contents() {
        assert!(CAPS.iter().any(|c| *c == "POST"));
        assert!(CAPS.iter().any(|c| *c == "STREAMING"));
        assert!(CAPS.iter().all(|c| *c != "SOCIALISM"));
    }
}
