//! Outbound peer feeds
//!
//! One worker task per configured peer. The worker dials (optionally through a
//! SOCKS4a proxy), runs one outbound `NntpConnection` over the socket, and
//! reconnects after a short backoff whenever the peer goes away. The daemon
//! enqueues article ids; the queue is FIFO per feed and already-queued ids are
//! suppressed.

use crate::config::{FeedConfig, ProxyConfig};
use crate::connection::NntpConnection;
use crate::daemon::DaemonShared;
use crate::error::{NntpdError, Result};
use crate::policy::FeedPolicy;
use crate::validation::dial_host;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// One configured outbound peer
pub struct Outfeed {
    name: String,
    host: String,
    port: u16,
    proxy: Option<ProxyConfig>,
    policy: FeedPolicy,
    queued: Mutex<HashSet<String>>,
    tx: mpsc::UnboundedSender<String>,
}

impl Outfeed {
    /// Build a feed and its queue receiver from config
    ///
    /// Fails on invalid policy rules; that is a configuration error and fatal
    /// at startup.
    pub fn new(config: &FeedConfig) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<String>)> {
        let policy = FeedPolicy::new(&config.rules)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Arc::new(Self {
                name: config.name.clone(),
                host: config.host.clone(),
                port: config.port,
                proxy: config.proxy.clone(),
                policy,
                queued: Mutex::new(HashSet::new()),
                tx,
            }),
            rx,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the id is sitting in this feed's queue
    pub fn article_queued(&self, article_id: &str) -> bool {
        self.queued
            .lock()
            .expect("outfeed mutex poisoned")
            .contains(article_id)
    }

    /// Enqueue an article if the policy admits any of its groups
    ///
    /// Returns true when the article was queued; duplicates and rejected
    /// group sets are suppressed.
    pub fn queue_send_article(&self, article_id: &str, groups: &[String]) -> bool {
        let mut queued = self.queued.lock().expect("outfeed mutex poisoned");
        if queued.contains(article_id) {
            return false;
        }
        if !self.policy.allow_any(groups) {
            return false;
        }
        queued.insert(article_id.to_string());
        let _ = self.tx.send(article_id.to_string());
        true
    }

    /// Drop an id from the queued set once the connection has picked it up
    pub fn clear_queued(&self, article_id: &str) {
        self.queued
            .lock()
            .expect("outfeed mutex poisoned")
            .remove(article_id);
    }

    /// Connect-and-run loop; exits on daemon shutdown
    pub async fn run(
        self: Arc<Self>,
        shared: Arc<DaemonShared>,
        mut queue: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let dialed = tokio::select! {
                _ = shutdown.changed() => break,
                dialed = self.dial() => dialed,
            };
            match dialed {
                Ok(stream) => {
                    let mut conn = NntpConnection::outbound(
                        stream,
                        shared.clone(),
                        format!("outfeed-{}", self.name),
                    );
                    match conn.run_outbound(&mut queue, &self, &mut shutdown).await {
                        Ok(()) => break,
                        Err(e) => warn!("outfeed {} disconnected: {}", self.name, e),
                    }
                }
                Err(e) => debug!("outfeed {} dial failed: {}", self.name, e),
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
        info!("outfeed {} stopped", self.name);
    }

    async fn dial(&self) -> Result<TcpStream> {
        let stream = match &self.proxy {
            Some(proxy) => {
                timeout(
                    DIAL_TIMEOUT,
                    socks4a_connect(proxy, &self.host, self.port),
                )
                .await
                .map_err(|_| NntpdError::Timeout)??
            }
            None => timeout(
                DIAL_TIMEOUT,
                TcpStream::connect((dial_host(&self.host), self.port)),
            )
            .await
            .map_err(|_| NntpdError::Timeout)??,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// SOCKS4a CONNECT request for a hostname resolved by the proxy
fn socks4a_request(host: &str, port: u16) -> Vec<u8> {
    let mut req = vec![0x04, 0x01];
    req.extend_from_slice(&port.to_be_bytes());
    // 0.0.0.1 marks the 4a extension: hostname follows the user id
    req.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    req.extend_from_slice(b"srndv2\x00");
    req.extend_from_slice(host.as_bytes());
    req.push(0x00);
    req
}

async fn socks4a_connect(proxy: &ProxyConfig, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((dial_host(&proxy.host), proxy.port)).await?;
    stream
        .write_all(&socks4a_request(dial_host(host), port))
        .await?;
    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x5A {
        return Err(NntpdError::ProxyFailure(format!(
            "request refused with code {:#04x}",
            reply[1]
        )));
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(rules: &[&str]) -> (Arc<Outfeed>, mpsc::UnboundedReceiver<String>) {
        let config = FeedConfig {
            name: "peer.tld:119".to_string(),
            host: "peer.tld".to_string(),
            port: 119,
            proxy: None,
            rules: rules.iter().map(|r| r.to_string()).collect(),
        };
        Outfeed::new(&config).unwrap()
    }

    #[test]
    fn test_socks4a_request_bytes() {
        let req = socks4a_request("some.onion", 119);
        assert_eq!(&req[..2], &[0x04, 0x01]);
        assert_eq!(&req[2..4], &119u16.to_be_bytes());
        assert_eq!(&req[4..8], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&req[8..15], b"srndv2\x00");
        assert_eq!(&req[15..25], b"some.onion");
        assert_eq!(req[25], 0x00);
        assert_eq!(req.len(), 26);
    }

    #[test]
    fn test_queue_policy_gate() {
        let (feed, mut rx) = feed(&["overchan.*"]);
        assert!(feed.queue_send_article("<a@b.c>", &["overchan.test".to_string()]));
        assert!(feed.article_queued("<a@b.c>"));
        assert!(!feed.queue_send_article("<x@y.z>", &["ctl".to_string()]));
        assert!(!feed.article_queued("<x@y.z>"));
        assert_eq!(rx.try_recv().unwrap(), "<a@b.c>");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_queue_suppresses_duplicates() {
        let (feed, mut rx) = feed(&["overchan.*"]);
        let groups = vec!["overchan.test".to_string()];
        assert!(feed.queue_send_article("<a@b.c>", &groups));
        assert!(!feed.queue_send_article("<a@b.c>", &groups));
        assert_eq!(rx.try_recv().unwrap(), "<a@b.c>");
        assert!(rx.try_recv().is_err());
        // once picked up, the id may be offered again
        feed.clear_queued("<a@b.c>");
        assert!(feed.queue_send_article("<a@b.c>", &groups));
    }

    #[test]
    fn test_invalid_rule_is_fatal() {
        let config = FeedConfig {
            name: "peer.tld:119".to_string(),
            host: "peer.tld".to_string(),
            port: 119,
            proxy: None,
            rules: vec!["*".to_string()],
        };
        assert!(Outfeed::new(&config).is_err());
    }
}
