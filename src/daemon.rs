//! The NNTP daemon: listener, feed registry, and article fanout
//!
//! The daemon owns the store and the outfeeds. Connections and feeds hold an
//! `Arc<DaemonShared>` back-reference carrying exactly the surface they need:
//! the store, `got_article`, `generate_id`, and the connection registry.

use crate::config::{Config, FeedConfig};
use crate::connection::NntpConnection;
use crate::error::Result;
use crate::feed::Outfeed;
use crate::message::Message;
use crate::store::ArticleStore;
use crate::validation::dial_host;
use chrono::Utc;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Article accepted and indexed; broadcast to the IPC bridge
#[derive(Debug, Clone)]
pub struct ArticleEvent {
    pub message_id: String,
    pub newsgroups: Vec<String>,
}

/// State shared between the daemon, its connections, and its feeds
pub struct DaemonShared {
    pub config: Config,
    pub store: ArticleStore,
    feeds: Mutex<Vec<Arc<Outfeed>>>,
    connections: Mutex<HashSet<u64>>,
    next_conn: AtomicU64,
    events: broadcast::Sender<ArticleEvent>,
}

impl DaemonShared {
    /// Fan an accepted article out to every feed whose policy admits one of
    /// its groups, and to IPC subscribers
    pub fn got_article(&self, article_id: &str, groups: &[String]) {
        if groups.is_empty() {
            warn!("article {} has no newsgroups, not relaying", article_id);
            return;
        }
        let feeds = self.feeds.lock().expect("feed registry poisoned");
        for feed in feeds.iter() {
            if feed.queue_send_article(article_id, groups) {
                debug!("queued {} for {}", article_id, feed.name());
            }
        }
        let _ = self.events.send(ArticleEvent {
            message_id: article_id.to_string(),
            newsgroups: groups.to_vec(),
        });
    }

    /// Mint a fresh Message-ID for locally submitted posts
    pub fn generate_id(&self) -> String {
        let random: [u8; 8] = rand::random();
        let digest = hex::encode(Sha1::digest(random));
        format!(
            "<{}.{}@{}>",
            Utc::now().timestamp(),
            &digest[..10],
            self.config.instance_name
        )
    }

    /// Write an article blob, parse it back, and index it
    ///
    /// The shared ingest path behind POST, TAKETHIS, IHAVE, and IPC posts.
    /// On parse failure the partial blob is deleted and None returned; the
    /// caller decides the protocol response and whether to fan out.
    pub fn store_article(&self, article_id: &str, lines: &[String]) -> Result<Option<Message>> {
        use std::io::Write;
        {
            let mut file = self.store.open_article(article_id, false)?;
            for line in lines {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
        }
        let mut msg = Message::new(article_id)?;
        let file = self.store.open_article(article_id, true)?;
        let parsed = msg.load(&mut std::io::BufReader::new(file))?;
        if !parsed {
            warn!("rejecting malformed article {}", article_id);
            self.store.delete_article(article_id)?;
            return Ok(None);
        }
        self.store.save_message(&msg)?;
        info!("stored article {} in {:?}", article_id, msg.groups);
        Ok(Some(msg))
    }

    /// Subscribe to accepted-article events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ArticleEvent> {
        self.events.subscribe()
    }

    pub(crate) fn register_connection(&self) -> u64 {
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .expect("connection registry poisoned")
            .insert(id);
        id
    }

    pub(crate) fn deregister_connection(&self, id: u64) {
        let removed = self
            .connections
            .lock()
            .expect("connection registry poisoned")
            .remove(&id);
        debug_assert!(removed, "connection {} deregistered twice", id);
    }

    /// Number of live inbound connections
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connection registry poisoned")
            .len()
    }

    fn register_feed(&self, feed: Arc<Outfeed>) {
        self.feeds.lock().expect("feed registry poisoned").push(feed);
    }

    /// Snapshot of the configured feeds
    pub fn feeds(&self) -> Vec<Arc<Outfeed>> {
        self.feeds.lock().expect("feed registry poisoned").clone()
    }
}

/// The daemon itself; owns the tasks it spawns
pub struct Daemon {
    shared: Arc<DaemonShared>,
    feed_configs: Vec<FeedConfig>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
    feed_tasks: Vec<JoinHandle<()>>,
    ipc_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Daemon {
    /// Open the store and stage the feeds; nothing touches the network yet
    pub fn new(config: Config, feed_configs: Vec<FeedConfig>) -> Result<Self> {
        let store = ArticleStore::open(&config.base_dir, &config.database_url)?;
        let (events, _) = broadcast::channel(64);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(DaemonShared {
                config,
                store,
                feeds: Mutex::new(Vec::new()),
                connections: Mutex::new(HashSet::new()),
                next_conn: AtomicU64::new(1),
                events,
            }),
            feed_configs,
            shutdown_tx,
            accept_task: None,
            feed_tasks: Vec::new(),
            ipc_task: None,
            local_addr: None,
        })
    }

    pub fn shared(&self) -> Arc<DaemonShared> {
        self.shared.clone()
    }

    /// Address the listener bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener, spawn the outfeeds, and begin accepting
    ///
    /// Fails loudly on bind errors and invalid feed policies. Returns the
    /// bound address (useful when the config asked for port 0).
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let bind = (
            dial_host(&self.shared.config.bind_host).to_string(),
            self.shared.config.bind_port,
        );
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);
        self.local_addr = Some(local_addr);

        let feed_configs = self.feed_configs.clone();
        for feed_config in &feed_configs {
            let (feed, queue) = Outfeed::new(feed_config)?;
            self.shared.register_feed(feed.clone());
            let shared = self.shared.clone();
            let shutdown = self.shutdown_tx.subscribe();
            self.feed_tasks
                .push(tokio::spawn(feed.run(shared, queue, shutdown)));
            info!("outfeed {} spawned", feed_config.name);
        }

        let shared = self.shared.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => spawn_inbound(shared.clone(), stream, peer),
                        Err(e) => warn!("accept failed: {}", e),
                    },
                }
            }
            debug!("accept loop stopped");
        }));

        #[cfg(unix)]
        if let Some(socket) = self.shared.config.frontend_socket.clone() {
            self.ipc_task = Some(crate::ipc::spawn(
                self.shared.clone(),
                socket,
                self.shutdown_tx.subscribe(),
            )?);
        }

        if self.shared.config.sync_on_start {
            self.sync_feeds()?;
        }
        Ok(local_addr)
    }

    /// Re-offer every stored article to the feeds
    fn sync_feeds(&self) -> Result<()> {
        let mut offered = 0usize;
        for (article_id, groups) in self.shared.store.yield_all_articles()? {
            self.shared.got_article(&article_id, &groups);
            offered += 1;
        }
        info!("sync offered {} stored articles", offered);
        Ok(())
    }

    /// Stop accepting, wind down the feeds, and wait for them
    pub async fn end(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        for task in self.feed_tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(task) = self.ipc_task.take() {
            let _ = task.await;
        }
        info!("daemon stopped");
    }
}

fn spawn_inbound(shared: Arc<DaemonShared>, stream: tokio::net::TcpStream, peer: SocketAddr) {
    let conn_id = shared.register_connection();
    tokio::spawn(async move {
        let name = format!("inbound-{}", peer);
        debug!("{} connected", name);
        let mut conn = NntpConnection::inbound(stream, shared.clone(), name.clone());
        if let Err(e) = conn.run_inbound().await {
            debug!("{} ended: {}", name, e);
        }
        // sole deregistration point for this connection
        shared.deregister_connection(conn_id);
    });
}
