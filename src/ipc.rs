//! Frontend IPC bridge over a unix socket
//!
//! Frontends speak newline-delimited JSON with a `.` line closing each record.
//! Commands carry a `Please` key: `socket` announces the frontend's callback
//! socket (article events flow back over it), `post` submits a new article
//! through the normal ingest path, `sync` replays every stored article to the
//! callback socket.

use crate::daemon::DaemonShared;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "Please", rename_all = "lowercase")]
enum PleaseCommand {
    /// Announce the callback socket for broadcasts
    Socket { socket: PathBuf },
    /// Replay all stored articles to the callback socket
    Sync {},
    /// Submit a post on behalf of a frontend user
    Post {
        #[serde(default)]
        newsgroups: Vec<String>,
        #[serde(default)]
        subject: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        email: String,
        #[serde(default)]
        references: String,
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Serialize)]
struct ArticleRecord<'a> {
    #[serde(rename = "Please")]
    please: &'static str,
    #[serde(rename = "MessageID")]
    message_id: &'a str,
    #[serde(rename = "Newsgroups")]
    newsgroups: &'a [String],
}

fn article_record(message_id: &str, newsgroups: &[String]) -> String {
    serde_json::to_string(&ArticleRecord {
        please: "article",
        message_id,
        newsgroups,
    })
    .expect("article record serializes")
}

/// Bind the bridge socket and serve frontends until shutdown
pub fn spawn(
    shared: Arc<DaemonShared>,
    path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    let listener = UnixListener::bind(&path)?;
    info!("ipc bridge listening on {}", path.display());
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_frontend(shared, stream).await {
                                debug!("ipc client ended: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("ipc accept failed: {}", e),
                },
            }
        }
        let _ = std::fs::remove_file(&path);
        debug!("ipc bridge stopped");
    }))
}

async fn handle_frontend(shared: Arc<DaemonShared>, stream: UnixStream) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut callback: Option<mpsc::UnboundedSender<String>> = None;
    while let Some(record) = read_record(&mut reader).await? {
        let cmd: PleaseCommand = match serde_json::from_str(&record) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("ipc bad record: {}", e);
                continue;
            }
        };
        match cmd {
            PleaseCommand::Socket { socket } => {
                callback = Some(connect_callback(shared.clone(), &socket).await?);
                info!("ipc frontend announced {}", socket.display());
            }
            PleaseCommand::Sync {} => {
                let Some(tx) = &callback else {
                    warn!("ipc sync with no callback socket announced");
                    continue;
                };
                for (article_id, groups) in shared.store.yield_all_articles()? {
                    let _ = tx.send(article_record(&article_id, &groups));
                }
            }
            PleaseCommand::Post {
                newsgroups,
                subject,
                name,
                email,
                references,
                message,
            } => {
                submit_post(
                    &shared, newsgroups, subject, name, email, references, message,
                );
            }
        }
    }
    Ok(())
}

/// Read one `json ... \n.\n` record; None at EOF
async fn read_record(reader: &mut BufReader<UnixStream>) -> Result<Option<String>> {
    let mut record = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let line = line.trim_end_matches('\n');
        if line == "." {
            return Ok(Some(record));
        }
        if !record.is_empty() {
            record.push('\n');
        }
        record.push_str(line);
    }
}

/// Connect the callback socket and pump article events into it
async fn connect_callback(
    shared: Arc<DaemonShared>,
    path: &Path,
) -> Result<mpsc::UnboundedSender<String>> {
    let mut stream = UnixStream::connect(path).await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut events = shared.subscribe_events();
    let event_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let record = article_record(&event.message_id, &event.newsgroups);
                    if event_tx.send(record).is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("ipc callback lagged, dropped {} events", n);
                }
                Err(_) => break,
            }
        }
    });
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let mut data = record.into_bytes();
            data.extend_from_slice(b"\n.\n");
            if stream.write_all(&data).await.is_err() {
                break;
            }
        }
    });
    Ok(tx)
}

fn submit_post(
    shared: &Arc<DaemonShared>,
    newsgroups: Vec<String>,
    subject: String,
    name: String,
    email: String,
    references: String,
    message: String,
) {
    let article_id = shared.generate_id();
    let sender = if name.is_empty() {
        "Anonymous".to_string()
    } else {
        name
    };
    let mut lines = vec![
        format!("Message-ID: {}", article_id),
        format!("Path: {}", shared.config.instance_name),
        format!("Newsgroups: {}", newsgroups.join(";")),
        format!(
            "Subject: {}",
            if subject.is_empty() { "None" } else { subject.as_str() }
        ),
        format!("From: {} <{}>", sender, email),
        format!("Date: {}", chrono::Utc::now().to_rfc2822()),
    ];
    if !references.is_empty() {
        lines.push(format!("References: {}", references));
    }
    lines.push(String::new());
    lines.extend(message.lines().map(str::to_string));
    match shared.store_article(&article_id, &lines) {
        Ok(Some(msg)) => shared.got_article(&msg.message_id, &msg.groups),
        Ok(None) => warn!("ipc post {} did not parse", article_id),
        Err(e) => warn!("ipc post {} failed: {}", article_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_article_record_shape() {
        let record = article_record("<a@b.c>", &["overchan.test".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&record).unwrap();
        assert_eq!(value["Please"], "article");
        assert_eq!(value["MessageID"], "<a@b.c>");
        assert_eq!(value["Newsgroups"][0], "overchan.test");
    }

    #[test]
    fn test_please_command_parsing() {
        let cmd: PleaseCommand =
            serde_json::from_str(r#"{"Please":"socket","socket":"/tmp/frontend.sock"}"#).unwrap();
        assert!(matches!(cmd, PleaseCommand::Socket { .. }));

        let cmd: PleaseCommand = serde_json::from_str(
            r#"{"Please":"post","newsgroups":["overchan.test"],"message":"hi"}"#,
        )
        .unwrap();
        match cmd {
            PleaseCommand::Post {
                newsgroups,
                message,
                subject,
                ..
            } => {
                assert_eq!(newsgroups, vec!["overchan.test"]);
                assert_eq!(message, "hi");
                assert_eq!(subject, "");
            }
            _ => panic!("wrong variant"),
        }

        let cmd: PleaseCommand = serde_json::from_str(r#"{"Please":"sync"}"#).unwrap();
        assert!(matches!(cmd, PleaseCommand::Sync {}));

        assert!(serde_json::from_str::<PleaseCommand>(r#"{"Please":"frobnicate"}"#).is_err());
    }
}
