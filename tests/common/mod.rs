//! Shared bootstrap for the black-box NNTP tests: a daemon bound to an
//! ephemeral port and a raw line-oriented client.
#![allow(dead_code)]

use overchan_nntpd::{Config, Daemon, FeedConfig};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub struct TestDaemon {
    pub daemon: Daemon,
    pub addr: SocketAddr,
    _dir: tempfile::TempDir,
}

pub async fn spawn_daemon(feeds: Vec<FeedConfig>) -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        base_dir: dir.path().to_path_buf(),
        database_url: "sqlite:///:memory:".to_string(),
        instance_name: "test.tld".to_string(),
        bind_host: "127.0.0.1".to_string(),
        bind_port: 0,
        sync_on_start: false,
        ..Config::default()
    };
    let mut daemon = Daemon::new(config, feeds).unwrap();
    let addr = daemon.start().await.unwrap();
    TestDaemon {
        daemon,
        addr,
        _dir: dir,
    }
}

/// Raw NNTP peer speaking `\r\n` lines
pub struct Peer {
    stream: BufReader<TcpStream>,
}

impl Peer {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        let data = format!("{}\r\n", line);
        self.stream
            .get_mut()
            .write_all(data.as_bytes())
            .await
            .unwrap();
        self.stream.get_mut().flush().await.unwrap();
    }

    pub async fn send_lines(&mut self, lines: &[&str]) {
        for line in lines {
            self.send_line(line).await;
        }
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await.unwrap();
        assert!(n > 0, "peer closed the connection");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    pub async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        self.stream.get_mut().write_all(data).await.unwrap();
        self.stream.get_mut().flush().await.unwrap();
    }

    /// Lines of a multi-line response, terminator excluded
    pub async fn read_until_dot(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            if line == "." {
                return lines;
            }
            lines.push(line);
        }
    }
}

/// A well-formed test article; the first line is `Message-ID: <id>`
pub fn article_lines(id: &str, group: &str, body: &str) -> Vec<String> {
    vec![
        format!("Message-ID: {}", id),
        "Subject: test post".to_string(),
        "From: tester <tester@test.tld>".to_string(),
        format!("Newsgroups: {}", group),
        "Date: Sun, 1 Feb 2015 12:00:00 +0000".to_string(),
        String::new(),
        body.to_string(),
    ]
}

pub fn feed_config(name: &str, host: &str, port: u16, rules: &[&str]) -> FeedConfig {
    FeedConfig {
        name: name.to_string(),
        host: host.to_string(),
        port,
        proxy: None,
        rules: rules.iter().map(|r| r.to_string()).collect(),
    }
}
