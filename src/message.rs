//! Article metadata parsing and signature verification
//!
//! A `Message` is the parsed view of one stored article blob: the recognised
//! headers, the newsgroup set, and the ed25519 signature material. Parsing is
//! line-oriented and case-insensitive; the body is never loaded into memory,
//! only hashed when a signature is present.

use crate::error::{NntpdError, Result};
use crate::validation::is_valid_message_id;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha1::{Digest, Sha1};
use sha2::Sha512;
use std::io::{BufRead, Seek, SeekFrom};
use tracing::{debug, warn};

/// Parsed article metadata
#[derive(Debug, Clone)]
pub struct Message {
    /// Message-ID, primary identity everywhere
    pub message_id: String,
    /// SHA-1 hex of the message-id bytes
    pub posthash: String,
    /// First 10 chars of the posthash, used by frontends as a short handle
    pub identifier: String,
    pub subject: String,
    pub sender: String,
    pub email: String,
    /// Message-ID of the thread root, from References
    pub parent: String,
    pub path: String,
    /// Posted time, unix seconds
    pub sent: i64,
    pub groups: Vec<String>,
    /// Presence of an X-Sage header
    pub sage: bool,
    /// Hex ed25519 public key; cleared unless exactly 64 hex chars with a
    /// 128-hex signature alongside
    pub pubkey: String,
    /// Hex ed25519-sha512 signature
    pub sig: Option<String>,
    /// Attachment metadata filled in by frontends, persisted as-is
    pub attachment_name: String,
    pub attachment_hash: String,
    pub thumb_name: String,
}

impl Message {
    /// Create an empty message record for a validated id
    pub fn new(message_id: &str) -> Result<Self> {
        if !is_valid_message_id(message_id) {
            return Err(NntpdError::MalformedId(message_id.to_string()));
        }
        let posthash = hex::encode(Sha1::digest(message_id.as_bytes()));
        let identifier = posthash[..10].to_string();
        Ok(Self {
            message_id: message_id.to_string(),
            posthash,
            identifier,
            subject: "None".to_string(),
            sender: "Anonymous".to_string(),
            email: String::new(),
            parent: String::new(),
            path: String::new(),
            sent: 0,
            groups: Vec::new(),
            sage: false,
            pubkey: String::new(),
            sig: None,
            attachment_name: String::new(),
            attachment_hash: String::new(),
            thumb_name: String::new(),
        })
    }

    /// Load headers from a reader positioned at the start of the article
    ///
    /// Returns true when the header block terminated with a blank line. When a
    /// signature is present it is verified over the canonicalised body; a
    /// failed verification is logged and the article kept. The reader is left
    /// positioned at the first body byte.
    pub fn load<R: BufRead + Seek>(&mut self, reader: &mut R) -> Result<bool> {
        let mut header_found = false;
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line == b"\n" || line == b"\r\n" {
                header_found = true;
                break;
            }
            let text = String::from_utf8_lossy(&line);
            let lower = text.to_ascii_lowercase();
            if lower.starts_with("subject:") {
                self.subject = header_value(&text);
            } else if lower.starts_with("path:") {
                self.path = header_value(&text);
            } else if lower.starts_with("date:") {
                self.sent = parse_date(&header_value(&text));
            } else if lower.starts_with("from:") {
                let value = header_value(&text);
                match value.split_once(" <") {
                    Some((sender, email)) => {
                        self.sender = sender.to_string();
                        self.email = email.replace('>', "");
                    }
                    None => self.sender = value.clone(),
                }
            } else if lower.starts_with("references:") {
                if let Some(parent) = text.split_whitespace().nth(1) {
                    self.parent = parent.to_string();
                }
            } else if lower.starts_with("newsgroups:") {
                let value = header_value(&text);
                if value.contains(';') {
                    for group in value.split(';') {
                        if group.starts_with("overchan.") {
                            self.groups.push(group.to_string());
                        }
                    }
                } else if !value.is_empty() {
                    self.groups.push(value);
                }
            } else if lower.starts_with("x-sage:") {
                self.sage = true;
            } else if lower.starts_with("x-pubkey-ed25519:") {
                self.pubkey = header_value(&lower);
            } else if lower.starts_with("x-signature-ed25519-sha512:") {
                self.sig = Some(header_value(&lower));
            }
        }
        if !header_found {
            warn!("{} malformed article", self.message_id);
            return Ok(false);
        }
        if let Some(sig) = &self.sig {
            if sig.len() != 128 || self.pubkey.len() != 64 {
                debug!(
                    "{} dropping signature material with lengths {}/{}",
                    self.message_id,
                    self.pubkey.len(),
                    sig.len()
                );
                self.pubkey.clear();
            }
        }
        if !self.pubkey.is_empty() {
            let digest = hash_body(reader)?;
            match self.verify(&digest) {
                Ok(()) => debug!("{} valid signature", self.message_id),
                Err(e) => warn!("{} failed to validate: {}", self.message_id, e),
            }
        }
        Ok(true)
    }

    fn verify(&self, digest: &[u8]) -> Result<()> {
        let bad = |what: &str| NntpdError::BadSignature(format!("{}: {}", self.message_id, what));
        let pk: [u8; 32] = hex::decode(&self.pubkey)
            .map_err(|_| bad("pubkey not hex"))?
            .try_into()
            .map_err(|_| bad("pubkey wrong length"))?;
        let sig: [u8; 64] = hex::decode(self.sig.as_deref().unwrap_or(""))
            .map_err(|_| bad("signature not hex"))?
            .try_into()
            .map_err(|_| bad("signature wrong length"))?;
        let key = VerifyingKey::from_bytes(&pk).map_err(|_| bad("invalid pubkey"))?;
        key.verify(digest, &Signature::from_bytes(&sig))
            .map_err(|_| bad("verification failed"))
    }
}

fn header_value(line: &str) -> String {
    line.split_once(' ')
        .map(|(_, rest)| rest)
        .unwrap_or("")
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// RFC 2822 date with timezone offset to unix seconds; now() when unparseable
fn parse_date(value: &str) -> i64 {
    match DateTime::parse_from_rfc2822(value) {
        Ok(dt) => dt.timestamp(),
        Err(_) => Utc::now().timestamp(),
    }
}

/// SHA-512 over the canonicalised body
///
/// Every body line except the last has its trailing `\n` rewritten to `\r\n`
/// before hashing; the last line is hashed without any trailing `\r\n`. The
/// reader is seeked back to the first body byte afterwards. This shape is what
/// remote instances sign, so it must not change.
fn hash_body<R: BufRead + Seek>(reader: &mut R) -> Result<Vec<u8>> {
    let body_offset = reader.stream_position()?;
    let mut hasher = Sha512::new();
    let mut prev: Option<Vec<u8>> = None;
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if let Some(p) = prev.take() {
            hasher.update(&p);
        }
        prev = Some(crlf_line(&line));
    }
    if let Some(mut last) = prev {
        if last.ends_with(b"\r\n") {
            last.truncate(last.len() - 2);
        }
        hasher.update(&last);
    }
    reader.seek(SeekFrom::Start(body_offset))?;
    Ok(hasher.finalize().to_vec())
}

fn crlf_line(line: &[u8]) -> Vec<u8> {
    match line.strip_suffix(b"\n") {
        Some(rest) => {
            let mut out = rest.to_vec();
            out.extend_from_slice(b"\r\n");
            out
        }
        None => line.to_vec(),
    }
}
