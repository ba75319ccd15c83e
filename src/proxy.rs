//! Upstream forwarding for the proxy and diff listener modes.
//!
//! One upstream connection per client connection, re-established lazily when
//! it breaks. Diff mode compares the local and upstream replies after
//! stripping fields that legitimately differ between servers.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{CodecError, Error, Result};
use crate::protocol::{HEADER_LEN, MAX_MESSAGE_LEN, MessageHeader, OP_MSG, OP_REPLY, decode_op_msg, decode_op_reply};
use crate::types::{Document, Value};

/// Reply fields that differ between servers without being divergences.
const IGNORED_FIELDS: &[&str] = &[
    "$clusterTime",
    "operationTime",
    "topologyVersion",
    "localTime",
    "connectionId",
];

pub struct ProxyClient {
    addr: String,
    timeout: Duration,
    stream: Arc<Mutex<Option<TcpStream>>>,
}

impl ProxyClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            stream: Arc::new(Mutex::new(None)),
        }
    }

    /// Send an already-encoded request and return the complete reply message
    /// (header included). The upstream connection is serialised per client.
    pub async fn forward_raw(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = timeout(self.timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| Error::Msg(format!("upstream connect timeout: {}", self.addr)))??;
            *guard = Some(stream);
        }
        let stream = guard.as_mut().expect("connected above");

        let result = Self::exchange(stream, request, self.timeout).await;
        if result.is_err() {
            // Connection likely broken; reconnect on the next attempt.
            *guard = None;
        }
        result
    }

    async fn exchange(
        stream: &mut TcpStream,
        request: &[u8],
        dur: Duration,
    ) -> Result<Vec<u8>> {
        timeout(dur, stream.write_all(request))
            .await
            .map_err(|_| Error::Msg("upstream send timeout".into()))??;
        timeout(dur, stream.flush())
            .await
            .map_err(|_| Error::Msg("upstream flush timeout".into()))??;

        let mut header_buf = [0u8; HEADER_LEN];
        timeout(dur, stream.read_exact(&mut header_buf))
            .await
            .map_err(|_| Error::Msg("upstream recv timeout".into()))??;
        let (header, _) = MessageHeader::parse(&header_buf)
            .ok_or_else(|| Error::from(CodecError::malformed("invalid upstream header")))?;
        if (header.message_length as usize) < HEADER_LEN
            || header.message_length as usize > MAX_MESSAGE_LEN
        {
            return Err(CodecError::malformed("invalid upstream reply length").into());
        }

        let mut reply = Vec::with_capacity(header.message_length as usize);
        reply.extend_from_slice(&header_buf);
        let mut body = vec![0u8; header.message_length as usize - HEADER_LEN];
        timeout(dur, stream.read_exact(&mut body))
            .await
            .map_err(|_| Error::Msg("upstream recv timeout".into()))??;
        reply.extend_from_slice(&body);
        Ok(reply)
    }
}

/// Pull the first reply document out of a raw upstream message for diffing.
pub fn reply_document(reply: &[u8]) -> Result<Option<Document>> {
    let (header, _) = MessageHeader::parse(reply)
        .ok_or_else(|| Error::from(CodecError::malformed("short upstream reply")))?;
    let body = &reply[HEADER_LEN..];
    match header.op_code {
        OP_MSG => Ok(Some(decode_op_msg(&reply[..HEADER_LEN], body)?.into_command()?)),
        OP_REPLY => Ok(decode_op_reply(body)?.documents.into_iter().next()),
        _ => Ok(None),
    }
}

pub struct DiffResult {
    pub matched: bool,
    pub summary: String,
    pub details: Option<String>,
}

/// Compare two reply documents, ignoring the volatile fields at every level.
pub fn compare_replies(ours: &Document, theirs: &Document) -> DiffResult {
    let mut diffs: Vec<String> = Vec::new();
    diff_documents("", ours, theirs, &mut diffs);
    let matched = diffs.is_empty();
    let summary = if matched {
        "match".to_string()
    } else {
        format!("{} diffs", diffs.len())
    };
    let details = if matched { None } else { Some(diffs.join("; ")) };
    DiffResult {
        matched,
        summary,
        details,
    }
}

fn diff_documents(prefix: &str, ours: &Document, theirs: &Document, diffs: &mut Vec<String>) {
    let mut keys: Vec<&String> = ours.keys().collect();
    for key in theirs.keys() {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    for key in keys {
        if IGNORED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match (ours.get(key), theirs.get(key)) {
            (None, Some(_)) => diffs.push(format!("missing key in ours: {path}")),
            (Some(_), None) => diffs.push(format!("extra key in ours: {path}")),
            (Some(a), Some(b)) => diff_values(&path, a, b, diffs),
            (None, None) => {}
        }
    }
}

fn diff_values(path: &str, a: &Value, b: &Value, diffs: &mut Vec<String>) {
    match (a, b) {
        (Value::Document(da), Value::Document(db)) => diff_documents(path, da, db, diffs),
        (Value::Array(aa), Value::Array(ab)) => {
            if aa.len() != ab.len() {
                diffs.push(format!(
                    "{path}: array length {} vs {}",
                    aa.len(),
                    ab.len()
                ));
                return;
            }
            for (i, (ea, eb)) in aa.iter().zip(ab.iter()).enumerate() {
                diff_values(&format!("{path}.{i}"), ea, eb, diffs);
            }
        }
        _ => {
            if a != b {
                diffs.push(format!("{path}: ours={a:?} theirs={b:?}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_identical_replies_match() {
        let a = doc! {"ok": 1.0, "n": 3i32};
        let result = compare_replies(&a, &a.clone());
        assert!(result.matched);
        assert_eq!(result.summary, "match");
    }

    #[test]
    fn test_ignored_fields_do_not_diff() {
        let ours = doc! {"ok": 1.0, "localTime": Value::DateTime(1)};
        let theirs = doc! {"ok": 1.0, "localTime": Value::DateTime(999), "connectionId": 4i32};
        assert!(compare_replies(&ours, &theirs).matched);
    }

    #[test]
    fn test_nested_divergence_reported_with_path() {
        let ours = doc! {"cursor": doc! {"id": 0i64, "ns": "a.b"}, "ok": 1.0};
        let theirs = doc! {"cursor": doc! {"id": 0i64, "ns": "a.c"}, "ok": 1.0};
        let result = compare_replies(&ours, &theirs);
        assert!(!result.matched);
        assert!(result.details.unwrap().contains("cursor.ns"));
    }

    #[test]
    fn test_array_length_mismatch() {
        let ours = doc! {"values": vec![1i32, 2i32]};
        let theirs = doc! {"values": vec![1i32]};
        assert!(!compare_replies(&ours, &theirs).matched);
    }
}
