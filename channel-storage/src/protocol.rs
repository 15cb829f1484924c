//! Newline-delimited JSON protocol spoken between clients and store nodes.
//!
//! Every request gets exactly one response on the same connection, in order.
//! Keys and values are raw bytes; JSON carries them as arrays of numbers so
//! arbitrary binary content never collides with the line framing.

use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub type LeaseId = u64;
pub type Revision = u64;

/// A stored entry together with the revisions that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Revision at which the key was (last) created.
    pub create_revision: Revision,
    /// Revision of the latest write to the key.
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

/// A guard evaluated inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Compare {
    /// Key is present and holds exactly `value`.
    Value { key: Vec<u8>, value: Vec<u8> },
    /// Key is absent.
    Absent { key: Vec<u8> },
    /// Key is present and was created at `revision`.
    CreateRevision { key: Vec<u8>, revision: Revision },
}

/// A write applied when every guard of a transaction holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxnOp {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: Vec<u8>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Get {
        key: Vec<u8>,
    },
    Range {
        prefix: Vec<u8>,
    },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: Vec<u8>,
    },
    Txn {
        compare: Vec<Compare>,
        success: Vec<TxnOp>,
    },
    LeaseGrant {
        ttl_ms: u64,
    },
    LeaseKeepAlive {
        lease: LeaseId,
    },
    LeaseRevoke {
        lease: LeaseId,
    },
    /// Parks until `key` is absent or `timeout_ms` elapses.
    WaitDeleted {
        key: Vec<u8>,
        timeout_ms: u64,
    },
    Status,
}

impl Request {
    /// Short name used in logs and error messages.
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Get { .. } => "get",
            Request::Range { .. } => "range",
            Request::Put { .. } => "put",
            Request::Delete { .. } => "delete",
            Request::Txn { .. } => "txn",
            Request::LeaseGrant { .. } => "lease_grant",
            Request::LeaseKeepAlive { .. } => "lease_keep_alive",
            Request::LeaseRevoke { .. } => "lease_revoke",
            Request::WaitDeleted { .. } => "wait_deleted",
            Request::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Value {
        kv: Option<KeyValue>,
    },
    Range {
        kvs: Vec<KeyValue>,
    },
    Done {
        revision: Revision,
    },
    Txn {
        succeeded: bool,
        revision: Revision,
    },
    Lease {
        lease: LeaseId,
        ttl_ms: u64,
    },
    Revoked {
        revision: Revision,
    },
    Wait {
        deleted: bool,
    },
    Status {
        member: String,
        revision: Revision,
        keys: usize,
        leases: usize,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    LeaseNotFound,
    InvalidRequest,
    Unavailable,
}

/// Messages exchanged on the peer port between cluster members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Hello { member: String, token: String },
    Welcome { member: String },
    Rejected { reason: String },
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // One write per message so a reply is never interleaved with another.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binary_values_survive_line_framing() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let request = Request::Put {
            key: b"key\nwith-newline".to_vec(),
            value: vec![0, 10, 13, 255],
            lease: Some(7),
        };

        write_message(&mut writer, &request)
            .await
            .expect("write message");
        let parsed = read_message::<_, Request>(&mut reader)
            .await
            .expect("read message")
            .expect("expected message");

        assert_eq!(request, parsed);
    }

    #[tokio::test]
    async fn eof_reads_as_none() {
        let (writer, reader) = tokio::io::duplex(64);
        drop(writer);
        let mut reader = tokio::io::BufReader::new(reader);

        let parsed = read_message::<_, Response>(&mut reader)
            .await
            .expect("read message");
        assert!(parsed.is_none());
    }

    #[test]
    fn requests_are_tagged_by_type() {
        let json = serde_json::to_string(&Request::Get { key: b"k".to_vec() }).unwrap();
        assert_eq!(json, r#"{"type":"get","key":[107]}"#);
    }
}
