//! Binary framing for peer connections.
//!
//! ```text
//! magic (4) | command (12, ASCII, NUL padded) | length u32 LE | checksum (4) | payload
//! ```
//!
//! `checksum` is the first four bytes of `sha256(sha256(payload))`. Payloads
//! are JSON. A frame that fails any check is reported as
//! [`Decoded::Dropped`]; the reader resynchronises on the next magic and the
//! connection stays open.

use cinder_consensus::Block;
use cinder_ledger::Transaction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, Read};

pub const MAGIC: [u8; 4] = [0x54, 0x70, 0xC1, 0xD3];
pub const COMMAND_LEN: usize = 12;
pub const HEADER_LEN: usize = 4 + COMMAND_LEN + 4 + 4;
pub const MAX_PAYLOAD: usize = 10 * 1024 * 1024;
pub const PROTOCOL_VERSION: u32 = 1;

const MAX_ADDR: usize = 1000;
const MAX_INV: usize = 5000;
const MAX_NODE_ID_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("bad magic, skipped {skipped} bytes")]
    BadMagic { skipped: usize },
    #[error("payload of {0} bytes exceeds limit")]
    Oversize(usize),
    #[error("checksum mismatch on {command}")]
    ChecksumMismatch { command: String },
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum Decoded {
    Frame(RawFrame),
    Dropped(WireError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionPayload {
    pub version: u32,
    pub node_id: String,
    pub listen_addr: String,
    pub height: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvPayload {
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub txs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetBlocksPayload {
    pub from_index: u64,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionPayload),
    Verack,
    GetAddr,
    Addr(Vec<PeerAddr>),
    Inv(InvPayload),
    Block(Block),
    Tx(Transaction),
    GetBlocks(GetBlocksPayload),
    Ping(PingPayload),
    Pong(PingPayload),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::GetBlocks(_) => "getblocks",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
        }
    }

    fn payload(&self) -> Result<Vec<u8>, WireError> {
        let bytes = match self {
            Message::Version(v) => serde_json::to_vec(v)?,
            Message::Verack | Message::GetAddr => Vec::new(),
            Message::Addr(addrs) => serde_json::to_vec(addrs)?,
            Message::Inv(inv) => serde_json::to_vec(inv)?,
            Message::Block(block) => serde_json::to_vec(block)?,
            Message::Tx(tx) => serde_json::to_vec(tx)?,
            Message::GetBlocks(req) => serde_json::to_vec(req)?,
            Message::Ping(p) | Message::Pong(p) => serde_json::to_vec(p)?,
        };
        Ok(bytes)
    }
}

pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[..4]);
    out
}

pub fn encode_frame(command: &str, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if command.is_empty()
        || command.len() > COMMAND_LEN
        || !command.bytes().all(|b| b.is_ascii_graphic())
    {
        return Err(WireError::MalformedMessage(format!(
            "invalid command {command:?}"
        )));
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::Oversize(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    let mut cmd = [0u8; COMMAND_LEN];
    cmd[..command.len()].copy_from_slice(command.as_bytes());
    out.extend_from_slice(&cmd);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(payload));
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_message(msg: &Message) -> Result<Vec<u8>, WireError> {
    encode_frame(msg.command(), &msg.payload()?)
}

fn parse_command(raw: &[u8]) -> Result<String, WireError> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let (name, padding) = raw.split_at(end);
    if name.is_empty()
        || !name.iter().all(|b| b.is_ascii_graphic())
        || padding.iter().any(|b| *b != 0)
    {
        return Err(WireError::MalformedMessage(format!(
            "bad command bytes {}",
            hex::encode(raw)
        )));
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

/// Pulls frames off a byte stream, resynchronising after garbage.
pub struct FrameReader<R> {
    inner: R,
    magic_consumed: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            magic_consumed: false,
        }
    }

    /// Next frame or drop notice. I/O errors (including EOF) end the stream.
    pub fn next_frame(&mut self) -> io::Result<Decoded> {
        if !self.magic_consumed {
            let mut window = [0u8; 4];
            self.inner.read_exact(&mut window)?;
            if window != MAGIC {
                let skipped = self.resync(window)?;
                self.magic_consumed = true;
                return Ok(Decoded::Dropped(WireError::BadMagic { skipped }));
            }
        }
        self.magic_consumed = false;

        let mut header = [0u8; HEADER_LEN - 4];
        self.inner.read_exact(&mut header)?;
        let raw_command = &header[..COMMAND_LEN];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[COMMAND_LEN..COMMAND_LEN + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut expected = [0u8; 4];
        expected.copy_from_slice(&header[COMMAND_LEN + 4..]);

        if len > MAX_PAYLOAD {
            return Ok(Decoded::Dropped(WireError::Oversize(len)));
        }
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;

        let command = match parse_command(raw_command) {
            Ok(command) => command,
            Err(err) => return Ok(Decoded::Dropped(err)),
        };
        if checksum(&payload) != expected {
            return Ok(Decoded::Dropped(WireError::ChecksumMismatch { command }));
        }
        Ok(Decoded::Frame(RawFrame { command, payload }))
    }

    /// Slide one byte at a time until the window holds the magic.
    fn resync(&mut self, mut window: [u8; 4]) -> io::Result<usize> {
        let mut skipped = 0usize;
        let mut byte = [0u8; 1];
        while window != MAGIC {
            self.inner.read_exact(&mut byte)?;
            window.copy_within(1.., 0);
            window[3] = byte[0];
            skipped += 1;
        }
        Ok(skipped)
    }
}

fn json_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(payload)?)
}

pub fn decode_message(frame: &RawFrame) -> Result<Message, WireError> {
    let payload = frame.payload.as_slice();
    let msg = match frame.command.as_str() {
        "version" => Message::Version(json_payload(payload)?),
        "verack" => Message::Verack,
        "getaddr" => Message::GetAddr,
        "addr" => Message::Addr(json_payload(payload)?),
        "inv" => Message::Inv(json_payload(payload)?),
        "block" => Message::Block(json_payload(payload)?),
        "tx" => Message::Tx(json_payload(payload)?),
        "getblocks" => Message::GetBlocks(json_payload(payload)?),
        "ping" => Message::Ping(json_payload(payload)?),
        "pong" => Message::Pong(json_payload(payload)?),
        other => return Err(WireError::UnknownCommand(other.to_string())),
    };
    validate_message(&msg)?;
    Ok(msg)
}

fn validate_message(msg: &Message) -> Result<(), WireError> {
    match msg {
        Message::Version(v) => {
            if v.node_id.is_empty() || v.node_id.len() > MAX_NODE_ID_LEN {
                return Err(WireError::MalformedMessage(
                    "invalid nodeId length".to_string(),
                ));
            }
        }
        Message::Addr(addrs) => {
            if addrs.len() > MAX_ADDR {
                return Err(WireError::MalformedMessage("addr list too large".to_string()));
            }
        }
        Message::Inv(inv) => {
            if inv.blocks.len() > MAX_INV || inv.txs.len() > MAX_INV {
                return Err(WireError::MalformedMessage("inv list too large".to_string()));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Decode exactly one frame from `data`.
pub fn parse_message_bytes(data: &[u8]) -> Result<Message, WireError> {
    let mut reader = FrameReader::new(data);
    match reader.next_frame() {
        Ok(Decoded::Frame(frame)) => decode_message(&frame),
        Ok(Decoded::Dropped(err)) => Err(err),
        Err(err) => Err(WireError::MalformedMessage(err.to_string())),
    }
}
