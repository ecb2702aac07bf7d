use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload a single frame may declare.
pub const MAX_MESSAGE_LENGTH: i64 = 1 << 32;

/// Messages exchanged between client and proxy over tunnel streams.
///
/// Each variant maps to a single byte on the wire; a frame is
/// `TYPE (1) | LENGTH (8, big-endian signed) | PAYLOAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Client announces its FQDN and authenticates.
    NewMachine,
    /// Proxy confirms the handshake.
    NewMachineOk,
    /// Client adds a scrape process.
    Register,
    /// Client removes a scrape process.
    Deregister,
    /// Proxy asks the client to open a new scrape stream.
    ReqScrapeConn,
    /// Preamble identifying a fresh scrape stream.
    NewScrapeConn,
}

impl MsgType {
    pub fn wire_byte(self) -> u8 {
        match self {
            MsgType::NewMachine => b'm',
            MsgType::NewMachineOk => b'o',
            MsgType::Register => b'r',
            MsgType::Deregister => b'd',
            MsgType::ReqScrapeConn => b's',
            MsgType::NewScrapeConn => b'c',
        }
    }

    pub fn from_wire_byte(byte: u8) -> Option<Self> {
        match byte {
            b'm' => Some(MsgType::NewMachine),
            b'o' => Some(MsgType::NewMachineOk),
            b'r' => Some(MsgType::Register),
            b'd' => Some(MsgType::Deregister),
            b's' => Some(MsgType::ReqScrapeConn),
            b'c' => Some(MsgType::NewScrapeConn),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgType::NewMachine => "newMachine",
            MsgType::NewMachineOk => "newMachineOK",
            MsgType::Register => "register",
            MsgType::Deregister => "deregister",
            MsgType::ReqScrapeConn => "reqScrapeConn",
            MsgType::NewScrapeConn => "newScrapeConn",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unknown message type byte {0:#04x}")]
    BadType(u8),
    #[error("message length {0} exceeds the limit")]
    LengthTooLarge(i64),
    #[error("negative message length {0}")]
    BadLength(i64),
    #[error("message payload truncated")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn map_truncated(err: io::Error) -> MessageError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        MessageError::Truncated
    } else {
        MessageError::Io(err)
    }
}

/// Reads one frame, retrying short reads until the declared payload is
/// complete. The payload buffer is only allocated after the length has
/// been validated.
pub async fn read_frame<R>(reader: &mut R) -> Result<(MsgType, Vec<u8>), MessageError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag).await?;
    let typ = MsgType::from_wire_byte(tag[0]).ok_or(MessageError::BadType(tag[0]))?;

    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes).await.map_err(map_truncated)?;
    let length = i64::from_be_bytes(len_bytes);
    if length > MAX_MESSAGE_LENGTH {
        return Err(MessageError::LengthTooLarge(length));
    }
    if length < 0 {
        return Err(MessageError::BadLength(length));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await.map_err(map_truncated)?;
    Ok((typ, payload))
}

/// Writes a whole frame in one write.
pub async fn write_frame<W>(writer: &mut W, typ: MsgType, payload: &[u8]) -> Result<(), MessageError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut frame = Vec::with_capacity(1 + 8 + payload.len());
    frame.push(typ.wire_byte());
    frame.extend_from_slice(&(payload.len() as i64).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Handshake payload carried by a `newMachine` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClientMessage {
    pub fqdn: String,
    pub timestamp: i64,
    pub auth: String,
}
