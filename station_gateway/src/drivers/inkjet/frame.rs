//! Inkjet wire framing: one marker byte, a big-endian `u16` total length
//! (header included), then a UTF-8 JSON body.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_MARKER: u8 = 0x8C;
pub const HEADER_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InkjetRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl InkjetRequest {
    pub fn new(command: impl Into<String>) -> Self {
        InkjetRequest {
            command: command.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Device reply. A non-zero `code` is a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InkjetResponse {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl InkjetResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        InkjetResponse {
            code: 0,
            message: "ok".to_string(),
            data: Some(data),
        }
    }

    /// `data` of a successful reply, or the protocol error it carries.
    pub fn into_result(self) -> GatewayResult<serde_json::Value> {
        if self.code != 0 {
            return Err(GatewayError::Protocol {
                code: self.code,
                message: self.message,
            });
        }
        Ok(self.data.unwrap_or(serde_json::Value::Null))
    }
}

pub fn encode_frame<T: Serialize>(body: &T) -> GatewayResult<Vec<u8>> {
    let json = serde_json::to_vec(body)?;
    let total = HEADER_LEN + json.len();
    let len = u16::try_from(total)
        .map_err(|_| GatewayError::InvalidValue(format!("frame of {} bytes exceeds 65535", total)))?;
    let mut frame = Vec::with_capacity(total);
    frame.push(FRAME_MARKER);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Read one frame and return its JSON body bytes.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> GatewayResult<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    if header[0] != FRAME_MARKER {
        return Err(GatewayError::Connection(format!(
            "bad frame marker {:#04x}",
            header[0]
        )));
    }
    let total = u16::from_be_bytes([header[1], header[2]]) as usize;
    if total < HEADER_LEN {
        return Err(GatewayError::Connection(format!("frame length {} below header size", total)));
    }
    let mut body = vec![0u8; total - HEADER_LEN];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn write_frame<W, T>(writer: &mut W, body: &T) -> GatewayResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(body)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
