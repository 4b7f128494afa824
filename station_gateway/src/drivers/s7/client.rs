//! Minimal S7 client over ISO-on-TCP (RFC 1006).
//!
//! Frames are TPKT (4 bytes) + COTP + S7 PDU. Only what the driver needs is
//! implemented: connection request, setup communication, and single-item
//! ReadVar/WriteVar on byte and bit transport sizes.

use crate::drivers::s7::address::{S7Area, ADDRESS_LIMIT};
use crate::drivers::traits::DriverResult;
use crate::error::GatewayError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const TPKT_VERSION: u8 = 0x03;
const COTP_CR: u8 = 0xE0;
const COTP_CC: u8 = 0xD0;
const COTP_DT: u8 = 0xF0;
const S7_PROTOCOL_ID: u8 = 0x32;
const S7_JOB: u8 = 0x01;
const S7_ACK_DATA: u8 = 0x03;
const FN_SETUP_COMM: u8 = 0xF0;
const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;
const TS_BIT: u8 = 0x01;
const TS_BYTE: u8 = 0x02;
const DATA_TS_BIT: u8 = 0x03;
const DATA_TS_BYTE: u8 = 0x04;
const RETURN_OK: u8 = 0xFF;

// ack header 12 + param 2 + item header 4
const READ_OVERHEAD: usize = 18;
// job header 10 + param 14 + item header 4, with headroom
const WRITE_OVERHEAD: usize = 35;

/// Raw memory access used by the S7 driver. Implemented over TCP by
/// [`IsoTcpClient`]; alternative transports plug in through this trait.
#[async_trait]
pub trait S7Transport: Send + Sync {
    async fn connect(&mut self) -> DriverResult<()>;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Read `len` bytes starting at `start`.
    async fn read_area(&mut self, area: S7Area, db: u16, start: u32, len: usize)
        -> DriverResult<Vec<u8>>;

    async fn write_area(&mut self, area: S7Area, db: u16, start: u32, data: &[u8])
        -> DriverResult<()>;

    async fn write_bit(&mut self, area: S7Area, db: u16, byte: u32, bit: u8, value: bool)
        -> DriverResult<()>;
}

#[derive(Debug, Clone)]
pub struct IsoTcpOptions {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    pub pdu_size: u16,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

pub struct IsoTcpClient {
    options: IsoTcpOptions,
    stream: Option<TcpStream>,
    pdu_len: usize,
    pdu_ref: u16,
}

impl IsoTcpClient {
    pub fn new(options: IsoTcpOptions) -> Self {
        let pdu_len = options.pdu_size as usize;
        IsoTcpClient {
            options,
            stream: None,
            pdu_len,
            pdu_ref: 0,
        }
    }

    /// PDU length negotiated with the CPU.
    pub fn pdu_len(&self) -> usize {
        self.pdu_len
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    fn remote_tsap(&self) -> u16 {
        0x0100 | (((self.options.rack as u16) << 5) | self.options.slot as u16)
    }

    fn connection_request(&self) -> Vec<u8> {
        let tsap = self.remote_tsap();
        let cotp = [
            0x11, COTP_CR, 0x00, 0x00, 0x00, 0x01, 0x00, // li, type, dst ref, src ref, class
            0xC0, 0x01, 0x0A, // tpdu size 1024
            0xC1, 0x02, 0x01, 0x00, // calling tsap
            0xC2, 0x02, (tsap >> 8) as u8, tsap as u8, // called tsap
        ];
        let mut frame = Vec::with_capacity(4 + cotp.len());
        put_tpkt(&mut frame, 4 + cotp.len());
        frame.extend_from_slice(&cotp);
        frame
    }

    /// Send one frame and read the matching response frame.
    async fn exchange(&mut self, frame: &[u8]) -> DriverResult<Vec<u8>> {
        let io_timeout = self.options.io_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| GatewayError::Connection("S7 session not established".to_string()))?;
        let result = timeout(io_timeout, async {
            stream.write_all(frame).await?;
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).await?;
            if header[0] != TPKT_VERSION {
                return Err(GatewayError::Connection(format!(
                    "unexpected TPKT version {:#04x}",
                    header[0]
                )));
            }
            let total = u16::from_be_bytes([header[2], header[3]]) as usize;
            if total < 7 {
                return Err(GatewayError::Connection(format!("TPKT length {} too short", total)));
            }
            let mut body = vec![0u8; total - 4];
            stream.read_exact(&mut body).await?;
            Ok(body)
        })
        .await;

        match result {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => {
                self.stream = None;
                Err(e)
            }
            Err(_) => {
                self.stream = None;
                Err(GatewayError::Timeout(format!(
                    "no S7 response within {} ms",
                    io_timeout.as_millis()
                )))
            }
        }
    }

    /// Send an S7 job and return `(param, data)` of the AckData response.
    async fn job(&mut self, param: &[u8], data: &[u8]) -> DriverResult<(Vec<u8>, Vec<u8>)> {
        let pdu_ref = self.next_ref();
        let mut frame = Vec::with_capacity(4 + 3 + 10 + param.len() + data.len());
        put_tpkt(&mut frame, 4 + 3 + 10 + param.len() + data.len());
        frame.extend_from_slice(&[0x02, COTP_DT, 0x80]);
        frame.extend_from_slice(&[S7_PROTOCOL_ID, S7_JOB, 0x00, 0x00]);
        frame.extend_from_slice(&pdu_ref.to_be_bytes());
        frame.extend_from_slice(&(param.len() as u16).to_be_bytes());
        frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
        frame.extend_from_slice(param);
        frame.extend_from_slice(data);

        let body = self.exchange(&frame).await?;
        // COTP DT header: li (2), type, eot
        if body.len() < 3 || body[1] != COTP_DT {
            self.stream = None;
            return Err(GatewayError::Connection("expected COTP data TPDU".to_string()));
        }
        let s7 = &body[3..];
        if s7.len() < 12 || s7[0] != S7_PROTOCOL_ID || s7[1] != S7_ACK_DATA {
            return Err(GatewayError::Protocol {
                code: -1,
                message: "malformed S7 AckData header".to_string(),
            });
        }
        let resp_ref = u16::from_be_bytes([s7[4], s7[5]]);
        if resp_ref != pdu_ref {
            self.stream = None;
            return Err(GatewayError::Connection(format!(
                "PDU reference mismatch: sent {}, got {}",
                pdu_ref, resp_ref
            )));
        }
        let (err_class, err_code) = (s7[10], s7[11]);
        if err_class != 0 || err_code != 0 {
            return Err(GatewayError::Protocol {
                code: ((err_class as i64) << 8) | err_code as i64,
                message: format!("S7 error class {:#04x} code {:#04x}", err_class, err_code),
            });
        }
        let param_len = u16::from_be_bytes([s7[6], s7[7]]) as usize;
        let data_len = u16::from_be_bytes([s7[8], s7[9]]) as usize;
        if s7.len() < 12 + param_len + data_len {
            return Err(GatewayError::Protocol {
                code: -1,
                message: "truncated S7 response".to_string(),
            });
        }
        Ok((
            s7[12..12 + param_len].to_vec(),
            s7[12 + param_len..12 + param_len + data_len].to_vec(),
        ))
    }

    async fn read_chunk(&mut self, area: S7Area, db: u16, start: u32, len: usize) -> DriverResult<Vec<u8>> {
        let param = var_spec(FN_READ_VAR, TS_BYTE, len as u16, area, db, start * 8);
        let (_, data) = self.job(&param, &[]).await?;
        if data.len() < 4 {
            return Err(GatewayError::Protocol {
                code: -1,
                message: "empty ReadVar response".to_string(),
            });
        }
        check_return_code(data[0])?;
        let size = match data[1] {
            DATA_TS_BIT | DATA_TS_BYTE => (u16::from_be_bytes([data[2], data[3]]) as usize + 7) / 8,
            _ => u16::from_be_bytes([data[2], data[3]]) as usize,
        };
        let payload = &data[4..];
        if payload.len() < size || size < len {
            return Err(GatewayError::Protocol {
                code: -1,
                message: format!("ReadVar returned {} bytes, expected {}", payload.len().min(size), len),
            });
        }
        Ok(payload[..len].to_vec())
    }

    async fn write_item(&mut self, param: Vec<u8>, data_ts: u8, bits: u16, payload: &[u8]) -> DriverResult<()> {
        let mut data = Vec::with_capacity(4 + payload.len());
        data.push(0x00);
        data.push(data_ts);
        data.extend_from_slice(&bits.to_be_bytes());
        data.extend_from_slice(payload);
        let (_, resp) = self.job(&param, &data).await?;
        let code = resp.first().copied().ok_or_else(|| GatewayError::Protocol {
            code: -1,
            message: "empty WriteVar response".to_string(),
        })?;
        check_return_code(code)
    }
}

#[async_trait]
impl S7Transport for IsoTcpClient {
    async fn connect(&mut self) -> DriverResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = format!("{}:{}", self.options.host, self.options.port);
        let stream = timeout(self.options.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| GatewayError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| GatewayError::Connection(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        let cr = self.connection_request();
        let cc = self.exchange(&cr).await?;
        if cc.len() < 2 || cc[1] & 0xF0 != COTP_CC {
            self.stream = None;
            return Err(GatewayError::Connection(format!(
                "{}: COTP connection refused",
                addr
            )));
        }

        let mut param = vec![FN_SETUP_COMM, 0x00, 0x00, 0x01, 0x00, 0x01];
        param.extend_from_slice(&self.options.pdu_size.to_be_bytes());
        match self.job(&param, &[]).await {
            Ok((resp, _)) if resp.len() >= 8 => {
                self.pdu_len = u16::from_be_bytes([resp[6], resp[7]]) as usize;
            }
            Ok(_) => warn!("Short setup-communication response, keeping PDU {}", self.pdu_len),
            Err(e) => {
                self.stream = None;
                return Err(GatewayError::Connection(format!("{}: setup communication failed: {}", addr, e)));
            }
        }
        info!(
            address = %addr,
            rack = self.options.rack,
            slot = self.options.slot,
            pdu = self.pdu_len,
            "S7 session established"
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_area(&mut self, area: S7Area, db: u16, start: u32, len: usize) -> DriverResult<Vec<u8>> {
        check_range(start, len)?;
        let max_chunk = self.pdu_len.saturating_sub(READ_OVERHEAD).max(1);
        let mut out = Vec::with_capacity(len);
        let mut offset = 0usize;
        while offset < len {
            let chunk = (len - offset).min(max_chunk);
            let bytes = self.read_chunk(area, db, start + offset as u32, chunk).await?;
            out.extend_from_slice(&bytes);
            offset += chunk;
        }
        debug!(%area, db, start, len, "S7 read");
        Ok(out)
    }

    async fn write_area(&mut self, area: S7Area, db: u16, start: u32, data: &[u8]) -> DriverResult<()> {
        check_range(start, data.len())?;
        let max_chunk = self.pdu_len.saturating_sub(WRITE_OVERHEAD).max(1);
        for (i, chunk) in data.chunks(max_chunk).enumerate() {
            let at = start + (i * max_chunk) as u32;
            let param = var_spec(FN_WRITE_VAR, TS_BYTE, chunk.len() as u16, area, db, at * 8);
            self.write_item(param, DATA_TS_BYTE, (chunk.len() * 8) as u16, chunk).await?;
        }
        Ok(())
    }

    async fn write_bit(&mut self, area: S7Area, db: u16, byte: u32, bit: u8, value: bool) -> DriverResult<()> {
        check_range(byte, 1)?;
        let param = var_spec(FN_WRITE_VAR, TS_BIT, 1, area, db, byte * 8 + bit as u32);
        self.write_item(param, DATA_TS_BIT, 1, &[value as u8]).await
    }
}

/// Reject byte ranges the 24-bit bit address cannot express.
fn check_range(start: u32, len: usize) -> DriverResult<()> {
    if u64::from(start) + len as u64 > u64::from(ADDRESS_LIMIT) {
        return Err(GatewayError::InvalidValue(format!(
            "{} bytes at offset {} exceed the S7 address range",
            len, start
        )));
    }
    Ok(())
}

fn put_tpkt(frame: &mut Vec<u8>, total: usize) {
    frame.push(TPKT_VERSION);
    frame.push(0x00);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
}

/// ReadVar/WriteVar parameter block with a single S7ANY item.
fn var_spec(function: u8, transport: u8, count: u16, area: S7Area, db: u16, bit_address: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(14);
    p.extend_from_slice(&[function, 0x01, 0x12, 0x0A, 0x10, transport]);
    p.extend_from_slice(&count.to_be_bytes());
    p.extend_from_slice(&db.to_be_bytes());
    p.push(area.code());
    p.extend_from_slice(&[(bit_address >> 16) as u8, (bit_address >> 8) as u8, bit_address as u8]);
    p
}

fn check_return_code(code: u8) -> DriverResult<()> {
    if code == RETURN_OK {
        return Ok(());
    }
    let message = match code {
        0x01 => "hardware fault",
        0x03 => "access denied",
        0x05 => "address out of range",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        0x0A => "object does not exist",
        _ => "item rejected",
    };
    Err(GatewayError::Protocol {
        code: code as i64,
        message: message.to_string(),
    })
}
