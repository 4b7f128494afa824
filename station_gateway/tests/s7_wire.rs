use station_gateway::drivers::s7::address::S7Area;
use station_gateway::drivers::s7::client::{IsoTcpClient, IsoTcpOptions, S7Transport};
use station_gateway::drivers::s7::{S7Driver, S7Settings};
use station_gateway::drivers::traits::DeviceDriver;
use station_gateway::error::GatewayError;
use station_gateway::tags::structures::{DataType, Tag, ValueVariant};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SERVER_PDU: u16 = 240;

#[derive(Default)]
struct PlcImage {
    /// Byte image per (area code, db).
    memory: HashMap<(u8, u16), Vec<u8>>,
    /// (start, len) of every ReadVar item.
    reads: Vec<(u32, usize)>,
    /// Called TSAP seen in the last connection request.
    called_tsap: Option<[u8; 2]>,
    /// Byte offsets whose reads are answered with "address out of range".
    rejected: Vec<u32>,
    /// Hang up instead of answering the next job.
    drop_next: bool,
}

impl PlcImage {
    fn image(&mut self, area: u8, db: u16) -> &mut Vec<u8> {
        self.memory.entry((area, db)).or_insert_with(|| vec![0; 2048])
    }
}

/// Loopback CPU speaking TPKT/COTP/S7 for setup, ReadVar and WriteVar.
struct FakeCpu {
    port: u16,
    plc: Arc<Mutex<PlcImage>>,
}

impl FakeCpu {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let plc = Arc::new(Mutex::new(PlcImage::default()));
        let shared = Arc::clone(&plc);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });
        FakeCpu { port, plc }
    }

    fn options(&self) -> IsoTcpOptions {
        IsoTcpOptions {
            host: "127.0.0.1".to_string(),
            port: self.port,
            rack: 0,
            slot: 1,
            pdu_size: 480,
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
        }
    }

    fn settings(&self) -> S7Settings {
        let mut settings = S7Settings::new("127.0.0.1");
        settings.port = self.port;
        settings.io_timeout_ms = 1000;
        settings
    }

    fn set_bytes(&self, area: S7Area, db: u16, offset: usize, bytes: &[u8]) {
        let mut plc = self.plc.lock().unwrap();
        plc.image(area.code(), db)[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn bytes(&self, area: S7Area, db: u16, offset: usize, len: usize) -> Vec<u8> {
        let mut plc = self.plc.lock().unwrap();
        plc.image(area.code(), db)[offset..offset + len].to_vec()
    }

    fn reads(&self) -> Vec<(u32, usize)> {
        self.plc.lock().unwrap().reads.clone()
    }
}

fn tpkt(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x03, 0x00];
    frame.extend_from_slice(&((payload.len() + 4) as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn ack(pdu_ref: [u8; 2], param: &[u8], data: &[u8]) -> Vec<u8> {
    let mut body = vec![0x02, 0xF0, 0x80, 0x32, 0x03, 0x00, 0x00, pdu_ref[0], pdu_ref[1]];
    body.extend_from_slice(&(param.len() as u16).to_be_bytes());
    body.extend_from_slice(&(data.len() as u16).to_be_bytes());
    body.extend_from_slice(&[0x00, 0x00]);
    body.extend_from_slice(param);
    body.extend_from_slice(data);
    tpkt(&body)
}

fn handle_job(plc: &mut PlcImage, s7: &[u8]) -> Vec<u8> {
    let pdu_ref = [s7[4], s7[5]];
    let param_len = u16::from_be_bytes([s7[6], s7[7]]) as usize;
    let param = &s7[10..10 + param_len];
    let data = &s7[10 + param_len..];

    if param[0] == 0xF0 {
        let requested = u16::from_be_bytes([param[6], param[7]]);
        let mut reply = param[..6].to_vec();
        reply.extend_from_slice(&requested.min(SERVER_PDU).to_be_bytes());
        return ack(pdu_ref, &reply, &[]);
    }

    let transport = param[5];
    let count = u16::from_be_bytes([param[6], param[7]]) as usize;
    let db = u16::from_be_bytes([param[8], param[9]]);
    let area = param[10];
    let address = ((param[11] as u32) << 16) | ((param[12] as u32) << 8) | param[13] as u32;

    match param[0] {
        0x04 => {
            let start = address >> 3;
            plc.reads.push((start, count));
            if plc.rejected.iter().any(|b| *b >= start && *b < start + count as u32) {
                return ack(pdu_ref, &[0x04, 0x01], &[0x05, 0x00, 0x00, 0x00]);
            }
            let image = plc.image(area, db);
            let mut item = vec![0xFF, 0x04];
            item.extend_from_slice(&((count * 8) as u16).to_be_bytes());
            item.extend_from_slice(&image[start as usize..start as usize + count]);
            ack(pdu_ref, &[0x04, 0x01], &item)
        }
        0x05 => {
            let payload = &data[4..];
            let image = plc.image(area, db);
            if transport == 0x01 {
                let (byte, bit) = ((address >> 3) as usize, address & 7);
                if payload[0] != 0 {
                    image[byte] |= 1 << bit;
                } else {
                    image[byte] &= !(1 << bit);
                }
            } else {
                let start = (address >> 3) as usize;
                image[start..start + count].copy_from_slice(&payload[..count]);
            }
            ack(pdu_ref, &[0x05, 0x01], &[0xFF])
        }
        _ => ack(pdu_ref, &[param[0], 0x00], &[0x0A]),
    }
}

async fn serve(mut stream: TcpStream, plc: Arc<Mutex<PlcImage>>) {
    loop {
        let mut header = [0u8; 4];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let total = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut body = vec![0u8; total - 4];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let reply = {
            let mut plc = plc.lock().unwrap();
            if body[1] == 0xE0 {
                let n = body.len();
                plc.called_tsap = Some([body[n - 2], body[n - 1]]);
                tpkt(&[0x06, 0xD0, 0x00, 0x01, 0x00, 0x01, 0x00])
            } else {
                if plc.drop_next {
                    plc.drop_next = false;
                    return;
                }
                handle_job(&mut plc, &body[3..])
            }
        };
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

#[tokio::test]
async fn connect_negotiates_the_smaller_pdu() {
    let cpu = FakeCpu::start().await;
    let mut client = IsoTcpClient::new(cpu.options());

    client.connect().await.unwrap();
    assert!(client.is_connected());
    assert_eq!(client.pdu_len(), SERVER_PDU as usize);
    assert_eq!(cpu.plc.lock().unwrap().called_tsap, Some([0x01, 0x01]));

    client.disconnect().await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn long_reads_split_at_the_pdu_limit() {
    let cpu = FakeCpu::start().await;
    let pattern: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
    cpu.set_bytes(S7Area::DataBlock, 4, 0, &pattern);

    let mut client = IsoTcpClient::new(cpu.options());
    client.connect().await.unwrap();
    let bytes = client.read_area(S7Area::DataBlock, 4, 0, 500).await.unwrap();

    assert_eq!(bytes, pattern);
    assert_eq!(cpu.reads(), vec![(0, 222), (222, 222), (444, 56)]);
}

#[tokio::test]
async fn driver_reads_and_writes_over_tcp() {
    let cpu = FakeCpu::start().await;
    cpu.set_bytes(S7Area::DataBlock, 1, 0, &(-300i16).to_be_bytes());
    cpu.set_bytes(S7Area::DataBlock, 1, 4, &1.25f32.to_be_bytes());
    cpu.set_bytes(S7Area::DataBlock, 1, 8, &[0b0000_0100]);
    let driver = S7Driver::new(cpu.settings());
    driver.connect().await.unwrap();

    let tags = vec![
        Tag::new("count", "DB1.DBW0", DataType::Int16, "plc").with_attribute("batch_group", "a"),
        Tag::new("temp", "DB1.DBD4", DataType::Float, "plc").with_attribute("batch_group", "a"),
        Tag::new("ready", "DB1.DBX8.2", DataType::Boolean, "plc").with_attribute("batch_group", "a"),
    ];
    let results = driver.read_many(&tags).await.unwrap();
    assert_eq!(results["count"], Some(ValueVariant::Int(-300)));
    assert_eq!(results["temp"], Some(ValueVariant::Float(1.25)));
    assert_eq!(results["ready"], Some(ValueVariant::Bool(true)));
    assert_eq!(cpu.reads(), vec![(0, 12)]);

    driver.write_one(&tags[1], &ValueVariant::Float(-2.5)).await.unwrap();
    assert_eq!(cpu.bytes(S7Area::DataBlock, 1, 4, 4), (-2.5f32).to_be_bytes().to_vec());

    let run = Tag::new("run", "M3.7", DataType::Boolean, "plc");
    driver.write_one(&run, &ValueVariant::Bool(true)).await.unwrap();
    assert_eq!(cpu.bytes(S7Area::Merker, 0, 3, 1), vec![0b1000_0000]);
}

#[tokio::test]
async fn rejected_item_is_a_protocol_error_and_keeps_the_session() {
    let cpu = FakeCpu::start().await;
    cpu.plc.lock().unwrap().rejected.push(100);
    let mut client = IsoTcpClient::new(cpu.options());
    client.connect().await.unwrap();

    match client.read_area(S7Area::DataBlock, 1, 96, 8).await {
        Err(GatewayError::Protocol { code, .. }) => assert_eq!(code, 5),
        other => panic!("unexpected {:?}", other),
    }
    assert!(client.is_connected());
    assert!(client.read_area(S7Area::DataBlock, 1, 0, 8).await.is_ok());
}

#[tokio::test]
async fn batch_fault_falls_back_per_tag_over_tcp() {
    let cpu = FakeCpu::start().await;
    cpu.set_bytes(S7Area::DataBlock, 2, 0, &7u16.to_be_bytes());
    cpu.set_bytes(S7Area::DataBlock, 2, 20, &9u16.to_be_bytes());
    cpu.plc.lock().unwrap().rejected.push(10);
    let driver = S7Driver::new(cpu.settings());
    driver.connect().await.unwrap();

    let tags = vec![
        Tag::new("a", "DB2.DBW0", DataType::UInt16, "plc").with_attribute("batch_group", "g"),
        Tag::new("b", "DB2.DBW10", DataType::UInt16, "plc").with_attribute("batch_group", "g"),
        Tag::new("c", "DB2.DBW20", DataType::UInt16, "plc").with_attribute("batch_group", "g"),
    ];
    let results = driver.read_many(&tags).await.unwrap();
    assert_eq!(results["a"], Some(ValueVariant::UInt(7)));
    assert_eq!(results["b"], None);
    assert_eq!(results["c"], Some(ValueVariant::UInt(9)));
    assert_eq!(cpu.reads(), vec![(0, 22), (0, 2), (10, 2), (20, 2)]);
    assert!(driver.is_connected().await);
}

#[tokio::test]
async fn lost_socket_surfaces_as_connection_loss() {
    let cpu = FakeCpu::start().await;
    let driver = S7Driver::new(cpu.settings());
    driver.connect().await.unwrap();
    cpu.plc.lock().unwrap().drop_next = true;

    let tag = Tag::new("count", "DB1.DBW0", DataType::Int16, "plc");
    let err = driver.read_many(std::slice::from_ref(&tag)).await.unwrap_err();
    assert!(err.is_connection_loss(), "unexpected {:?}", err);
    assert!(!driver.is_connected().await);

    driver.connect().await.unwrap();
    assert_eq!(
        driver.read_many(std::slice::from_ref(&tag)).await.unwrap()["count"],
        Some(ValueVariant::Int(0))
    );
}
