use station_gateway::drivers::modbus::{ModbusDriver, ModbusSettings};
use station_gateway::drivers::traits::DeviceDriver;
use station_gateway::error::GatewayError;
use station_gateway::tags::structures::{DataType, Tag, ValueVariant};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SIZE: usize = 64;

#[derive(Default)]
struct Memory {
    coils: Vec<bool>,
    registers: Vec<u16>,
    /// (unit id, function code) of every request.
    requests: Vec<(u8, u8)>,
    /// Hang up instead of answering the next request.
    drop_next: bool,
}

/// Minimal Modbus TCP slave: coils and holding registers, function codes
/// 1, 3, 5, 6 and 16. Anything out of range gets exception 0x02.
#[derive(Clone)]
struct FakeSlave {
    port: u16,
    memory: Arc<Mutex<Memory>>,
}

impl FakeSlave {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let memory = Arc::new(Mutex::new(Memory {
            coils: vec![false; SIZE],
            registers: vec![0; SIZE],
            ..Memory::default()
        }));
        let shared = Arc::clone(&memory);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });
        FakeSlave { port, memory }
    }

    fn settings(&self) -> ModbusSettings {
        ModbusSettings {
            host: "127.0.0.1".to_string(),
            port: self.port,
            unit_id: 1,
            connect_timeout_ms: 1000,
            io_timeout_ms: 1000,
        }
    }

    fn set_registers(&self, offset: usize, values: &[u16]) {
        self.memory.lock().unwrap().registers[offset..offset + values.len()].copy_from_slice(values);
    }

    fn registers(&self, offset: usize, count: usize) -> Vec<u16> {
        self.memory.lock().unwrap().registers[offset..offset + count].to_vec()
    }

    fn requests(&self) -> Vec<(u8, u8)> {
        self.memory.lock().unwrap().requests.clone()
    }
}

fn word(pdu: &[u8], at: usize) -> usize {
    u16::from_be_bytes([pdu[at], pdu[at + 1]]) as usize
}

fn answer(memory: &mut Memory, pdu: &[u8]) -> Vec<u8> {
    let fc = pdu[0];
    let exception = vec![fc | 0x80, 0x02];
    match fc {
        1 => {
            let (addr, qty) = (word(pdu, 1), word(pdu, 3));
            if addr + qty > SIZE {
                return exception;
            }
            let mut bytes = vec![0u8; qty.div_ceil(8)];
            for i in 0..qty {
                if memory.coils[addr + i] {
                    bytes[i / 8] |= 1 << (i % 8);
                }
            }
            let mut out = vec![fc, bytes.len() as u8];
            out.extend(bytes);
            out
        }
        3 => {
            let (addr, qty) = (word(pdu, 1), word(pdu, 3));
            if addr + qty > SIZE {
                return exception;
            }
            let mut out = vec![fc, (qty * 2) as u8];
            for r in &memory.registers[addr..addr + qty] {
                out.extend_from_slice(&r.to_be_bytes());
            }
            out
        }
        5 => {
            let addr = word(pdu, 1);
            if addr >= SIZE {
                return exception;
            }
            memory.coils[addr] = word(pdu, 3) == 0xFF00;
            pdu.to_vec()
        }
        6 => {
            let addr = word(pdu, 1);
            if addr >= SIZE {
                return exception;
            }
            memory.registers[addr] = word(pdu, 3) as u16;
            pdu.to_vec()
        }
        16 => {
            let (addr, qty) = (word(pdu, 1), word(pdu, 3));
            if addr + qty > SIZE {
                return exception;
            }
            for i in 0..qty {
                memory.registers[addr + i] = word(pdu, 6 + i * 2) as u16;
            }
            pdu[..5].to_vec()
        }
        _ => vec![fc | 0x80, 0x01],
    }
}

async fn serve(mut stream: TcpStream, memory: Arc<Mutex<Memory>>) {
    loop {
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; len - 1];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }
        let reply = {
            let mut memory = memory.lock().unwrap();
            if memory.drop_next {
                memory.drop_next = false;
                return;
            }
            memory.requests.push((header[6], pdu[0]));
            answer(&mut memory, &pdu)
        };
        let mut frame = header[..4].to_vec();
        frame.extend_from_slice(&((reply.len() + 1) as u16).to_be_bytes());
        frame.push(header[6]);
        frame.extend(reply);
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

async fn connected(slave: &FakeSlave) -> ModbusDriver {
    let driver = ModbusDriver::new(slave.settings());
    driver.connect().await.unwrap();
    driver
}

#[tokio::test]
async fn reads_registers_and_coils() {
    let slave = FakeSlave::start().await;
    let bits = 12.5f32.to_bits();
    slave.set_registers(0, &[0xFFFE]);
    slave.set_registers(2, &[(bits >> 16) as u16, bits as u16]);
    slave.set_registers(10, &[0x4F4B, 0x0000]);
    slave.memory.lock().unwrap().coils[2] = true;
    let driver = connected(&slave).await;

    let tags = vec![
        Tag::new("m/level", "40001", DataType::Int16, "meter"),
        Tag::new("m/flow", "2", DataType::Float, "meter"),
        Tag::new("m/name", "10", DataType::String, "meter").with_array_length(4),
        Tag::new("m/pump", "00003", DataType::Boolean, "meter"),
    ];
    let results = driver.read_many(&tags).await.unwrap();

    assert_eq!(results["m/level"], Some(ValueVariant::Int(-2)));
    assert_eq!(results["m/flow"], Some(ValueVariant::Float(12.5)));
    assert_eq!(results["m/name"], Some(ValueVariant::String("OK".into())));
    assert_eq!(results["m/pump"], Some(ValueVariant::Bool(true)));
}

#[tokio::test]
async fn writes_pick_single_or_multiple_register_codes() {
    let slave = FakeSlave::start().await;
    let driver = connected(&slave).await;

    let setpoint = Tag::new("m/setpoint", "40005", DataType::UInt16, "meter");
    driver.write_one(&setpoint, &ValueVariant::Int(1500)).await.unwrap();
    assert_eq!(slave.registers(4, 1), vec![1500]);

    let total = Tag::new("m/total", "20", DataType::UInt32, "meter");
    driver.write_one(&total, &ValueVariant::UInt(0x0001_0002)).await.unwrap();
    assert_eq!(slave.registers(20, 2), vec![0x0001, 0x0002]);

    let pump = Tag::new("m/pump", "00008", DataType::Boolean, "meter");
    driver.write_one(&pump, &ValueVariant::Bool(true)).await.unwrap();
    assert!(slave.memory.lock().unwrap().coils[7]);

    let codes: Vec<u8> = slave.requests().into_iter().map(|(_, fc)| fc).collect();
    assert_eq!(codes, vec![6, 16, 5]);
}

#[tokio::test]
async fn exception_marks_one_tag_and_keeps_the_session() {
    let slave = FakeSlave::start().await;
    slave.set_registers(0, &[7]);
    let driver = connected(&slave).await;

    let tags = vec![
        Tag::new("m/ok", "0", DataType::UInt16, "meter"),
        Tag::new("m/beyond", "500", DataType::UInt16, "meter"),
    ];
    let results = driver.read_many(&tags).await.unwrap();
    assert_eq!(results["m/ok"], Some(ValueVariant::UInt(7)));
    assert_eq!(results["m/beyond"], None);
    assert!(driver.is_connected().await);

    let err = driver
        .write_one(&tags[1], &ValueVariant::UInt(1))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Protocol { .. }));
    assert!(driver.is_connected().await);
}

#[tokio::test]
async fn unsupported_type_and_function_pairs() {
    let slave = FakeSlave::start().await;
    let driver = connected(&slave).await;

    let bool_register = Tag::new("m/bad", "40001", DataType::Boolean, "meter");
    let results = driver.read_many(std::slice::from_ref(&bool_register)).await.unwrap();
    assert_eq!(results["m/bad"], None);

    let input = Tag::new("m/input", "10001", DataType::Boolean, "meter");
    let err = driver.write_one(&input, &ValueVariant::Bool(true)).await.unwrap_err();
    assert!(matches!(err, GatewayError::NotSupported(_)));
    assert!(slave.requests().is_empty());
}

#[tokio::test]
async fn station_attribute_selects_unit_id() {
    let slave = FakeSlave::start().await;
    let driver = connected(&slave).await;

    let tags = vec![
        Tag::new("a", "0", DataType::UInt16, "meter"),
        Tag::new("b", "1", DataType::UInt16, "meter").with_attribute("station_id", "7"),
    ];
    driver.read_many(&tags).await.unwrap();
    assert_eq!(slave.requests(), vec![(1, 3), (7, 3)]);
}

#[tokio::test]
async fn dropped_connection_ends_the_session() {
    let slave = FakeSlave::start().await;
    let driver = connected(&slave).await;
    slave.memory.lock().unwrap().drop_next = true;

    let tags = vec![Tag::new("m/level", "0", DataType::UInt16, "meter")];
    let err = driver.read_many(&tags).await.unwrap_err();
    assert!(err.is_connection_loss(), "unexpected {:?}", err);
    assert!(!driver.is_connected().await);

    driver.connect().await.unwrap();
    assert!(driver.read_many(&tags).await.is_ok());
}

#[tokio::test]
async fn reads_require_a_session() {
    let slave = FakeSlave::start().await;
    let driver = ModbusDriver::new(slave.settings());
    let err = driver
        .read_many(&[Tag::new("m/level", "0", DataType::UInt16, "meter")])
        .await
        .unwrap_err();
    assert!(err.is_connection_loss());
}
