//! Minimal Modbus TCP client: function 0x03 (read holding registers)

use super::registers::MAX_REGISTERS_PER_READ;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

const FN_READ_HOLDING_REGISTERS: u8 = 0x03;
const EXCEPTION_FLAG: u8 = 0x80;
const MBAP_LEN: usize = 7;

#[derive(Debug, Error)]
pub enum ModbusError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("device returned exception {code:#04x} ({})", exception_name(.code))]
    Exception { code: u8 },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ModbusError {
    /// The stream may hold unread bytes, so later requests on it would
    /// read a foreign response
    pub fn breaks_session(&self) -> bool {
        matches!(self, ModbusError::Io(_) | ModbusError::Malformed(_))
    }
}

pub fn exception_name(code: &u8) -> &'static str {
    match *code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown",
    }
}

/// Build a read-holding-registers ADU
pub fn encode_read_request(
    transaction_id: u16,
    unit_id: u8,
    start: u16,
    count: u16,
) -> Result<[u8; 12], ModbusError> {
    if count == 0 || count > MAX_REGISTERS_PER_READ {
        return Err(ModbusError::InvalidRequest(format!(
            "register count {} outside 1..={}",
            count, MAX_REGISTERS_PER_READ
        )));
    }
    let mut frame = [0u8; 12];
    frame[0..2].copy_from_slice(&transaction_id.to_be_bytes());
    // protocol id 0
    frame[4..6].copy_from_slice(&6u16.to_be_bytes());
    frame[6] = unit_id;
    frame[7] = FN_READ_HOLDING_REGISTERS;
    frame[8..10].copy_from_slice(&start.to_be_bytes());
    frame[10..12].copy_from_slice(&count.to_be_bytes());
    Ok(frame)
}

/// Parsed MBAP header of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

pub fn decode_header(bytes: &[u8; MBAP_LEN]) -> MbapHeader {
    MbapHeader {
        transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
        protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
        length: u16::from_be_bytes([bytes[4], bytes[5]]),
        unit_id: bytes[6],
    }
}

/// Decode the PDU following the MBAP header into register words
pub fn decode_read_response(pdu: &[u8], expected_count: u16) -> Result<Vec<u16>, ModbusError> {
    let function = *pdu
        .first()
        .ok_or_else(|| ModbusError::Malformed("empty PDU".to_string()))?;

    if function == FN_READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
        let code = pdu
            .get(1)
            .copied()
            .ok_or_else(|| ModbusError::Malformed("exception without code".to_string()))?;
        return Err(ModbusError::Exception { code });
    }
    if function != FN_READ_HOLDING_REGISTERS {
        return Err(ModbusError::Malformed(format!(
            "unexpected function code {:#04x}",
            function
        )));
    }

    let byte_count = *pdu
        .get(1)
        .ok_or_else(|| ModbusError::Malformed("missing byte count".to_string()))?
        as usize;
    if byte_count != expected_count as usize * 2 {
        return Err(ModbusError::Malformed(format!(
            "byte count {} does not match {} registers",
            byte_count, expected_count
        )));
    }
    let data = pdu
        .get(2..2 + byte_count)
        .ok_or_else(|| ModbusError::Malformed("truncated register data".to_string()))?;

    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Blocking Modbus TCP connection
pub struct ModbusClient {
    stream: TcpStream,
    unit_id: u8,
    next_transaction: u16,
}

impl ModbusClient {
    pub fn connect(host: &str, port: u16, unit_id: u8, timeout: Duration) -> Result<Self, ModbusError> {
        let addr = resolve(host, port)?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            unit_id,
            next_transaction: 1,
        })
    }

    pub fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        let transaction_id = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);

        let request = encode_read_request(transaction_id, self.unit_id, start, count)?;
        self.stream.write_all(&request)?;

        let mut header_bytes = [0u8; MBAP_LEN];
        self.stream.read_exact(&mut header_bytes)?;
        let header = decode_header(&header_bytes);

        if header.protocol_id != 0 {
            return Err(ModbusError::Malformed(format!(
                "protocol id {} is not Modbus",
                header.protocol_id
            )));
        }
        if header.transaction_id != transaction_id {
            return Err(ModbusError::Malformed(format!(
                "transaction id {} does not match request {}",
                header.transaction_id, transaction_id
            )));
        }
        if header.unit_id != self.unit_id {
            return Err(ModbusError::Malformed(format!(
                "unit id {} does not match {}",
                header.unit_id, self.unit_id
            )));
        }
        // length counts the unit id byte plus the PDU
        if header.length < 2 || header.length > 256 {
            return Err(ModbusError::Malformed(format!(
                "implausible length field {}",
                header.length
            )));
        }

        let mut pdu = vec![0u8; header.length as usize - 1];
        self.stream.read_exact(&mut pdu)?;
        decode_read_response(&pdu, count)
    }
}

pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, ModbusError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| ModbusError::Resolve(format!("{}:{}", host, port)))?
        .next()
        .ok_or_else(|| ModbusError::Resolve(format!("{}:{}", host, port)))
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process Modbus TCP server backed by a register table

    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve `connections` connections, answering every request from `table`.
    /// Addresses missing from the table yield exception 0x02.
    pub fn spawn_server(table: HashMap<u16, u16>, connections: usize) -> u16 {
        spawn_garbling_server(table, connections, 0)
    }

    /// Like `spawn_server`, but the first `garbled` replies carry a foreign
    /// transaction id
    pub fn spawn_garbling_server(table: HashMap<u16, u16>, connections: usize, garbled: usize) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let mut garbled = garbled;
            for stream in listener.incoming().take(connections) {
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                let mut request = [0u8; 12];
                while stream.read_exact(&mut request).is_ok() {
                    let start = u16::from_be_bytes([request[8], request[9]]);
                    let count = u16::from_be_bytes([request[10], request[11]]);
                    let words: Option<Vec<u16>> =
                        (start..start + count).map(|a| table.get(&a).copied()).collect();

                    let mut pdu = Vec::new();
                    match words {
                        Some(words) => {
                            pdu.push(0x03);
                            pdu.push((words.len() * 2) as u8);
                            for word in words {
                                pdu.extend_from_slice(&word.to_be_bytes());
                            }
                        }
                        None => {
                            pdu.push(0x83);
                            pdu.push(0x02);
                        }
                    }
                    let mut response = Vec::new();
                    response.extend_from_slice(&request[0..4]);
                    if garbled > 0 {
                        garbled -= 1;
                        response[1] ^= 0xFF;
                    }
                    response.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
                    response.push(request[6]);
                    response.extend_from_slice(&pdu);
                    if stream.write_all(&response).is_err() {
                        break;
                    }
                }
            }
        });
        port
    }

    pub fn float_words(value: f32) -> [u16; 2] {
        let bits = value.to_bits();
        [(bits >> 16) as u16, bits as u16]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_encode_read_request_layout() {
        let frame = encode_read_request(0x0102, 1, 19000, 4).unwrap();
        assert_eq!(
            frame,
            [0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x4A, 0x38, 0x00, 0x04]
        );
    }

    #[test]
    fn test_encode_rejects_oversized_reads() {
        assert!(encode_read_request(1, 1, 0, 0).is_err());
        assert!(encode_read_request(1, 1, 0, 126).is_err());
    }

    #[test]
    fn test_decode_exception_response() {
        let err = decode_read_response(&[0x83, 0x02], 2).unwrap_err();
        match err {
            ModbusError::Exception { code } => assert_eq!(code, 0x02),
            other => panic!("unexpected error: {other}"),
        }
        assert!(
            ModbusError::Exception { code: 2 }
                .to_string()
                .contains("illegal data address")
        );
    }

    #[test]
    fn test_decode_rejects_wrong_byte_count() {
        let err = decode_read_response(&[0x03, 0x02, 0x00, 0x01], 2).unwrap_err();
        assert!(matches!(err, ModbusError::Malformed(_)));
    }

    #[test]
    fn test_read_against_fake_server() {
        let mut table = HashMap::new();
        let [hi, lo] = fake::float_words(229.7);
        table.insert(19000, hi);
        table.insert(19001, lo);
        let port = fake::spawn_server(table, 1);

        let mut client =
            ModbusClient::connect("127.0.0.1", port, 1, Duration::from_secs(2)).unwrap();
        let words = client.read_holding_registers(19000, 2).unwrap();
        assert_eq!(words, vec![hi, lo]);

        let err = client.read_holding_registers(20000, 2).unwrap_err();
        assert!(matches!(err, ModbusError::Exception { code: 0x02 }));
    }
}
