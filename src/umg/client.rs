//! Janitza UMG connectivity probe and register reader

use super::modbus::{ModbusClient, ModbusError};
use super::registers::{ReadBlock, RegisterSpec, plan_reads};
use crate::settings::UmgSettings;
use crate::utils::networking::tcp_ping;
use chrono::{DateTime, Local, SecondsFormat};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UmgHealth {
    pub http_ms: Option<f64>,
    pub modbus_ms: Option<f64>,
    /// The Modbus port answered
    pub reachable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingStatus {
    Ok,
    Partial,
    Error,
}

impl ReadingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadingStatus::Ok => "ok",
            ReadingStatus::Partial => "partial",
            ReadingStatus::Error => "error",
        }
    }

    fn from_counts(present: usize, total: usize) -> Self {
        if total > 0 && present == total {
            ReadingStatus::Ok
        } else if present > 0 {
            ReadingStatus::Partial
        } else {
            ReadingStatus::Error
        }
    }
}

/// One sampling of every configured register
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Local>,
    pub status: ReadingStatus,
    pub error: Option<String>,
    pub offset_seconds: f64,
    pub values: Vec<(String, Option<f64>)>,
}

pub const FIXED_COLUMNS: [&str; 4] = ["timestamp", "status", "error", "offset_seconds"];

impl Reading {
    pub fn columns(&self) -> Vec<String> {
        FIXED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.values.iter().map(|(name, _)| name.clone()))
            .collect()
    }

    /// Column name / text value pairs in CSV order
    pub fn cells(&self) -> Vec<(String, String)> {
        let mut cells = vec![
            (
                "timestamp".to_string(),
                self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, false),
            ),
            ("status".to_string(), self.status.as_str().to_string()),
            (
                "error".to_string(),
                self.error.clone().unwrap_or_default(),
            ),
            (
                "offset_seconds".to_string(),
                format!("{:.3}", self.offset_seconds),
            ),
        ];
        for (name, value) in &self.values {
            cells.push((
                name.clone(),
                value.map(|v| v.to_string()).unwrap_or_default(),
            ));
        }
        cells
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| *v)
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(FIXED_COLUMNS.len() + self.values.len()))?;
        map.serialize_entry(
            "timestamp",
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, false),
        )?;
        map.serialize_entry("status", &self.status)?;
        map.serialize_entry("error", &self.error)?;
        map.serialize_entry("offset_seconds", &self.offset_seconds)?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// A device that can be probed and sampled
pub trait Meter: Send + Sync {
    fn health(&self) -> UmgHealth;
    fn read(&self) -> Reading;
}

#[derive(Debug, Clone)]
pub struct UmgClient {
    pub host: String,
    pub http_port: u16,
    pub modbus_port: u16,
    pub unit_id: u8,
    pub timeout: Duration,
    pub registers: Vec<RegisterSpec>,
}

impl UmgClient {
    pub fn from_settings(settings: &UmgSettings) -> Self {
        Self {
            host: settings.host.clone(),
            http_port: settings.http_port,
            modbus_port: settings.modbus_port,
            unit_id: settings.unit_id,
            timeout: Duration::from_secs_f64(settings.timeout_s.max(0.1)),
            registers: settings.registers.clone(),
        }
    }

    fn empty_values(&self) -> Vec<(String, Option<f64>)> {
        self.registers.iter().map(|r| (r.name.clone(), None)).collect()
    }
}

impl Meter for UmgClient {
    /// Probe HTTP and Modbus endpoints, returning latency metrics
    fn health(&self) -> UmgHealth {
        let http_ms = tcp_ping(&self.host, self.http_port, self.timeout);
        let modbus_ms = tcp_ping(&self.host, self.modbus_port, self.timeout);
        UmgHealth {
            http_ms,
            modbus_ms,
            reachable: modbus_ms.is_some(),
        }
    }

    fn read(&self) -> Reading {
        let timestamp = Local::now();
        let mut values = self.empty_values();

        let connect = || ModbusClient::connect(&self.host, self.modbus_port, self.unit_id, self.timeout);
        let mut client = match connect() {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::error!(
                    "Modbus connect to {}:{} failed: {}",
                    self.host,
                    self.modbus_port,
                    e
                );
                return Reading {
                    timestamp,
                    status: ReadingStatus::Error,
                    error: Some(e.to_string()),
                    offset_seconds: 0.0,
                    values,
                };
            }
        };

        let mut first_error: Option<String> = None;
        for block in plan_reads(&self.registers) {
            if client.is_none() {
                match connect() {
                    Ok(fresh) => client = Some(fresh),
                    Err(e) => {
                        note_block_failure(&mut first_error, &block, &e);
                        continue;
                    }
                }
            }
            let Some(session) = client.as_mut() else {
                continue;
            };

            match session.read_holding_registers(block.start, block.count) {
                Ok(words) => {
                    for &index in &block.members {
                        let spec = &self.registers[index];
                        let decoded = block
                            .words_for(spec, &words)
                            .and_then(|w| spec.kind.decode(w))
                            .filter(|v| v.is_finite())
                            .map(|v| v * spec.scale);
                        values[index].1 = decoded;
                    }
                }
                Err(e) => {
                    if e.breaks_session() {
                        tracing::debug!("Reconnecting to {} after: {}", self.host, e);
                        client = None;
                    }
                    note_block_failure(&mut first_error, &block, &e);
                }
            }
        }

        let present = values.iter().filter(|(_, v)| v.is_some()).count();
        Reading {
            timestamp,
            status: ReadingStatus::from_counts(present, values.len()),
            error: first_error,
            offset_seconds: 0.0,
            values,
        }
    }
}

fn note_block_failure(first_error: &mut Option<String>, block: &ReadBlock, error: &ModbusError) {
    tracing::warn!(
        "Reading registers {}..{} failed: {}",
        block.start,
        block.start as u32 + block.count as u32,
        error
    );
    first_error.get_or_insert_with(|| format!("registers {}+{}: {}", block.start, block.count, error));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::umg::modbus::fake;
    use crate::umg::registers::RegisterKind;
    use std::collections::HashMap;
    use std::net::TcpListener;

    fn spec(name: &str, address: u16, kind: RegisterKind, scale: f64) -> RegisterSpec {
        RegisterSpec {
            name: name.to_string(),
            address,
            kind,
            unit: String::new(),
            scale,
        }
    }

    fn client(port: u16, registers: Vec<RegisterSpec>) -> UmgClient {
        UmgClient {
            host: "127.0.0.1".to_string(),
            http_port: port,
            modbus_port: port,
            unit_id: 1,
            timeout: Duration::from_secs(2),
            registers,
        }
    }

    #[test]
    fn test_read_decodes_and_scales() {
        let mut table = HashMap::new();
        let [hi, lo] = fake::float_words(230.25);
        table.insert(19000, hi);
        table.insert(19001, lo);
        table.insert(19002, 0);
        table.insert(19003, 0);
        table.insert(19004, 500);
        let port = fake::spawn_server(table, 1);

        let umg = client(
            port,
            vec![
                spec("voltage_l1", 19000, RegisterKind::Float32, 1.0),
                spec("counter", 19004, RegisterKind::Uint16, 0.1),
            ],
        );
        let reading = umg.read();

        assert_eq!(reading.status, ReadingStatus::Ok);
        assert_eq!(reading.error, None);
        assert_eq!(reading.value("voltage_l1"), Some(230.25));
        assert_eq!(reading.value("counter"), Some(50.0));
    }

    #[test]
    fn test_read_marks_partial_when_a_block_fails() {
        let mut table = HashMap::new();
        table.insert(100, 7);
        let port = fake::spawn_server(table, 1);

        let umg = client(
            port,
            vec![
                spec("present", 100, RegisterKind::Uint16, 1.0),
                spec("absent", 5000, RegisterKind::Uint16, 1.0),
            ],
        );
        let reading = umg.read();

        assert_eq!(reading.status, ReadingStatus::Partial);
        assert_eq!(reading.value("present"), Some(7.0));
        assert_eq!(reading.value("absent"), None);
        assert!(reading.error.unwrap().contains("illegal data address"));
    }

    #[test]
    fn test_read_reconnects_after_mismatched_response() {
        let mut table = HashMap::new();
        table.insert(100, 7);
        table.insert(5000, 9);
        let port = fake::spawn_garbling_server(table, 2, 1);

        let umg = client(
            port,
            vec![
                spec("first", 100, RegisterKind::Uint16, 1.0),
                spec("second", 5000, RegisterKind::Uint16, 1.0),
            ],
        );
        let reading = umg.read();

        assert_eq!(reading.status, ReadingStatus::Partial);
        assert_eq!(reading.value("first"), None);
        assert_eq!(reading.value("second"), Some(9.0));
        assert!(reading.error.unwrap().contains("transaction id"));
    }

    #[test]
    fn test_read_reports_error_when_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let reading = client(port, vec![spec("a", 1, RegisterKind::Uint16, 1.0)]).read();
        assert_eq!(reading.status, ReadingStatus::Error);
        assert!(reading.error.is_some());
        assert_eq!(reading.values, vec![("a".to_string(), None)]);
    }

    #[test]
    fn test_health_requires_modbus_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let mut umg = client(open, vec![]);
        umg.modbus_port = closed;
        let health = umg.health();
        assert!(health.http_ms.is_some());
        assert!(health.modbus_ms.is_none());
        assert!(!health.reachable);
    }

    #[test]
    fn test_reading_serializes_in_column_order() {
        let reading = Reading {
            timestamp: Local::now(),
            status: ReadingStatus::Partial,
            error: Some("boom".to_string()),
            offset_seconds: 0.25,
            values: vec![("b".to_string(), Some(1.5)), ("a".to_string(), None)],
        };
        let json = serde_json::to_string(&reading).unwrap();
        let b = json.find("\"b\"").unwrap();
        let a = json.find("\"a\"").unwrap();
        assert!(json.find("\"timestamp\"").unwrap() < b);
        assert!(b < a);
        assert!(json.contains("\"status\":\"partial\""));
        assert_eq!(
            reading.columns(),
            vec!["timestamp", "status", "error", "offset_seconds", "b", "a"]
        );
    }
}
