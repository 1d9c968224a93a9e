//! Janitza UMG 509 PRO access over Modbus TCP

pub mod client;
pub mod export;
pub mod modbus;
pub mod registers;

pub use client::{Meter, Reading, ReadingStatus, UmgClient, UmgHealth};
pub use export::{CsvExporter, LatestReading, latest_reading};
