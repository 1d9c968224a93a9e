//! OpenVPN tunnel management for reaching the UMG meter

pub mod backend;
pub mod cli;
pub mod connection;
pub mod diagnostics;
pub mod gui;
pub mod profile;
pub mod resolve;

pub use backend::{Detection, Method, TunnelBackend, find_openvpn};
pub use connection::{HealthChecks, NetworkProbe, VpnConnection, VpnStatus, vpn_status};
pub use profile::{AssetReport, extract_assets};
