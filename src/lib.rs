//! Prognoza: OpenVPN tunnel control and Janitza UMG polling

pub mod logging;
pub mod poll;
pub mod settings;
pub mod umg;
pub mod utils;
pub mod vpn;
pub mod web;
