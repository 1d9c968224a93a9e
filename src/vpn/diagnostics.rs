//! OpenVPN log inspection

use serde::Serialize;
use std::fs;
use std::path::Path;

const TAIL_LINES: usize = 200;

/// A recognised line pattern in the OpenVPN log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSignature {
    AccessDenied,
    AuthFailed,
    TlsHandshakeFailed,
    DnsResolutionFailed,
    InitializationCompleted,
}

impl LogSignature {
    const ALL: [LogSignature; 5] = [
        LogSignature::AccessDenied,
        LogSignature::AuthFailed,
        LogSignature::TlsHandshakeFailed,
        LogSignature::DnsResolutionFailed,
        LogSignature::InitializationCompleted,
    ];

    fn needles(self) -> &'static [&'static str] {
        match self {
            LogSignature::AccessDenied => &["access is denied", "operation not permitted"],
            LogSignature::AuthFailed => &["auth_failed", "auth: received control message: auth_failed"],
            LogSignature::TlsHandshakeFailed => &["tls handshake failed", "tls error"],
            LogSignature::DnsResolutionFailed => &["resolve: cannot resolve host", "cannot resolve host address"],
            LogSignature::InitializationCompleted => &["initialization sequence completed"],
        }
    }

    pub fn hint(self) -> Option<&'static str> {
        match self {
            LogSignature::AccessDenied => Some(
                "OpenVPN could not configure the tunnel adapter. Run as Administrator (Windows) or root (Linux/macOS).",
            ),
            LogSignature::AuthFailed => {
                Some("The server rejected the credentials. Check the username/password or client certificate.")
            }
            LogSignature::TlsHandshakeFailed => Some(
                "TLS handshake failed. Check that the CA, client certificate and tls-auth key match the server.",
            ),
            LogSignature::DnsResolutionFailed => {
                Some("The VPN server name could not be resolved. Check DNS or use the server IP in the profile.")
            }
            LogSignature::InitializationCompleted => None,
        }
    }
}

/// Signatures found in `text`, in a fixed order
pub fn scan(text: &str) -> Vec<LogSignature> {
    let lower = text.to_lowercase();
    LogSignature::ALL
        .into_iter()
        .filter(|sig| sig.needles().iter().any(|needle| lower.contains(needle)))
        .collect()
}

/// Last `TAIL_LINES` lines of the log, or an empty string if it cannot be read
pub fn read_log_tail(path: &Path) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    lines[start..].join("\n")
}

/// Hints for every failure signature in the tail of the log at `path`
pub fn hints_from_log(path: &Path) -> Vec<&'static str> {
    let signatures = scan(&read_log_tail(path));
    if !signatures.is_empty() {
        tracing::debug!("OpenVPN log signatures: {:?}", signatures);
    }
    signatures.into_iter().filter_map(LogSignature::hint).collect()
}
