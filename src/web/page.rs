//! Server-rendered dashboard page

use crate::poll::PollerSnapshot;
use crate::umg::{LatestReading, UmgHealth};
use crate::vpn::VpnStatus;

/// Signal strength from the Modbus latency in ms: 4 bars below 150, 3 below 250, 2 below 400, else 1
pub fn signal_bars(latency_ms: Option<f64>) -> u8 {
    match latency_ms {
        None => 0,
        Some(ms) if ms < 150.0 => 4,
        Some(ms) if ms < 250.0 => 3,
        Some(ms) if ms < 400.0 => 2,
        Some(_) => 1,
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn bars_html(bars: u8) -> String {
    let spans: String = (1..=4u8)
        .map(|level| {
            let class = if level <= bars { "bar on" } else { "bar" };
            format!(r#"<span class="{}" style="height:{}px"></span>"#, class, level * 5)
        })
        .collect();
    format!(r#"<span class="signal" title="{} of 4">{}</span>"#, bars, spans)
}

fn latency(ms: Option<f64>) -> String {
    ms.map(|v| format!("{:.1} ms", v))
        .unwrap_or_else(|| "no answer".to_string())
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

fn vpn_section(status: Result<&VpnStatus, &str>) -> String {
    let status = match status {
        Ok(status) => status,
        Err(error) => return format!(r#"<p class="err">{}</p>"#, escape(error)),
    };
    let state = if status.is_connected {
        r#"<span class="ok">connected</span>"#
    } else {
        r#"<span class="err">disconnected</span>"#
    };
    let mut rows = vec![
        ("State", state.to_string()),
        ("Profile", escape(&status.profile_name)),
        (
            "Method",
            status.method.map(|m| m.as_str()).unwrap_or("-").to_string(),
        ),
        (
            "Tunnel IP",
            status
                .vpn_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ),
        (
            "PID",
            status
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ),
        ("Ping / TCP", format!("{} / {}", yes_no(status.checks.ping), yes_no(status.checks.tcp))),
    ];
    if let Some(message) = &status.message {
        rows.push(("Message", escape(message)));
    }
    if let Some(error) = &status.error {
        rows.push(("Error", format!(r#"<span class="err">{}</span>"#, escape(error))));
    }
    table(&rows)
}

fn health_section(health: Result<&UmgHealth, &str>) -> String {
    match health {
        Ok(health) => {
            table(&[
                ("Signal", bars_html(signal_bars(health.modbus_ms))),
                ("Reachable", yes_no(health.reachable).to_string()),
                ("HTTP", latency(health.http_ms)),
                ("Modbus", latency(health.modbus_ms)),
            ])
        }
        Err(error) => format!(
            r#"<p class="err">{}</p>{}"#,
            escape(error),
            bars_html(0)
        ),
    }
}

fn latest_section(latest: Option<&LatestReading>) -> String {
    let Some(latest) = latest else {
        return "<p>No readings exported yet.</p>".to_string();
    };
    let rows: Vec<(&str, String)> = latest
        .cells
        .iter()
        .map(|(k, v)| (k.as_str(), escape(v)))
        .collect();
    format!(
        "<p class=\"muted\">{}</p>{}",
        escape(&latest.path.display().to_string()),
        table(&rows)
    )
}

fn poller_section(poller: &PollerSnapshot) -> String {
    let mut rows = vec![("Running", yes_no(poller.running).to_string())];
    if let Some(payload) = &poller.last_payload {
        rows.push((
            "Last reading",
            escape(&payload.data.cells().first().map(|(_, v)| v.clone()).unwrap_or_default()),
        ));
    }
    if let Some(error) = &poller.last_error {
        rows.push(("Last error", format!(r#"<span class="err">{}</span>"#, escape(error))));
    }
    table(&rows)
}

fn table(rows: &[(&str, String)]) -> String {
    let body: String = rows
        .iter()
        .map(|(k, v)| format!("<tr><th>{}</th><td>{}</td></tr>", escape(k), v))
        .collect();
    format!("<table>{}</table>", body)
}

pub struct PageData<'a> {
    pub vpn: Result<&'a VpnStatus, &'a str>,
    pub health: Result<&'a UmgHealth, &'a str>,
    pub latest: Option<&'a LatestReading>,
    pub poller: &'a PollerSnapshot,
    pub refresh_s: u64,
}

pub fn render(data: &PageData<'_>) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="{refresh}">
<title>Prognoza UMG</title>
<style>
body {{ font-family: system-ui, sans-serif; margin: 2rem; color: #222; }}
section {{ margin-bottom: 1.5rem; }}
table {{ border-collapse: collapse; }}
th, td {{ text-align: left; padding: 0.2rem 0.8rem; border-bottom: 1px solid #eee; }}
.ok {{ color: #1a7f37; }} .err {{ color: #cf222e; }} .muted {{ color: #777; }}
.signal {{ display: inline-flex; align-items: flex-end; gap: 2px; }}
.bar {{ width: 5px; background: #ddd; display: inline-block; }}
.bar.on {{ background: #1a7f37; }}
</style>
</head>
<body>
<h1>Prognoza UMG 509 PRO</h1>
<section><h2>VPN</h2>{vpn}</section>
<section><h2>UMG health</h2>{health}</section>
<section><h2>Latest reading</h2>{latest}</section>
<section><h2>Background polling</h2>{poller}
<form method="post" action="/run"><button type="submit">Poll now</button></form>
</section>
</body>
</html>
"#,
        refresh = data.refresh_s.max(1),
        vpn = vpn_section(data.vpn),
        health = health_section(data.health),
        latest = latest_section(data.latest),
        poller = poller_section(data.poller),
    )
}
