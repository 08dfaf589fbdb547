use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use stek_tls::TicketStatsSnapshot;

/// Renders ticket counters in the Prometheus text exposition format.
pub fn render(snapshot: &TicketStatsSnapshot, namespace: &str) -> Result<String> {
    let registry = Registry::new();
    let opts = Opts::new(
        "tickets_total",
        "Session ticket events grouped by what happened to the ticket",
    )
    .namespace(namespace.to_string());
    let tickets = IntCounterVec::new(opts, &["event"])?;
    registry.register(Box::new(tickets.clone()))?;

    for (event, value) in [
        ("issued", snapshot.issued),
        ("resumed", snapshot.resumed),
        ("renewed", snapshot.renewed),
        ("fallback", snapshot.fallbacks),
        ("failure", snapshot.failures),
    ] {
        tickets.with_label_values(&[event]).inc_by(value);
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("failed to encode metrics")?;
    String::from_utf8(buffer).context("metrics output is not UTF-8")
}
