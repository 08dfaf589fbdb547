use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use clap::{Args, ValueEnum};
use serde::Serialize;
use stek_tls::{ConnectionInfo, ResumptionOutcome, Ticket, TicketConfig, TicketStatsSnapshot};
use tokio::task::JoinSet;
use tracing::{debug, info};

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Ticket config (YAML or JSON). Built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of concurrent handshakes to run.
    #[arg(long, default_value_t = 1000)]
    handshakes: usize,

    /// Fraction of handshakes that present a previously issued ticket.
    #[arg(long, default_value_t = 0.8)]
    resume_ratio: f64,

    /// Report format.
    #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
    format: ReportFormat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Json,
    Prometheus,
}

#[derive(Serialize)]
struct Report {
    handshakes: usize,
    resumed: usize,
    full: usize,
    elapsed_ms: u128,
    stats: TicketStatsSnapshot,
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    ensure!(
        (0.0..=1.0).contains(&args.resume_ratio),
        "--resume-ratio must be between 0 and 1"
    );
    let config = match &args.config {
        Some(path) => TicketConfig::load(path)
            .await
            .with_context(|| format!("failed to load ticket config {}", path.display()))?,
        None => TicketConfig::default(),
    };
    let negotiator = Arc::new(config.build().context("failed to build ticket negotiator")?);
    ensure!(negotiator.is_enabled(), "session tickets are disabled in the config");

    let seed = negotiator
        .negotiate(&client(0), None, b"seed session")
        .await
        .context("seed handshake failed")?;
    let seed_ticket: Option<Ticket> = seed.new_ticket;
    let resuming = (args.handshakes as f64 * args.resume_ratio).round() as usize;
    info!(handshakes = args.handshakes, resuming, "starting simulation");

    let started = Instant::now();
    let mut tasks = JoinSet::new();
    for index in 0..args.handshakes {
        let negotiator = Arc::clone(&negotiator);
        let presented = seed_ticket.clone().filter(|_| index < resuming);
        tasks.spawn(async move {
            let conn = client(index);
            let state = format!("session {index}");
            negotiator
                .negotiate(&conn, presented.as_ref().map(Ticket::as_bytes), state.as_bytes())
                .await
                .map(|negotiation| negotiation.outcome)
        });
    }

    let (mut resumed, mut full) = (0, 0);
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.context("handshake task panicked")??;
        debug!(?outcome, "handshake finished");
        match outcome {
            ResumptionOutcome::Resumed | ResumptionOutcome::ResumedAndRenewed => resumed += 1,
            ResumptionOutcome::FullHandshake | ResumptionOutcome::Disabled => full += 1,
        }
    }

    let report = Report {
        handshakes: args.handshakes,
        resumed,
        full,
        elapsed_ms: started.elapsed().as_millis(),
        stats: negotiator.stats().snapshot(),
    };
    match args.format {
        ReportFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode report")?
        ),
        ReportFormat::Prometheus => print!("{}", crate::metrics::render(&report.stats, "stek")?),
    }
    Ok(())
}

fn client(index: usize) -> ConnectionInfo {
    let host = (index % 250) as u8 + 1;
    ConnectionInfo::new(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, host)),
        40_000 + (index % 20_000) as u16,
    ))
    .with_server_name("sim.invalid")
}
