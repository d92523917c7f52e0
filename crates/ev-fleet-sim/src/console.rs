//! Line-oriented operator console

use std::fmt::Write as _;

use evsim_core::StationSnapshot;
use evsim_engine::{Command, FleetEngine, command::USAGE};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The operator asked to quit; the fleet has been shut down
    Quit,
    /// Input closed; the fleet keeps running
    EndOfInput,
}

/// Read stdin on a dedicated thread so a pending read never holds up
/// runtime shutdown.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });
    line_rx
}

fn help_text() -> String {
    format!(
        "Commands:\n  {}\n  status\n  help\n  quit | exit\n",
        USAGE
    )
}

pub fn format_table(tick: u64, stations: &[StationSnapshot]) -> String {
    let mut table = format!("Tick {}\n", tick);
    let _ = writeln!(
        table,
        "{:>3}  {:<12} {:<10} {:>4} {:>8} {:>9} {:>8} {:>5}",
        "#", "Station", "Status", "Code", "Current", "Setpoint", "Power", "Txn"
    );
    for (i, station) in stations.iter().enumerate() {
        let transaction = station
            .transaction_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            table,
            "{:>3}  {:<12} {:<10} {:>4} {:>6} A {:>7} A {:>6} W {:>5}",
            i + 1,
            station.station_id,
            station.status.to_string(),
            station.status_code,
            station.current_amps,
            station.setpoint_current_amps,
            station.active_power_watts,
            transaction
        );
    }
    table
}

/// What the console does with one input line
#[derive(Debug, Clone, PartialEq, Eq)]
enum LineOutcome {
    Reply(String),
    Failed(String),
    Quit,
}

impl LineOutcome {
    fn failed(error: impl std::fmt::Display) -> Self {
        LineOutcome::Failed(error.to_string())
    }
}

fn handle_line(fleet: &FleetEngine, line: &str) -> LineOutcome {
    let line = line.trim();
    match line {
        "" => LineOutcome::Reply(String::new()),
        "help" => LineOutcome::Reply(help_text()),
        "status" => {
            let snapshot = fleet.latest();
            LineOutcome::Reply(format_table(snapshot.tick, &snapshot.stations))
        }
        "quit" | "exit" => LineOutcome::Quit,
        _ => match line.parse::<Command>() {
            Ok(command) => match fleet.apply(&command) {
                Ok(_) => LineOutcome::Reply(format!("OK: {}\n", command)),
                Err(e) => LineOutcome::failed(e),
            },
            Err(e) => LineOutcome::failed(e),
        },
    }
}

pub async fn run_console<W>(
    fleet: &FleetEngine,
    mut lines: mpsc::UnboundedReceiver<String>,
    mut out: W,
) -> std::io::Result<ConsoleExit>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(help_text().as_bytes()).await?;
    out.flush().await?;

    while let Some(line) = lines.recv().await {
        let reply = match handle_line(fleet, &line) {
            LineOutcome::Reply(reply) => reply,
            LineOutcome::Failed(error) => {
                warn!("Console command '{}' failed: {}", line.trim(), error);
                format!("Error: {}\n", error)
            }
            LineOutcome::Quit => {
                info!("Quit requested from console");
                fleet.shutdown();
                return Ok(ConsoleExit::Quit);
            }
        };
        out.write_all(reply.as_bytes()).await?;
        out.flush().await?;
    }

    Ok(ConsoleExit::EndOfInput)
}
