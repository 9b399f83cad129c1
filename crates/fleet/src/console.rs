//! Line-oriented developer console driving the loopback network from stdin.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use fleet_core::{
    domain::{Address, SessionId},
    fleet::Fleet,
};
use fleet_loopback::LoopbackConnector;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const HELP: &str = "\
commands:
  pair <number>                 start pairing, prints the code
  confirm <code>                enter a code on the simulated phone
  list                          live sessions
  say <id> <from> <text...>     deliver a direct message to a session
  outbox <id>                   what a session has sent
  settings <id>                 show a session's settings
  delete <id>                   remove a session and its stored data
  logout <id>                   revoke a session from the phone side
  stats                         counts
  quit";

/// Log every fleet notification as a JSON line until cancelled.
pub async fn spawn_observer(fleet: Arc<Fleet>, cancel: CancellationToken) -> JoinHandle<()> {
    let (active, mut rx) = fleet.subscribe().await;
    info!(active, "observer attached");
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = rx.recv() => match ev {
                    Ok(ev) => match serde_json::to_string(&ev) {
                        Ok(json) => info!(event = %json, "fleet event"),
                        Err(e) => warn!(error = %e, "unserializable fleet event"),
                    },
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "observer lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

pub async fn run(fleet: Arc<Fleet>, connector: Arc<LoopbackConnector>, cancel: CancellationToken) {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => {
                info!("stdin closed; console disabled");
                return;
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed; console disabled");
                return;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            cancel.cancel();
            return;
        }

        match execute(&fleet, &connector, line).await {
            Ok(out) if !out.is_empty() => println!("{out}"),
            Ok(_) => {}
            Err(e) => println!("error: {e:#}"),
        }
    }
}

fn session_arg(arg: Option<&str>) -> anyhow::Result<SessionId> {
    let raw = arg
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| anyhow!("missing session id"))?;
    SessionId::from_loose(raw).ok_or_else(|| anyhow!("{raw:?} is not a session id"))
}

async fn execute(
    fleet: &Arc<Fleet>,
    connector: &LoopbackConnector,
    line: &str,
) -> anyhow::Result<String> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("").to_lowercase();
    let rest = parts.next().unwrap_or("").trim();

    match cmd.as_str() {
        "help" => Ok(HELP.to_string()),

        "pair" => {
            let handle = fleet
                .pair(rest)
                .await
                .map_err(|e| anyhow!("{} ({})", e, e.kind()))?;
            let id = handle.session_id.clone();
            let code = handle.code.clone();
            let deadline = handle.deadline;
            tokio::spawn(async move {
                let state = handle.wait().await;
                println!("pairing {id}: {state}");
            });
            Ok(format!("code {code} (expires {})", deadline.to_rfc3339()))
        }

        "confirm" => {
            let id = connector.confirm(rest).await?;
            Ok(format!("confirmed {id}"))
        }

        "list" => {
            let ids = fleet.sessions().await;
            if ids.is_empty() {
                return Ok("no sessions".to_string());
            }
            Ok(ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join("\n"))
        }

        "say" => {
            let mut args = rest.splitn(3, char::is_whitespace);
            let id = session_arg(args.next())?;
            let from: Address = args
                .next()
                .ok_or_else(|| anyhow!("missing sender"))?
                .parse()
                .map_err(|e: String| anyhow!(e))?;
            let text = args.next().unwrap_or("").trim();
            if text.is_empty() {
                bail!("missing text");
            }
            let msg_id = connector.deliver_text(&id, &from, &from, text)?;
            Ok(format!("delivered {msg_id}"))
        }

        "outbox" => {
            let id = session_arg(Some(rest))?;
            Ok(connector
                .outbox(&id)
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n"))
        }

        "settings" => {
            let id = session_arg(Some(rest))?;
            let settings = fleet.get_settings(&id).await;
            serde_json::to_string_pretty(&settings).context("serialize settings")
        }

        "delete" => {
            let id = session_arg(Some(rest))?;
            if fleet.remove(&id).await {
                Ok(format!("removed {id}"))
            } else {
                Ok(format!("{id} is not a live session"))
            }
        }

        "logout" => {
            let id = session_arg(Some(rest))?;
            connector.log_out(&id, "logged out from console")?;
            Ok(format!("logout sent to {id}"))
        }

        "stats" => Ok(format!(
            "sessions: {}\npairings in flight: {}\nsettings records: {}\nlinked identities: {}",
            fleet.registry().len().await,
            fleet.pairings_in_flight(),
            fleet.settings().len().await,
            fleet.identities().len().await,
        )),

        other => bail!("unknown command {other:?}; try `help`"),
    }
}
