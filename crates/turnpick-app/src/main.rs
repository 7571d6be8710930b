// Turnpick entry point.
//
// Startup sequence:
// 1. Load config
// 2. Initialize tracing (log to file, not terminal)
// 3. Fetch league metadata and the club cap (fatal on failure)
// 4. Schedule the draft if we are the admin and it is unscheduled
// 5. Wait for the join window
// 6. Create mpsc channels and spawn the session loop
// 7. Console loop: stdin commands in, session updates out
// 8. Cleanup on exit

use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use turnpick_app::api::LeagueClient;
use turnpick_app::config::{self, Config};
use turnpick_app::console::{self, Console, Input};
use turnpick_core::error::EngineError;
use turnpick_core::league::{DraftInfo, DraftSettings, SessionPhase};
use turnpick_core::protocol::SessionId;
use turnpick_core::session::{self, SessionCommand, SessionEnd, SessionState};
use turnpick_core::ws::WsConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = config::load_config().context("failed to load configuration")?;

    // 2. Initialize tracing
    init_tracing(&config)?;
    info!(
        "Turnpick starting up: session {}, participant {} ({})",
        config.session.session_id, config.credentials.username, config.credentials.participant_id
    );

    let context = config.session_context();
    let session_id = context.session_id;
    let league = LeagueClient::new(&config.server.api_base_url, context.credential.clone());

    // 3. League metadata and squad constraint
    let mut info =
        fetch_or_explain(league.draft_info(session_id).await.map_err(EngineError::from))?;
    let constraint = fetch_or_explain(
        league
            .max_players_same_club(session_id)
            .await
            .map_err(EngineError::from),
    )?;
    info!("League status {:?}, club cap {}", info.status, constraint.max_per_club);

    // 4. Admin scheduling
    if info.phase() == SessionPhase::Unscheduled && info.is_admin(&context.local) {
        info = schedule_draft(&league, &config, session_id, info).await?;
    }

    // 5. Join window
    let info = wait_until_joinable(&league, session_id, info).await?;
    info!("Joining draft (status {:?})", info.status);

    // 6. Channels and session loop
    let (events_tx, events_rx) = mpsc::channel(session::EVENT_CAPACITY);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ui_tx, mut ui_rx) = mpsc::channel(session::EVENT_CAPACITY);

    let local_id = context.local.id;
    let state = SessionState::new(
        context,
        Box::new(WsConnector::new(&config.server.ws_url)),
        constraint,
        config.reconnect_policy(),
        events_tx,
    );
    let session_handle = tokio::spawn(session::run(events_rx, cmd_rx, ui_tx, state));

    // 7. Console loop
    println!("{}", console::HELP);
    let mut console = Console::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // Once stdin reaches EOF the read branch is disabled so select! never
    // spins on it.
    let mut stdin_open = true;

    loop {
        tokio::select! {
            update = ui_rx.recv() => {
                match update {
                    Some(update) => {
                        for line in console.render(update) {
                            println!("{line}");
                        }
                    }
                    None => break,
                }
            }

            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match console::parse_line(&line) {
                        Ok(Input::Session(cmd)) => {
                            if cmd_tx.send(cmd).await.is_err() {
                                break;
                            }
                        }
                        Ok(Input::Browse { query, show_all }) => {
                            for row in console.browse(&query, show_all) {
                                println!("{row}");
                            }
                        }
                        Ok(Input::Squad(name)) => {
                            for row in console.squad(local_id, name.as_deref()) {
                                println!("{row}");
                            }
                        }
                        Ok(Input::Squads) => {
                            for row in console.squads() {
                                println!("{row}");
                            }
                        }
                        Ok(Input::Help) => println!("{}", console::HELP),
                        Err(message) => println!("{message}"),
                    },
                    Ok(None) => {
                        info!("stdin closed");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("stdin read failed: {e}");
                        stdin_open = false;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving session");
                let _ = cmd_tx.send(SessionCommand::Leave).await;
            }
        }
    }

    // 8. Cleanup: wait for the session task to finish (with timeout)
    let end = tokio::time::timeout(Duration::from_secs(5), session_handle).await;
    match end {
        Ok(Ok(SessionEnd::Completed)) => println!("Draft complete."),
        Ok(Ok(SessionEnd::Left)) => println!("Left the draft."),
        Ok(Err(e)) => error!("Session task failed: {e}"),
        Err(_) => warn!("Session task did not stop in time"),
    }

    info!("Turnpick shut down cleanly");
    Ok(())
}

/// Print the user-facing form of a fatal fetch error and turn it into an
/// `anyhow` error for the exit path.
fn fetch_or_explain<T>(result: Result<T, EngineError>) -> anyhow::Result<T> {
    result.map_err(|e| {
        error!("{e}");
        eprintln!("{e} ({})", e.remedy());
        anyhow::Error::new(e).context("cannot enter the draft session")
    })
}

async fn schedule_draft(
    league: &LeagueClient,
    config: &Config,
    session_id: SessionId,
    info: DraftInfo,
) -> anyhow::Result<DraftInfo> {
    let Some(schedule) = &config.schedule else {
        println!("The draft is not scheduled yet. Add a [schedule] section to schedule it.");
        return Ok(info);
    };
    let Some(start) = schedule.start() else {
        bail!("schedule.start_time is not a valid timestamp");
    };
    let settings = DraftSettings {
        draft_start_time: start,
        turn_duration_secs: schedule.turn_duration_secs,
    };
    if let Err(message) = settings.validate(Utc::now()) {
        bail!("cannot schedule the draft: {message}");
    }
    fetch_or_explain(
        league
            .submit_draft_settings(session_id, &settings)
            .await
            .map_err(EngineError::from),
    )?;
    println!("Draft scheduled for {start}.");
    fetch_or_explain(league.draft_info(session_id).await.map_err(EngineError::from))
}

async fn wait_until_joinable(
    league: &LeagueClient,
    session_id: SessionId,
    mut info: DraftInfo,
) -> anyhow::Result<DraftInfo> {
    loop {
        let now = Utc::now();
        if info.can_join(now) {
            return Ok(info);
        }
        let Some(wait) = info.until_joinable(now) else {
            bail!("the draft cannot be joined while the league is {:?}", info.status);
        };
        let wait = wait.to_std().unwrap_or(Duration::ZERO).max(Duration::from_secs(1));
        println!("The draft room opens in {}s.", wait.as_secs());
        tokio::time::sleep(wait).await;
        info = fetch_or_explain(league.draft_info(session_id).await.map_err(EngineError::from))?;
    }
}

/// Initialize tracing to log to a file (the terminal is used for the console).
fn init_tracing(config: &Config) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::path::PathBuf::from(&config.logging.directory);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let log_file = std::fs::File::create(log_dir.join("turnpick.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
