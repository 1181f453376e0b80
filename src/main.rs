use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::{fs, io, process};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

use chess_session::config::{ConfigError, SessionConfigFile};
use chess_session::coordinator::{CoordinatorHandle, GameCoordinator};
use chess_session::domain::GameInfo;
use chess_session::notification::{Notification, Subscription};
use chess_session::remote::server::LichessHttp;
use chess_session::worker::NetworkWorker;
use chess_session::{CoordinatorError, GameState, RemoteSession, SessionError, TimeControl};

#[derive(Debug, Parser)]
#[command(name = "chess-session", version, about = "Play a chess game from the terminal")]
struct Cli {
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Debug, Clone, Subcommand)]
enum Mode {
    /// Wait for an opponent in the lobby (default).
    Seek,
    /// Challenge a specific user.
    Challenge { user: String },
    /// Play both sides on this terminal.
    Local,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("game task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config_text = match fs::read_to_string(&cli.config) {
        Ok(contents) => contents,
        Err(err) => {
            eprintln!("failed to read config {}: {err}", cli.config.display());
            process::exit(1);
        }
    };

    let config = match SessionConfigFile::from_str(&config_text) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid config format: {err}");
            process::exit(1);
        }
    };

    let mode = cli.mode.unwrap_or(Mode::Seek);
    if !matches!(mode, Mode::Local) {
        if let Err(err) = config.validate() {
            eprintln!("invalid config contents: {err}");
            process::exit(1);
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            process::exit(1);
        }
    };

    let result = match mode {
        Mode::Local => runtime.block_on(play_local(&config)),
        remote => match NetworkWorker::new() {
            Ok(worker) => {
                let result = runtime.block_on(play_remote(&config, worker.handle(), remote));
                worker.shutdown();
                result
            }
            Err(err) => Err(err.into()),
        },
    };

    if let Err(err) = result {
        eprintln!("{err}");
        process::exit(1);
    }
}

async fn play_local(config: &SessionConfigFile) -> Result<(), CliError> {
    let info = GameInfo {
        variant: config.game.variant,
        ..GameInfo::default()
    };
    let (mut coordinator, handle) = GameCoordinator::local(
        GameState::new(config.game.variant),
        TimeControl::from_spec(config.game.time_control),
        info,
        config.coordinator_config(),
    );
    let subscription = coordinator.subscribe();
    drive(coordinator, handle, subscription).await
}

async fn play_remote(config: &SessionConfigFile, network: Handle, mode: Mode) -> Result<(), CliError> {
    let server = Arc::new(LichessHttp::new(&config.server.base_url, config.token()?)?);
    let (session, events) = RemoteSession::new(server, network, config.session_config());

    let username = session.connect().await?;
    println!("connected as {username}");

    let negotiated = match mode {
        Mode::Challenge { user } => {
            println!("challenging {user}");
            session
                .create_challenge(config.challenge_request(&user), config.challenge_timeout())
                .await
        }
        _ => {
            println!("seeking a game ({})", config.game.time_control);
            session
                .seek_game(config.seek_request(), config.seek_timeout())
                .await
        }
    };
    let game = match negotiated {
        Ok(game) => game,
        Err(err) => {
            session.close();
            return Err(err.into());
        }
    };
    tracing::info!(game_id = %game.game_id, "game negotiated");

    let (mut coordinator, handle) = GameCoordinator::remote(session, events, config.coordinator_config());
    let subscription = coordinator.subscribe();
    drive(coordinator, handle, subscription).await
}

async fn drive(
    coordinator: GameCoordinator,
    handle: CoordinatorHandle,
    mut subscription: Subscription,
) -> Result<(), CliError> {
    let runner = tokio::spawn(coordinator.run());
    let printer = tokio::spawn(async move {
        while let Some(notification) = subscription.notifications.recv().await {
            match notification {
                Notification::ClockTick { .. } => tracing::debug!(%notification, "clock"),
                Notification::GameOver(_) => println!("{notification}\ntype quit to exit"),
                _ => println!("{notification}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        if let Err(err) = dispatch(&handle, line).await {
            println!("{err}");
        }
    }

    handle.shutdown();
    let game = runner.await?;
    printer.await?;
    if game.ply() > 0 {
        println!("{}", game.to_pgn(&[]));
    }
    Ok(())
}

async fn dispatch(handle: &CoordinatorHandle, line: &str) -> Result<(), CoordinatorError> {
    let (command, rest) = line
        .split_once(' ')
        .map_or((line, ""), |(command, rest)| (command, rest.trim()));
    match command {
        "resign" => handle.resign().await,
        "draw" => handle.offer_draw().await,
        "accept" => handle.respond_to_draw(true).await,
        "decline" => handle.respond_to_draw(false).await,
        "abort" => handle.abort().await,
        "chat" => handle.send_chat(rest).await,
        "fen" => {
            let snapshot = handle.snapshot().await?;
            println!("{}", snapshot.current_fen);
            Ok(())
        }
        uci => handle.play_move(uci).await.map(|_| ()),
    }
}
