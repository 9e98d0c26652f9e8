use clap::Parser;
use eyre::Context;
use live_viewer::{Config, ViewerSession};
use reqwest::Url;
use std::io::IsTerminal;
use tokio::io::AsyncBufReadExt;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Watch a live room from the terminal: liveness, chat and stream status.
///
/// Lines typed on stdin are sent to the room's chat.
#[derive(Parser, Debug)]
#[command(name = "live-viewer", version)]
struct Args {
    /// Room to watch
    #[arg(env = "LIVE_VIEWER_ROOM")]
    room: String,

    /// Origin serving /isLive, /chat and /hls
    #[arg(long, env = "LIVE_VIEWER_ORIGIN", default_value = live_viewer::config::DEFAULT_ORIGIN)]
    origin: Url,

    /// Program that plays the HLS stream, e.g. "mpv --no-terminal"
    #[arg(long, env = "LIVE_VIEWER_PLAYER")]
    player: Option<String>,

    /// Accept self-signed TLS certificates from the origin
    #[arg(long, env = "LIVE_VIEWER_INSECURE")]
    insecure: bool,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    let args = Args::parse();
    let config = Config {
        player: args.player,
        insecure: args.insecure,
        ..Config::new(args.origin, args.room)
    };

    let session = ViewerSession::mount(&config)
        .with_context(|| format!("mount session for room '{}'", config.room))?;

    let mut liveness = session.liveness();
    let mut playback = session.playback();
    let mut status = session.chat_status();
    let mut history = session.chat_history();
    let mut seen = 0;
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(()) = liveness.changed() => {
                if let Some(fact) = &*liveness.borrow_and_update() {
                    let state = if fact.is_live { "LIVE" } else { "offline" };
                    println!("[{state}] {}", fact.title);
                }
            }
            Ok(()) = playback.changed() => {
                let state = *playback.borrow_and_update();
                println!("[stream] {state}");
            }
            Ok(()) = status.changed() => {
                let status = *status.borrow_and_update();
                if status != live_viewer::ChatStatus::Clear {
                    println!("[chat] {status}");
                }
            }
            Ok(()) = history.changed() => {
                let history = history.borrow_and_update();
                for message in history.iter().skip(seen) {
                    println!("{} {}", message.timestamp, message.text);
                }
                seen = history.len();
            }
            line = stdin.next_line(), if stdin_open => match line.context("read stdin")? {
                Some(line) => session.send(line),
                None => stdin_open = false,
            },
        }
    }

    session.unmount().await;
    Ok(())
}
