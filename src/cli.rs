//! Runs one command against the configured cache directory.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::select;
use tracing::{debug, info};

use ttl_fcache::{
    CacheDirectory, CacheError, EndOptions, OpenDirectoryError, WriteStreamOutcome,
};

use crate::Command;
use crate::app_config::Config;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Failed to open the cache directory: {0}")]
    Open(#[from] OpenDirectoryError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether the command found what it was asked for.
pub enum Status {
    Found,
    Absent,
}

async fn get(cache: &CacheDirectory, name: &str, chunk_size: usize) -> Result<Status, CliError> {
    let Some(mut session) = cache.read_as_stream(name, chunk_size).await? else {
        return Ok(Status::Absent);
    };

    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = session.next_chunk().await? {
        stdout.write_all(&chunk).await?;
    }
    stdout.flush().await?;
    session
        .end(EndOptions::default().wait_for_close(true))
        .await?;
    Ok(Status::Found)
}

async fn put(
    cache: &CacheDirectory,
    name: &str,
    value: Option<String>,
    chunk_size: usize,
) -> Result<Status, CliError> {
    if let Some(value) = value {
        let outcome = cache.write_as_buffer(name, value).await?;
        println!("{outcome:?}");
        return Ok(Status::Found);
    }

    let mut session = match cache.write_as_stream(name, chunk_size, None).await? {
        WriteStreamOutcome::Opened(session) => session,
        WriteStreamOutcome::CanceledByNewerRequest => {
            println!("CanceledByNewerRequest");
            return Ok(Status::Found);
        }
    };

    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0; chunk_size];
    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        session.write(&buf[..n]).await?;
    }
    session
        .end(EndOptions::default().wait_for_close(true))
        .await?;
    println!("CompletedSuccessfully");
    Ok(Status::Found)
}

const SHELL_USAGE: &str = "commands: get <name> | put <name> <value> | stat | quit";

async fn shell(cache: &CacheDirectory) -> Result<Status, CliError> {
    println!("{SHELL_USAGE}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                debug!("Received Ctrl+C signal, shutting down...");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let mut words = line.trim().splitn(3, ' ');
        match (words.next(), words.next(), words.next()) {
            (Some("get"), Some(name), None) => match cache.read_as_buffer(name).await {
                Ok(Some(bytes)) => println!("{}", String::from_utf8_lossy(&bytes)),
                Ok(None) => println!("(absent)"),
                Err(e) => println!("error: {e}"),
            },
            (Some("put"), Some(name), Some(value)) => {
                match cache.write_as_buffer(name, value.to_owned()).await {
                    Ok(outcome) => println!("{outcome:?}"),
                    Err(e) => println!("error: {e}"),
                }
            }
            (Some("stat"), None, None) => {
                let limiter = cache.read_limiter();
                println!(
                    "entities: {}, reads in use: {}/{}",
                    cache.entity_count(),
                    limiter.in_use(),
                    limiter.max()
                );
            }
            (Some("quit" | "exit"), None, None) => break,
            (Some(""), None, None) => {}
            _ => println!("{SHELL_USAGE}"),
        }
    }
    Ok(Status::Found)
}

/// Main entry point for a command.
pub async fn run(config: Config, command: Command) -> Result<Status, CliError> {
    let cache = CacheDirectory::open(
        &config.cache.path,
        config.cache.create_if_missing,
        config.cache.to_options(),
    )
    .await?;
    let chunk_size = config.cache.chunk_size();

    match command {
        Command::Get { name } => get(&cache, &name, chunk_size).await,
        Command::Put { name, value } => put(&cache, &name, value, chunk_size).await,
        Command::Clear => {
            ttl_fcache::io::remove_dir_contents(cache.path()).await?;
            info!(path = ?cache.path(), "Cleared cache directory.");
            Ok(Status::Found)
        }
        Command::Shell => shell(&cache).await,
    }
}

pub fn spawn(config: Config, command: Command) -> Result<Status, CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, command))
}
