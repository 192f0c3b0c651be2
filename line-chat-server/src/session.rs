use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, trace};

use crate::{
    line::{is_transient, read_line},
    registry::{Registry, Session},
};

pub const PROMPT: &str = "Enter your username: ";
pub const NAME_TAKEN: &str = "Username already taken\n";

pub const DEFAULT_READ_RETRIES: u32 = 5;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Consecutive transient read errors tolerated before the session is dropped.
    pub read_retries: u32,
    /// Upper bound on a single write to this session's peer.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_retries: DEFAULT_READ_RETRIES,
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
        }
    }
}

/// One line of input from a registered participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Quit,
    Users,
    Empty,
    Say(&'a str),
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a str) -> Self {
        match line.trim() {
            "/quit" => Command::Quit,
            "/users" => Command::Users,
            "" => Command::Empty,
            text => Command::Say(text),
        }
    }
}

/// Drives one connection from the username prompt until it disconnects.
///
/// The returned error, if any, has already been contained to this connection:
/// the registry entry is removed and the stream closed before returning.
pub async fn run_session<R, W>(
    reader: R,
    mut writer: W,
    registry: Arc<Registry>,
    config: &SessionConfig,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(reader);

    let Some(name) = prompt_for_name(&mut reader, &mut writer).await? else {
        debug!("peer closed before choosing a username");
        return Ok(());
    };

    let session = Arc::new(Session::new(name, writer, config.write_timeout));
    if let Err(err) = registry.register(Arc::clone(&session)).await {
        reject(&session).await;
        return Err(err.into());
    }
    info!(name = session.name(), "user joined");

    let outcome = run_commands(&registry, &session, &mut reader, config.read_retries).await;

    registry.unregister(session.name()).await;
    if let Err(err) = session.close().await {
        debug!(name = session.name(), error = %err, "failed to close stream");
    }
    info!(name = session.name(), "user left");

    outcome
}

async fn prompt_for_name<R, W>(reader: &mut R, writer: &mut W) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(PROMPT.as_bytes()).await?;
    writer.flush().await?;

    loop {
        let line = read_line(reader)
            .await
            .context("failed to read username")?;
        match line {
            Some(line) => {
                let candidate = line.trim();
                if !candidate.is_empty() {
                    return Ok(Some(candidate.to_string()));
                }
            }
            None => return Ok(None),
        }
    }
}

async fn reject(session: &Session) {
    debug!(name = session.name(), "username already taken");
    if let Err(err) = session.send(NAME_TAKEN).await {
        debug!(error = %err, "failed to send rejection");
    }
    if let Err(err) = session.close().await {
        debug!(error = %err, "failed to close rejected stream");
    }
}

async fn run_commands<R>(
    registry: &Registry,
    session: &Session,
    reader: &mut R,
    read_retries: u32,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut failures = 0;

    loop {
        let line = match read_line(reader).await {
            Ok(Some(line)) => {
                failures = 0;
                line
            }
            Ok(None) => {
                debug!(name = session.name(), "peer closed connection");
                return Ok(());
            }
            Err(err) if is_transient(&err) && failures < read_retries => {
                failures += 1;
                debug!(name = session.name(), failures, error = %err, "tolerating read error");
                continue;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("giving up reading from '{}'", session.name()));
            }
        };

        match Command::parse(&line) {
            Command::Quit => return Ok(()),
            Command::Users => registry.list_users(session).await,
            Command::Empty => {}
            Command::Say(text) => {
                trace!(name = session.name(), text, "broadcasting");
                registry.broadcast(text, session).await;
            }
        }
    }
}
