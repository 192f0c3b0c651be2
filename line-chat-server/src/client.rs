use std::{io::BufRead, thread};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::cli::ClientArgs;

const READ_CHUNK: usize = 4096;
const INPUT_QUEUE: usize = 32;

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (mut reader, mut writer) = stream.into_split();
    if let Some(name) = &args.name {
        send_line(&mut writer, name).await?;
    }

    let mut input = spawn_stdin_reader();
    let mut stdout = tokio::io::stdout();

    select! {
        outcome = run_client_loop(&mut reader, &mut writer, &mut input, &mut stdout) => outcome?,
        ctrl_c = tokio::signal::ctrl_c() => handle_ctrl_c(ctrl_c),
    }
    shutdown_connection(&mut writer).await;

    Ok(())
}

/// Reads stdin on a plain thread so leaving the chat never waits on a pending read.
///
/// The thread stays blocked on stdin after the session ends; process exit reclaims it.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(INPUT_QUEUE);
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Pumps server output to `output` and input lines to the server until the
/// server closes the connection.
async fn run_client_loop<R, W, O>(
    reader: &mut R,
    writer: &mut W,
    input: &mut mpsc::Receiver<String>,
    output: &mut O,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut buffer = vec![0; READ_CHUNK];
    let mut input_open = true;

    loop {
        select! {
            bytes_read = reader.read(&mut buffer) => {
                if !handle_server_bytes(bytes_read, &buffer, output).await? {
                    break;
                }
            }
            line = input.recv(), if input_open => {
                input_open = handle_input_line(line, writer).await?;
            }
        }
    }
    Ok(())
}

/// Copies server output verbatim; the prompt has no trailing newline.
async fn handle_server_bytes<O>(
    bytes_read: io::Result<usize>,
    buffer: &[u8],
    output: &mut O,
) -> Result<bool>
where
    O: AsyncWrite + Unpin,
{
    let bytes_read = bytes_read.context("failed to read from server")?;
    if bytes_read == 0 {
        debug!("server closed the connection");
        return Ok(false);
    }

    output.write_all(&buffer[..bytes_read]).await?;
    output.flush().await?;
    Ok(true)
}

/// Forwards one input line. Returns whether input is still open.
async fn handle_input_line<W>(line: Option<String>, writer: &mut W) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    match line {
        Some(line) => {
            send_line(writer, line.trim_end_matches('\r')).await?;
            Ok(true)
        }
        None => {
            // Half-close so the server sees the end of input and cleans up the session.
            writer.shutdown().await?;
            Ok(false)
        }
    }
}

async fn send_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shutdown client writer cleanly");
    }
}
