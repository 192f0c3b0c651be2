use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Longest line accepted from a peer, newline included.
pub const MAX_LINE_BYTES: usize = 4096;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Reads one newline-terminated line, without its line ending.
///
/// Returns `Ok(None)` once the peer has closed the stream. A final line that is
/// not newline-terminated is still returned before `None`.
///
/// Lines longer than [`MAX_LINE_BYTES`] and lines that are not valid UTF-8 are
/// consumed in full and reported as [`io::ErrorKind::InvalidData`], so the next
/// call starts cleanly at the following line.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut overflowed = false;
    let mut saw_bytes = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if !saw_bytes {
                return Ok(None);
            }
            break;
        }
        saw_bytes = true;

        let (used, terminated) = match available.iter().position(|byte| *byte == b'\n') {
            Some(index) => (index + 1, true),
            None => (available.len(), false),
        };

        // Keep draining an over-long line so the stream stays aligned on line boundaries.
        if !overflowed {
            if line.len() + used > MAX_LINE_BYTES {
                overflowed = true;
                line.clear();
            } else {
                line.extend_from_slice(&available[..used]);
            }
        }
        reader.consume(used);

        if terminated {
            break;
        }
    }

    if overflowed {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {MAX_LINE_BYTES} bytes"),
        ));
    }

    let text =
        String::from_utf8(line).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(text.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Whether a read error leaves the stream usable for the next line.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidData | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}
