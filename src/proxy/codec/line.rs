use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::util::timeout_with_context;

/// Read a single `\n`-terminated line, bounding each socket read by
/// `timeout_dur` and the whole line by `max_len` bytes. Returns 0 on a clean
/// EOF before any byte arrived.
pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available =
            timeout_with_context(timeout_dur, reader.fill_buf(), "reading protocol line").await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed mid-line");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected.len() + consume > max_len {
            bail!("line exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = String::from_utf8(collected).map_err(|_| anyhow!("line contained invalid bytes"))?;
    let len = line.len();
    *buf = line;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader, duplex};

    #[tokio::test]
    async fn reads_lines_and_reports_eof() -> Result<()> {
        let (mut tx, rx) = duplex(64);
        tx.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n").await?;
        drop(tx);

        let mut reader = BufReader::new(rx);
        let mut line = String::new();
        read_line_with_timeout(&mut reader, &mut line, Duration::from_secs(1), 128).await?;
        assert_eq!(line, "GET / HTTP/1.1\r\n");
        read_line_with_timeout(&mut reader, &mut line, Duration::from_secs(1), 128).await?;
        assert_eq!(line, "Host: x\r\n");
        let read =
            read_line_with_timeout(&mut reader, &mut line, Duration::from_secs(1), 128).await?;
        assert_eq!(read, 0);
        Ok(())
    }

    #[tokio::test]
    async fn enforces_length_limit() -> Result<()> {
        let (mut tx, rx) = duplex(64);
        tx.write_all(b"0123456789abcdef\r\n").await?;
        drop(tx);

        let mut reader = BufReader::new(rx);
        let mut line = String::new();
        let err = read_line_with_timeout(&mut reader, &mut line, Duration::from_secs(1), 8)
            .await
            .expect_err("line over limit must fail");
        assert!(err.to_string().contains("exceeds"));
        Ok(())
    }
}
