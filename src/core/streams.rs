use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt},
    task::JoinHandle,
    time::timeout,
};

use crate::constants::OUTPUT_GRACE;

const CHUNK_SIZE: usize = 8 * 1024;

/// Reads until EOF keeping at most `cap` bytes. The rest is drained so the writer never blocks.
pub async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut buffer = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(buffer.len());
                buffer.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    buffer
}

/// Waits briefly for a reader task. Pipes held open by leftover descendants must not stall the caller.
pub async fn collect(task: JoinHandle<Vec<u8>>) -> Vec<u8> {
    let abort = task.abort_handle();
    match timeout(OUTPUT_GRACE, task).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            abort.abort();
            Vec::new()
        }
    }
}

/// Reads one `\n`-terminated line keeping at most `cap` bytes of it.
/// Returns `None` on EOF before any byte. The terminator and a preceding `\r` are stripped.
pub async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    cap: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let mut seen_any = false;
    loop {
        let (consumed, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(seen_any.then_some(line));
            }
            seen_any = true;
            let (content, consumed, done) = match available.iter().position(|b| *b == b'\n') {
                Some(at) => (&available[..at], at + 1, true),
                None => (available, available.len(), false),
            };
            let room = cap.saturating_sub(line.len());
            line.extend_from_slice(&content[..content.len().min(room)]);
            (consumed, done)
        };
        reader.consume(consumed);
        if done {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(line));
        }
    }
}
