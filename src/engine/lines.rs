//! Line-oriented reading of engine output streams.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Default bound of a line channel.
pub const DEFAULT_LINE_CAPACITY: usize = 64;

/// Forward complete lines from `reader` into a bounded channel.
///
/// Partial lines are buffered until their newline arrives, so a line split
/// across reads is still delivered whole. The channel closes when the stream
/// reaches EOF, which for a child pipe means the process ended.
#[must_use]
pub fn line_channel<R>(reader: R, capacity: usize) -> mpsc::Receiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(error = %err, "Engine output stream closed with an error");
                    break;
                }
            }
        }
    });
    rx
}
