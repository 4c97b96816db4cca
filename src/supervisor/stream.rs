//! Line reader for child process output
//!
//! Reads stdout/stderr of a supervised process and forwards each line as a
//! [`ProcessEvent`] on the process event channel.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::process::{OutputLine, OutputSource, ProcessEvent};

/// Spawn a task that reads `reader` line by line until EOF.
///
/// Invalid UTF-8 is replaced rather than treated as an error, since tunnel
/// binaries occasionally print box-drawing bytes in odd encodings.
pub fn spawn_reader<R>(
    reader: R,
    source: OutputSource,
    tx: mpsc::Sender<ProcessEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    trace!(target: "devtunnel::output", ?source, "{}", text);
                    let line = ProcessEvent::Line(OutputLine { source, text });
                    if tx.send(line).await.is_err() {
                        debug!(?source, "Output receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(ProcessEvent::IoError(format!("{:?} read failed: {}", source, e)))
                        .await;
                    break;
                }
            }
        }

        debug!(?source, "Output reader finished");
    })
}
