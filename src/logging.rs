use std::io::Write;
use tokio::sync::broadcast;
use tracing_subscriber::fmt::MakeWriter;

/// Forwards each formatted tracing line to stdout and, when anyone is
/// tailing `/api/logs`, to the broadcast channel behind it.
pub(crate) struct LogTeeMakeWriter {
    sender: broadcast::Sender<String>,
}

impl LogTeeMakeWriter {
    pub fn new(sender: broadcast::Sender<String>) -> Self {
        Self { sender }
    }
}

impl<'a> MakeWriter<'a> for LogTeeMakeWriter {
    type Writer = LogTeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogTeeWriter {
            sender: self.sender.clone(),
        }
    }
}

pub(crate) struct LogTeeWriter {
    sender: broadcast::Sender<String>,
}

impl Write for LogTeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // SSE frames carry one line each; skip the broadcast entirely when
        // nothing is subscribed.
        if self.sender.receiver_count() > 0 {
            let line = String::from_utf8_lossy(buf);
            let line = line.trim_end();
            if !line.is_empty() {
                let _ = self.sender.send(line.to_string());
            }
        }
        std::io::stdout().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()
    }
}
