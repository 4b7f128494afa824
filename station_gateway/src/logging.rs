use std::io::{self, Write};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct ChannelWriter {
    tx: UnboundedSender<String>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf).to_string();
        let _ = self.tx.send(s);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Initialize logging. `RUST_LOG` wins over `default_level` when set.
/// If a channel is provided, formatted lines are forwarded to it instead of
/// standard output. Calling this twice leaves the first subscriber in place.
pub fn init_logging(default_level: &str, forward: Option<UnboundedSender<String>>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if let Some(tx) = forward {
        let layer = fmt::layer()
            .with_ansi(false)
            .with_writer(move || ChannelWriter { tx: tx.clone() });
        registry.with(layer).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// Drain forwarded lines into `path`, appending. Ends when every sender is
/// dropped.
pub async fn spawn_file_sink(path: PathBuf, mut lines: UnboundedReceiver<String>) -> io::Result<JoinHandle<()>> {
    let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
    Ok(tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if let Err(e) = file.write_all(line.as_bytes()).await {
                eprintln!("log file {}: {}", path.display(), e);
                break;
            }
        }
        let _ = file.flush().await;
    }))
}
