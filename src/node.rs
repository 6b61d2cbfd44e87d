use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};

use crate::indicator::Indicator;
use crate::session::{Session, MAX_WRITE_LEN};
use crate::transfer::Driver;

/// Filesystem-visible endpoint standing in for a character device node.
///
/// Each connection is one session: a non-empty input line is written to
/// the peripheral and answered with the accepted byte count, an empty
/// line asks for a status read.
pub struct DeviceNode {
    listener: UnixListener,
    path: PathBuf,
    driver: Arc<Driver>,
    indicator: Arc<dyn Indicator>,
}

impl DeviceNode {
    pub fn bind(
        path: &Path,
        driver: Arc<Driver>,
        indicator: Arc<dyn Indicator>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create {}", parent.display()))?;
        }
        // A stale socket from a previous run blocks bind.
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(format!("Failed to clear {}", path.display())),
        }

        let listener = UnixListener::bind(path)
            .context(format!("Failed to bind device node at {}", path.display()))?;
        info!("device node listening on {}", path.display());
        Ok(DeviceNode {
            listener,
            path: path.to_path_buf(),
            driver,
            indicator,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn serve(&self) -> Result<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .context("device node accept failed")?;
            let session = Session::open(self.driver.clone(), self.indicator.clone());
            tokio::spawn(handle_connection(stream, session));
        }
    }
}

async fn handle_connection(stream: UnixStream, mut session: Session) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            match session.read(MAX_WRITE_LEN) {
                Ok(out) => send(&mut write_half, &out).await,
                Err(err) => {
                    warn!("read failed: {}", err);
                    send(&mut write_half, b"-1\n").await;
                }
            }
        } else {
            match session.write(line.as_bytes()).await {
                Ok(count) => send(&mut write_half, format!("{}\n", count).as_bytes()).await,
                Err(err) => {
                    warn!("write failed: {}", err);
                    send(&mut write_half, b"-1\n").await;
                }
            }
        }
    }
    session.close();
}

async fn send(half: &mut OwnedWriteHalf, bytes: &[u8]) {
    if let Err(err) = half.write_all(bytes).await {
        warn!("device node reply dropped: {}", err);
    }
}
