use std::io;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Debug sink: appends one serialized envelope per line instead of
/// spooling. Selected via the `BEACON_TELEMETRY_FILE` environment
/// variable.
#[derive(Debug)]
pub(crate) struct FileSink {
    file: tokio::fs::File,
}

impl FileSink {
    pub(crate) async fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self { file })
    }

    pub(crate) async fn append(&mut self, line: &[u8]) {
        let result = async {
            self.file.write_all(line).await?;
            self.file.write_all(b"\n").await?;
            self.file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "file_sink.write.failed");
        }
    }
}
