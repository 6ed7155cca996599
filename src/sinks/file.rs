//! Local build event file in one of the supported encodings.

use async_trait::async_trait;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::FileSinkOptions;
use crate::encoding::EventEncoding;
use crate::error::SinkError;
use crate::event::BuildEvent;
use crate::reporter::Reporter;
use crate::transport::{ChannelTransport, EventWriter};

pub struct FileWriter {
    path: PathBuf,
    encoding: EventEncoding,
    out: BufWriter<File>,
}

impl FileWriter {
    /// Create (or truncate) the file. The parent directory must exist.
    pub fn create(path: &Path, encoding: EventEncoding) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            encoding,
            out: BufWriter::new(file),
        })
    }
}

#[async_trait]
impl EventWriter for FileWriter {
    async fn write(&mut self, event: &BuildEvent) -> anyhow::Result<()> {
        let bytes = self.encoding.encode(event)?;
        self.out.write_all(&bytes)?;
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// A local file is acknowledged once it reaches the disk. The sync runs on
    /// the blocking pool so a slow disk cannot stall timers on the runtime.
    async fn acknowledge(&mut self) -> anyhow::Result<()> {
        let file = self.out.get_ref().try_clone()?;
        tokio::task::spawn_blocking(move || file.sync_all())
            .await?
            .map_err(|e| anyhow::anyhow!("failed to sync {}: {}", self.path.display(), e))
    }
}

/// Open a file sink, spawning its writer task.
pub fn open_file_sink(
    name: &str,
    options: &FileSinkOptions,
    encoding: EventEncoding,
    reporter: Arc<dyn Reporter>,
) -> Result<ChannelTransport, SinkError> {
    let writer = FileWriter::create(&options.path, encoding).map_err(|e| SinkError::Construction {
        sink: name.to_string(),
        reason: format!("{}: {}", options.path.display(), e),
    })?;
    Ok(ChannelTransport::spawn(
        name,
        options.timeout(),
        writer,
        reporter,
    ))
}
