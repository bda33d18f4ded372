/*!
 * Durable file sink.
 *
 * Appends raw PCM bytes in the session's byte layout, no container or
 * header; consumers learn the format out of band. All file I/O runs on a
 * dedicated blocking thread fed by the sink's bounded channel.
 */

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::chunk::CaptureChunk;
use crate::error::Result;

pub struct FileSink;

impl FileSink {
    /// Consumes a sink channel onto disk. Returns once the file is created;
    /// the writer thread runs until the channel closes (sink detached or
    /// session closed) or a write fails.
    ///
    /// On a write failure the thread drops the receiver; the capture loop
    /// observes the closed channel and detaches this sink, leaving the
    /// session and its other sinks untouched.
    pub fn spawn(path: &Path, mut rx: mpsc::Receiver<CaptureChunk>) -> Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        let path: PathBuf = path.to_path_buf();

        std::thread::Builder::new()
            .name("audio-file-sink".to_string())
            .spawn(move || {
                let mut written: u64 = 0;
                while let Some(chunk) = rx.blocking_recv() {
                    if let Err(e) = writer.write_all(&chunk.data) {
                        error!("File sink {} write failed: {}", path.display(), e);
                        return;
                    }
                    written += chunk.data.len() as u64;
                }
                if let Err(e) = writer.flush() {
                    error!("File sink {} flush failed: {}", path.display(), e);
                    return;
                }
                debug!("File sink {} closed after {} bytes", path.display(), written);
            })?;

        Ok(())
    }
}
