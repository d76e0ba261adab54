//! Write-Ahead Log for durability
//!
//! File format: a sequence of entries `[total_len:u32][cmd:u8][payload]`,
//! little-endian. An entry is durable once `append` returns: the writer
//! mutex is held across buffered write, flush, and fsync.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{DbError, Result};
use crate::protocol::CommandKind;

pub struct Wal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    sync_writes: bool,
}

impl Wal {
    /// Open the log, creating it if absent. Appends land at the end.
    pub fn open(path: impl Into<PathBuf>, sync_writes: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            sync_writes,
        })
    }

    /// Append one entry and fsync. Returns only after the entry is durable.
    pub async fn append(&self, cmd: CommandKind, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;

        let total_len = (payload.len() + 1) as u32;
        let write = |w: &mut BufWriter<File>| -> std::io::Result<()> {
            w.write_all(&total_len.to_le_bytes())?;
            w.write_all(&[cmd as u8])?;
            w.write_all(payload)?;
            w.flush()
        };
        write(&mut writer).map_err(|e| DbError::WalWrite(e.to_string()))?;

        if self.sync_writes {
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| DbError::WalWrite(format!("fsync: {}", e)))?;
        }

        Ok(())
    }

    /// Flush and fsync without appending
    pub async fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Flush, delete the file, and reopen it empty. Used after a snapshot
    /// so the log only holds operations newer than the snapshot.
    pub async fn rotate(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        std::fs::remove_file(&self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        *writer = BufWriter::new(file);

        Ok(())
    }

    /// Flush and fsync for shutdown
    pub async fn close(&self) -> Result<()> {
        self.sync().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a replay iterator over an existing log file
    pub fn replay(path: impl AsRef<Path>) -> Result<WalReplay> {
        let file = File::open(path.as_ref())?;
        Ok(WalReplay {
            reader: BufReader::new(file),
            done: false,
        })
    }
}

/// Sequential reader over WAL entries.
///
/// A short or garbled tail is logged and treated as end-of-log: everything
/// before it is committed, the trailing bytes are discarded.
pub struct WalReplay {
    reader: BufReader<File>,
    done: bool,
}

impl Iterator for WalReplay {
    type Item = (CommandKind, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let mut len_buf = [0u8; 4];
            match self.reader.read_exact(&mut len_buf) {
                Ok(_) => {}
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        warn!(error = %e, "WAL read failed, treating as end of log");
                    }
                    self.done = true;
                    return None;
                }
            }

            let total_len = u32::from_le_bytes(len_buf) as usize;
            if total_len == 0 {
                warn!("zero-length WAL entry, treating as end of log");
                self.done = true;
                return None;
            }

            let mut body = vec![0u8; total_len];
            if let Err(e) = self.reader.read_exact(&mut body) {
                warn!(error = %e, "truncated WAL tail discarded");
                self.done = true;
                return None;
            }

            match CommandKind::from_u8(body[0]) {
                Some(kind) => return Some((kind, body.split_off(1))),
                None => {
                    // Unknown type mid-log means corruption; skipping one
                    // entry keeps the data before and after it.
                    warn!(byte = body[0], "unknown command type in WAL, skipping entry");
                }
            }
        }
    }
}
