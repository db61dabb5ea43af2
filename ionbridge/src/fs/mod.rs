//! Asynchronous filesystem service.
//!
//! Every operation returns immediately after enqueueing work on the reactor;
//! the reply arrives later through the callback, on the reactor thread.
//! Positional reads and writes run on the blocking pool and never move the
//! file cursor, so concurrent operations on one descriptor cannot corrupt
//! each other's offsets.
//!
//! Descriptors live in the service's resource table and are reclaimed by the
//! descriptor cleanup ledger when unretained and idle.

pub mod constants;

use std::fs::{DirBuilder, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tracing::debug;

use crate::buffers::SharedBufferLedger;
use crate::error::CoreError;
use crate::id::{rand64, Id};
use crate::ipc::message::Seq;
use crate::ipc::reply::{Reply, ReplyFn};
use crate::reactor::Dispatcher;
use crate::resource::Table;
use crate::response::{Headers, QueuedResponse, ResponseStore};

pub use constants::{constants, constants_json};

/// Copy-file flag: fail if the destination already exists.
pub const COPYFILE_EXCL: i32 = 1;

/// An open file or directory handle.
pub enum Descriptor {
    File(Arc<File>),
    /// Directory handles are scoped to a `readdir` call; the path is kept
    /// for diagnostics while the enumeration is in flight.
    Directory(std::path::PathBuf),
}

impl Descriptor {
    pub fn is_file(&self) -> bool {
        matches!(self, Descriptor::File(_))
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Descriptor::Directory(_))
    }
}

/// The filesystem service.
pub struct FsService {
    dispatcher: Dispatcher,
    descriptors: Arc<Table<Descriptor>>,
    store: Arc<ResponseStore>,
    ledger: Arc<SharedBufferLedger>,
    buffer_ttl: Duration,
}

impl FsService {
    pub fn new(
        dispatcher: Dispatcher,
        store: Arc<ResponseStore>,
        ledger: Arc<SharedBufferLedger>,
        buffer_ttl: Duration,
    ) -> Self {
        Self {
            dispatcher,
            descriptors: Arc::new(Table::new()),
            store,
            ledger,
            buffer_ttl,
        }
    }

    /// The descriptor table, shared with the cleanup ledger.
    pub fn descriptors(&self) -> &Arc<Table<Descriptor>> {
        &self.descriptors
    }

    /// Exempts (or re-exposes) a descriptor to staleness reclaim.
    pub fn retain(&self, id: Id, retained: bool) -> bool {
        self.descriptors.set_retained(id, retained)
    }

    /// Opens `path` and registers the descriptor under `id`.
    pub fn open(&self, seq: Seq, id: Id, path: String, flags: i32, mode: u32, cb: ReplyFn) {
        let descriptors = Arc::clone(&self.descriptors);
        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let reply =
                    match run_blocking(move || open_options(flags, mode).open(&path)).await {
                        Ok(file) => {
                            let fd = file.as_raw_fd();
                            descriptors.insert(id, Descriptor::File(Arc::new(file)));
                            Reply::data(
                                seq,
                                "fs.open",
                                json!({ "id": id.to_string(), "fd": fd }),
                            )
                        }
                        Err(error) => Reply::from_error(seq, "fs.open", &error, Some(id)),
                    };
                cb(reply);
            });
        });
    }

    /// Closes the descriptor under `id`. Reports `ENOTOPEN` for ids that are
    /// unknown or already closed.
    pub fn close(&self, seq: Seq, id: Id, cb: ReplyFn) {
        if !self.descriptors.contains(id) {
            cb(Reply::from_error(seq, "fs.close", &CoreError::NotOpen(id), Some(id)));
            return;
        }

        let descriptors = Arc::clone(&self.descriptors);
        self.dispatcher.dispatch(move || {
            let reply = match descriptors.remove(id) {
                Some(Descriptor::File(file)) => {
                    let fd = file.as_raw_fd();
                    // Last strong reference closes the fd.
                    drop(file);
                    Reply::data(seq, "fs.close", json!({ "id": id.to_string(), "fd": fd }))
                }
                Some(Descriptor::Directory(_)) => {
                    Reply::data(seq, "fs.close", json!({ "id": id.to_string() }))
                }
                None => Reply::from_error(seq, "fs.close", &CoreError::NotOpen(id), Some(id)),
            };
            cb(reply);
        });
    }

    /// Reads up to `len` bytes at `offset`, delivering the bytes as a queued
    /// response. Zero-byte reads are not errors.
    pub fn read(&self, seq: Seq, id: Id, len: usize, offset: u64, cb: ReplyFn) {
        let Some(file) = self.file_handle(id) else {
            cb(Reply::from_error(seq, "fs.read", &CoreError::NotOpen(id), Some(id)));
            return;
        };

        let store = Arc::clone(&self.store);
        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let result = run_blocking(move || {
                    let mut buf = vec![0u8; len];
                    let n = file.read_at(&mut buf, offset)?;
                    buf.truncate(n);
                    Ok(buf)
                })
                .await;

                let reply = match result {
                    Ok(buf) => {
                        let headers = Headers::new()
                            .set("Content-Type", "application/octet-stream")
                            .set("Content-Length", buf.len())
                            .set("X-Method", "fsRead")
                            .set("X-Id", id);
                        let mut queued = QueuedResponse::new(Bytes::from(buf), headers);
                        queued.id = rand64();
                        store.put(queued.clone());
                        Reply::data(seq, "fs.read", json!({})).with_queued(queued)
                    }
                    Err(error) => Reply::from_error(seq, "fs.read", &error, Some(id)),
                };
                cb(reply);
            });
        });
    }

    /// Writes `data` at `offset`, replying with the byte count written.
    ///
    /// The buffer is held in the shared-buffer ledger until the write
    /// completes, so the caller may drop its handle immediately.
    pub fn write(&self, seq: Seq, id: Id, data: Bytes, offset: u64, cb: ReplyFn) {
        let Some(file) = self.file_handle(id) else {
            cb(Reply::from_error(seq, "fs.write", &CoreError::NotOpen(id), Some(id)));
            return;
        };

        self.ledger.retain(data.clone(), self.buffer_ttl);
        let ledger = Arc::clone(&self.ledger);

        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let buffer = data.clone();
                let result = run_blocking(move || file.write_all_at(&data, offset).map(|_| data.len())).await;
                ledger.release(&buffer);

                let reply = match result {
                    Ok(n) => Reply::data(
                        seq,
                        "fs.write",
                        json!({ "id": id.to_string(), "result": n.to_string() }),
                    ),
                    Err(error) => Reply::from_error(seq, "fs.write", &error, Some(id)),
                };
                cb(reply);
            });
        });
    }

    /// Stats `path`, replying with the full projection.
    pub fn stat(&self, seq: Seq, path: String, cb: ReplyFn) {
        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let reply = match run_blocking(move || std::fs::metadata(&path)).await {
                    Ok(metadata) => Reply::data(seq, "fs.stat", stat_json(&metadata)),
                    Err(error) => Reply::from_error(seq, "fs.stat", &error, None),
                };
                cb(reply);
            });
        });
    }

    pub fn unlink(&self, seq: Seq, path: String, cb: ReplyFn) {
        self.simple_op(seq, "fs.unlink", cb, move || {
            std::fs::remove_file(&path)
        });
    }

    pub fn rename(&self, seq: Seq, from: String, to: String, cb: ReplyFn) {
        self.simple_op(seq, "fs.rename", cb, move || std::fs::rename(&from, &to));
    }

    /// Copies `from` to `to`. With [`COPYFILE_EXCL`] the copy fails when the
    /// destination already exists.
    pub fn copy_file(&self, seq: Seq, from: String, to: String, flags: i32, cb: ReplyFn) {
        self.simple_op(seq, "fs.copyFile", cb, move || {
            if flags & COPYFILE_EXCL != 0 && Path::new(&to).exists() {
                return Err(std::io::Error::from_raw_os_error(libc::EEXIST));
            }
            std::fs::copy(&from, &to).map(|_| ())
        });
    }

    pub fn rmdir(&self, seq: Seq, path: String, cb: ReplyFn) {
        self.simple_op(seq, "fs.rmdir", cb, move || std::fs::remove_dir(&path));
    }

    pub fn mkdir(&self, seq: Seq, path: String, mode: u32, cb: ReplyFn) {
        self.simple_op(seq, "fs.mkdir", cb, move || {
            DirBuilder::new().mode(mode).create(&path)
        });
    }

    /// Enumerates `path` in the platform's native order, replying with
    /// `{entries: [name, …]}`. The directory handle lives in the table only
    /// for the duration of the call.
    pub fn readdir(&self, seq: Seq, path: String, cb: ReplyFn) {
        let descriptors = Arc::clone(&self.descriptors);
        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let id = rand64();
                descriptors.insert(id, Descriptor::Directory(path.clone().into()));

                let result = run_blocking(move || {
                    let mut entries = Vec::new();
                    for entry in std::fs::read_dir(&path)? {
                        entries.push(entry?.file_name().to_string_lossy().into_owned());
                    }
                    Ok(entries)
                })
                .await;

                descriptors.remove(id);

                let reply = match result {
                    Ok(entries) => Reply::data(seq, "fs.readdir", json!({ "entries": entries })),
                    Err(error) => Reply::from_error(seq, "fs.readdir", &error, None),
                };
                cb(reply);
            });
        });
    }

    /// Closes descriptors that are unretained and idle beyond `threshold`.
    ///
    /// Runs on the reactor thread as the descriptor cleanup ledger's tick.
    pub fn reclaim_stale(&self, threshold: Duration) -> usize {
        let stale = self.descriptors.stale_ids(threshold);
        let count = stale.len();
        for id in stale {
            if self.descriptors.remove(id).is_some() {
                debug!(id, "reclaimed stale descriptor");
            }
        }
        count
    }

    fn file_handle(&self, id: Id) -> Option<Arc<File>> {
        self.descriptors
            .with(id, |descriptor| match descriptor {
                Descriptor::File(file) => Some(Arc::clone(file)),
                Descriptor::Directory(_) => None,
            })
            .flatten()
    }

    fn simple_op(
        &self,
        seq: Seq,
        source: &'static str,
        cb: ReplyFn,
        op: impl FnOnce() -> std::io::Result<()> + Send + 'static,
    ) {
        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let reply = match run_blocking(move || op().map(|_| 0i32)).await {
                    Ok(result) => {
                        Reply::data(seq, source, json!({ "result": result.to_string() }))
                    }
                    Err(error) => Reply::from_error(seq, source, &error, None),
                };
                cb(reply);
            });
        });
    }
}

/// Runs a blocking filesystem call off the reactor thread.
async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> std::io::Result<T> + Send + 'static,
) -> Result<T, CoreError> {
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(CoreError::platform(&error)),
        Err(join_error) => Err(CoreError::Internal(join_error.to_string())),
    }
}

/// Maps the conventional `O_*` flag integer onto `OpenOptions`.
fn open_options(flags: i32, mode: u32) -> OpenOptions {
    let mut options = OpenOptions::new();
    let access = flags & libc::O_ACCMODE;
    options.read(access == libc::O_RDONLY || access == libc::O_RDWR);
    options.write(access == libc::O_WRONLY || access == libc::O_RDWR);
    options.append(flags & libc::O_APPEND != 0);
    options.create(flags & libc::O_CREAT != 0);
    options.truncate(flags & libc::O_TRUNC != 0);
    options.mode(mode);

    // Remaining bits (O_EXCL, O_NONBLOCK, O_SYNC, …) pass through untouched.
    let handled = libc::O_ACCMODE | libc::O_APPEND | libc::O_CREAT | libc::O_TRUNC;
    options.custom_flags(flags & !handled);
    options
}

/// Projects metadata into the stat JSON shape.
fn stat_json(metadata: &std::fs::Metadata) -> serde_json::Value {
    let file_type = metadata.file_type();
    let kind = if file_type.is_dir() {
        "directory"
    } else if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_file() {
        "file"
    } else {
        "special"
    };

    json!({
        "size": metadata.size(),
        "mode": metadata.mode(),
        "kind": kind,
        "mtime": metadata.mtime() * 1000 + metadata.mtime_nsec() / 1_000_000,
        "ctime": metadata.ctime() * 1000 + metadata.ctime_nsec() / 1_000_000,
        "atime": metadata.atime() * 1000 + metadata.atime_nsec() / 1_000_000,
        "nlink": metadata.nlink(),
        "uid": metadata.uid(),
        "gid": metadata.gid(),
        "ino": metadata.ino(),
        "dev": metadata.dev(),
        "rdev": metadata.rdev(),
        "blocks": metadata.blocks(),
        "blksize": metadata.blksize(),
    })
}
