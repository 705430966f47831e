//! File reading: one dump file, read sequentially, each record dispatched
//! under a permit from the dispatch pool.

use crate::ingestion::limiter::{Permit, PermitPool};
use crate::ingestion::record::{extract_records, DatasetRecord};
use crate::ingestion::{IngestionError, WriteIntent};
use log::{debug, error, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Counters shared by every reader of one run
#[derive(Debug, Default)]
pub struct ReadStats {
    pub files_read: AtomicU64,
    pub files_failed: AtomicU64,
    pub lines_read: AtomicU64,
    pub decode_errors: AtomicU64,
    pub records_rejected: AtomicU64,
    pub records_dispatched: AtomicU64,
    pub records_skipped: AtomicU64,
}

impl ReadStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// What a reader needs from the pipeline
pub struct ReaderContext {
    pub dispatch: PermitPool,
    pub intents: mpsc::Sender<WriteIntent>,
    pub max_line_bytes: usize,
    pub stats: ReadStats,
}

/// What [`read_line_bounded`] found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRead {
    Eof,
    Line,
    /// The line exceeded the limit; its `len` bytes were skipped unstored
    TooLong { len: usize },
}

/// Read one `\n`-terminated line into `line`, without the terminator.
///
/// At most `max` bytes are ever kept. Past that the rest of the line is
/// consumed from the reader and dropped.
async fn read_line_bounded<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut len = 0usize;
    let mut seen = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        seen = true;
        let (chunk, used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..i], i + 1, true),
            None => (available, available.len(), false),
        };
        len += chunk.len();
        if len <= max {
            line.extend_from_slice(chunk);
        } else {
            line.clear();
        }
        reader.consume(used);
        if done {
            break;
        }
    }

    Ok(match (seen, len > max) {
        (false, _) => LineRead::Eof,
        (true, true) => LineRead::TooLong { len },
        (true, false) => LineRead::Line,
    })
}

/// Turn one record into an intent and queue it, holding `permit` until the
/// intent has been handed over
async fn dispatch_record(
    record: DatasetRecord,
    intents: mpsc::Sender<WriteIntent>,
    permit: Permit,
) -> Result<(), IngestionError> {
    let intent = WriteIntent::from_record(record);
    let sent = intents
        .send(intent)
        .await
        .map_err(|_| IngestionError::QueueClosed);
    drop(permit);
    sent
}

fn log_task_result(path: &Path, joined: Result<Result<(), IngestionError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{}: {}", path.display(), e),
        Err(e) => error!("{}: record task failed: {}", path.display(), e),
    }
}

/// Decode one line and dispatch its records. Returns `Err` only when no
/// further record of this file can be dispatched.
async fn process_line(
    ctx: &ReaderContext,
    path: &Path,
    line: &[u8],
    tasks: &mut JoinSet<Result<(), IngestionError>>,
) -> Result<(), IngestionError> {
    let outcome = match extract_records(line) {
        Ok(outcome) => outcome,
        Err(e) => {
            ReadStats::bump(&ctx.stats.decode_errors);
            warn!("{}: {}", path.display(), e);
            return Ok(());
        }
    };

    for rejected in &outcome.rejected {
        ReadStats::bump(&ctx.stats.records_rejected);
        warn!("{}: {}", path.display(), rejected);
    }

    for record in outcome.records {
        let permit = match ctx.dispatch.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                ReadStats::bump(&ctx.stats.records_skipped);
                return Err(e);
            }
        };
        ReadStats::bump(&ctx.stats.records_dispatched);
        tasks.spawn(dispatch_record(record, ctx.intents.clone(), permit));

        while let Some(joined) = tasks.try_join_next() {
            log_task_result(path, joined);
        }
    }
    Ok(())
}

/// Read `path` to the end, holding `file_permit` until the file is closed
/// and every record task it spawned has finished.
///
/// Open and read errors abandon the file; they never affect other files.
pub async fn read_file(
    ctx: &ReaderContext,
    path: PathBuf,
    file_permit: Permit,
) -> Result<(), IngestionError> {
    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            ReadStats::bump(&ctx.stats.files_failed);
            drop(file_permit);
            return Err(IngestionError::file(path, e));
        }
    };
    debug!("Reading {}", path.display());

    let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, file);
    let mut tasks = JoinSet::new();
    let mut line = Vec::new();
    let mut result = Ok(());

    loop {
        match read_line_bounded(&mut reader, &mut line, ctx.max_line_bytes).await {
            Ok(LineRead::Eof) => break,
            Ok(LineRead::TooLong { len }) => {
                ReadStats::bump(&ctx.stats.lines_read);
                ReadStats::bump(&ctx.stats.decode_errors);
                warn!(
                    "{}: {}",
                    path.display(),
                    IngestionError::LineTooLong {
                        len,
                        max: ctx.max_line_bytes
                    }
                );
            }
            Ok(LineRead::Line) => {
                ReadStats::bump(&ctx.stats.lines_read);
                if let Err(e) = process_line(ctx, &path, &line, &mut tasks).await {
                    result = Err(e);
                    break;
                }
            }
            Err(e) => {
                result = Err(IngestionError::file(&path, e));
                break;
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        log_task_result(&path, joined);
    }
    drop(reader);

    match &result {
        Ok(()) => ReadStats::bump(&ctx.stats.files_read),
        Err(_) => ReadStats::bump(&ctx.stats.files_failed),
    }
    drop(file_permit);
    result
}

/// Regular, non-hidden files of `dir`, sorted by name
pub async fn list_data_files(dir: &Path) -> Result<Vec<PathBuf>, IngestionError> {
    let data_dir_error = |source| IngestionError::DataDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(data_dir_error)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(data_dir_error)? {
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if is_file && !hidden {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
