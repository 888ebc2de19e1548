use std::{
    fs::File,
    io::{BufRead, BufReader},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
};

use rustc_hash::FxHashSet;

use crate::{
    detector::{scan_page, LabelEvent, MarkerMatcher},
    dump_parser::{DumpParser, PageSource, ParsingError},
};

// bounds memory while the sink is slower than the workers
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What to do when a dump file cannot be opened or decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFailure {
    /// Log a diagnostic and continue with the remaining dumps.
    #[default]
    Skip,
    /// Stop the whole run; sibling workers wind down at the next page boundary.
    Abort,
}

/// Read-only configuration shared by all workers.
pub struct ScanOptions {
    pub matcher: MarkerMatcher,
    /// Pages whose namespace is not in this set are skipped wholesale.
    /// `None` scans all namespaces.
    pub namespaces: Option<FxHashSet<i32>>,
    pub workers: NonZeroUsize,
    pub on_archive_failure: ArchiveFailure,
}

impl ScanOptions {
    pub fn new(matcher: MarkerMatcher) -> Self {
        Self {
            matcher,
            namespaces: None,
            workers: default_worker_count(),
            on_archive_failure: ArchiveFailure::default(),
        }
    }
}

/// Host parallelism, or one worker if it cannot be determined.
pub fn default_worker_count() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to open dump {path}")]
    OpenArchive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode dump {path}")]
    DecodeArchive {
        path: PathBuf,
        #[source]
        source: ParsingError,
    },
    #[error("failed to write label record")]
    WriteRecord(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Pages that were scanned (pages filtered out by namespace not included).
    pub pages: u64,
    /// Label events handed to the sink.
    pub events: u64,
}

#[derive(Debug, Default)]
struct ArchiveStats {
    pages: u64,
    events: u64,
}

/// Scans all dumps with a fixed-size worker pool and feeds the merged event
/// stream to `emit`, in whatever order the workers produce it.
///
/// Each worker owns its claimed dump end-to-end (open, decompress, parse,
/// filter, scan); the only things crossing thread boundaries are the
/// read-only options and the emitted events. Within one page `Appeared`
/// always precedes `Removed`, across pages no order is guaranteed.
///
/// An error returned by `emit` stops the run; whether an unreadable dump does
/// is governed by [`ScanOptions::on_archive_failure`].
pub fn run<F>(archives: &[PathBuf], options: &ScanOptions, mut emit: F) -> Result<ScanStats, ScanError>
where
    F: FnMut(LabelEvent) -> std::io::Result<()>,
{
    let next_archive = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let (tx, rx) = mpsc::sync_channel(EVENT_CHANNEL_CAPACITY);

    // more workers than dumps would only idle
    let worker_count = options.workers.get().min(archives.len());

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let tx = tx.clone();
            let next_archive = &next_archive;
            let stop = &stop;
            handles.push(
                scope.spawn(move || worker_loop(archives, options, next_archive, stop, tx)),
            );
        }
        drop(tx);

        let mut stats = ScanStats::default();
        let mut first_error = None;
        for event in &rx {
            if let Err(error) = emit(event) {
                // the sink is broken, stop the producers
                stop.store(true, Ordering::Relaxed);
                first_error = Some(ScanError::WriteRecord(error));
                break;
            }
            stats.events += 1;
        }
        // drain whatever is still in flight so no worker blocks on send
        for _ in &rx {}

        for handle in handles {
            match handle.join() {
                Ok(Ok(worker_pages)) => stats.pages += worker_pages,
                Ok(Err(error)) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(stats),
        }
    })
}

fn worker_loop(
    archives: &[PathBuf],
    options: &ScanOptions,
    next_archive: &AtomicUsize,
    stop: &AtomicBool,
    events: mpsc::SyncSender<LabelEvent>,
) -> Result<u64, ScanError> {
    let mut pages = 0;

    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(pages);
        }

        let index = next_archive.fetch_add(1, Ordering::Relaxed);
        let Some(path) = archives.get(index) else {
            return Ok(pages);
        };

        match scan_archive(path, options, stop, &events) {
            Ok(stats) => {
                pages += stats.pages;
                tracing::debug!(
                    path = %path.display(),
                    pages = stats.pages,
                    events = stats.events,
                    "finished dump"
                );
            }
            Err(error) => match options.on_archive_failure {
                ArchiveFailure::Skip => {
                    tracing::warn!(
                        message = "Skipping unreadable dump",
                        path = %path.display(),
                        error = ?error
                    );
                }
                ArchiveFailure::Abort => {
                    stop.store(true, Ordering::Relaxed);
                    return Err(error);
                }
            },
        }
    }
}

fn open_archive(path: &Path) -> Result<Box<dyn BufRead>, ScanError> {
    let file = File::open(path).map_err(|source| ScanError::OpenArchive {
        path: path.to_owned(),
        source,
    })?;
    let reader = BufReader::new(file);

    // dumps come either plain or zstd-compressed
    if path.extension().is_some_and(|ext| ext == "zst") {
        let decoder =
            zstd::stream::Decoder::with_buffer(reader).map_err(|source| ScanError::OpenArchive {
                path: path.to_owned(),
                source,
            })?;
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        Ok(Box::new(reader))
    }
}

fn scan_archive(
    path: &Path,
    options: &ScanOptions,
    stop: &AtomicBool,
    events: &mpsc::SyncSender<LabelEvent>,
) -> Result<ArchiveStats, ScanError> {
    let reader = open_archive(path)?;
    let mut parser = DumpParser::new(reader).map_err(|source| ScanError::DecodeArchive {
        path: path.to_owned(),
        source,
    })?;

    let site_info = parser.site_info();
    tracing::debug!(
        path = %path.display(),
        dbname = site_info.dbname.as_str(),
        "opened dump"
    );
    if let Some(namespaces) = &options.namespaces {
        for namespace in namespaces {
            if !site_info.namespaces.contains_key(namespace) {
                tracing::warn!(
                    message = "Configured namespace does not exist in this dump",
                    namespace,
                    path = %path.display()
                );
            }
        }
    }

    scan_source(&mut parser, options, stop, events).map_err(|source| ScanError::DecodeArchive {
        path: path.to_owned(),
        source,
    })
}

/// Scans every page of one source; the per-page detection state lives
/// entirely inside [`scan_page`], so pages are independent of each other.
fn scan_source<S: PageSource + ?Sized>(
    source: &mut S,
    options: &ScanOptions,
    stop: &AtomicBool,
    events: &mpsc::SyncSender<LabelEvent>,
) -> Result<ArchiveStats, ParsingError> {
    let mut stats = ArchiveStats::default();

    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(stats);
        }

        let Some(page) = source.next_page()? else {
            return Ok(stats);
        };

        if let Some(namespaces) = &options.namespaces {
            if !namespaces.contains(&page.namespace) {
                continue;
            }
        }

        stats.pages += 1;
        for event in scan_page(&options.matcher, &page) {
            stats.events += 1;
            if events.send(event).is_err() {
                // receiver is gone, the run is over
                return Ok(stats);
            }
        }
    }
}
