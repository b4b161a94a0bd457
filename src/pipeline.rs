//! Producer/consumer run over a dump tree.
//!
//! A blocking task walks the files, parses records and assembles them in
//! rayon batches. Articles cross a bounded channel to the writers, so the
//! number of articles in flight never exceeds one batch plus the channel
//! capacity.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::article::{assemble, Article, ArticleFilter, Assembly};
use crate::db::RelationalWriter;
use crate::error::{ErrorCounts, OutputKind, PipelineError, StoreError};
use crate::parser::{ParseEvent, RawRecord, RecordStream, SkipReason};
use crate::settings::Settings;
use crate::source::{self, DumpFiles};
use crate::store::{CategoryIndexWriter, DocumentWriter};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FATAL: u8 = 1;
pub const EXIT_PARTIAL: u8 = 2;
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub files_opened: usize,
    pub files_completed: usize,
    pub files_failed: usize,
    pub records: usize,
    pub accepted: usize,
    pub skipped_namespace: usize,
    pub skipped_redirect: usize,
    pub filtered: usize,
    pub errors: ErrorCounts,
    pub documents_written: Option<usize>,
    pub articles_stored: Option<usize>,
    pub categories_indexed: Option<usize>,
    pub failed_outputs: Vec<(OutputKind, String)>,
    pub cap_reached: bool,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn exit_code(&self) -> u8 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.files_failed > 0
            || self.errors.file_access > 0
            || self.errors.unsupported_format > 0
            || !self.failed_outputs.is_empty()
        {
            EXIT_PARTIAL
        } else {
            EXIT_OK
        }
    }

    fn absorb(&mut self, p: ProducerStats) {
        self.files_opened = p.files_opened;
        self.files_completed = p.files_completed;
        self.files_failed = p.files_failed;
        self.records = p.records;
        self.accepted = p.accepted;
        self.skipped_namespace = p.skipped_namespace;
        self.skipped_redirect = p.skipped_redirect;
        self.filtered = p.filtered;
        self.errors.merge(&p.errors);
        self.cap_reached = p.cap_reached;
        self.interrupted = p.interrupted;
    }

    pub fn log(&self) {
        info!(
            files = self.files_opened,
            failed_files = self.files_failed,
            records = self.records,
            accepted = self.accepted,
            skipped_namespace = self.skipped_namespace,
            skipped_redirect = self.skipped_redirect,
            filtered = self.filtered,
            errors = self.errors.total(),
            elapsed_s = self.elapsed.as_secs_f64(),
            "Run finished"
        );
        for (output, reason) in &self.failed_outputs {
            warn!("{output} was not written: {reason}");
        }
        if self.cap_reached {
            info!("Stopped at the article cap");
        }
        if self.interrupted {
            warn!("Run interrupted; outputs hold everything accepted before the stop");
        }
    }
}

/// Everything the parsing side reports back once it stops.
#[derive(Debug, Default)]
struct ProducerStats {
    files_opened: usize,
    files_completed: usize,
    files_failed: usize,
    records: usize,
    accepted: usize,
    skipped_namespace: usize,
    skipped_redirect: usize,
    filtered: usize,
    errors: ErrorCounts,
    cap_reached: bool,
    interrupted: bool,
}

impl ProducerStats {
    fn record_error(&mut self, err: &PipelineError) {
        warn!("{err}");
        self.errors.record(err.kind());
    }
}

/// Process every dump under `root` into the outputs named by `settings`.
///
/// Returns `NoInput` when `root` holds no dump file at all; every other
/// failure is counted in the summary and the run continues.
pub async fn run(
    root: &Path,
    settings: &Settings,
    cancel: Arc<AtomicBool>,
) -> Result<RunSummary, PipelineError> {
    let t0 = Instant::now();
    let root_owned = root.to_path_buf();
    let (first, rest, early) =
        tokio::task::spawn_blocking(move || first_dump(source::locate(&root_owned)))
            .await
            .map_err(|e| PipelineError::file_access(root, std::io::Error::other(e)))?;
    let Some(first) = first else {
        return Err(PipelineError::NoInput {
            root: root.to_path_buf(),
        });
    };

    let mut outputs = Outputs::open(settings);
    let filter = ArticleFilter::new(&settings.categories);
    let (tx, mut rx) = mpsc::channel::<Article>(settings.channel_capacity);

    let progress = spinner();
    let producer = {
        let files: DumpFiles = Box::new(std::iter::once(Ok(first)).chain(rest));
        let settings = settings.clone();
        let progress = progress.clone();
        tokio::task::spawn_blocking(move || {
            let mut producer = Producer {
                settings: &settings,
                filter: &filter,
                cancel: &cancel,
                tx,
                progress,
                stats: ProducerStats::default(),
            };
            producer.stats.errors = early;
            producer.run(files);
            producer.stats
        })
    };

    while let Some(article) = rx.recv().await {
        outputs.write(&article);
    }

    let stats = match producer.await {
        Ok(stats) => stats,
        Err(e) => {
            warn!("Parser task ended abnormally: {e}");
            ProducerStats {
                files_failed: 1,
                ..ProducerStats::default()
            }
        }
    };
    progress.finish_and_clear();

    let mut summary = RunSummary::default();
    summary.absorb(stats);
    outputs.finish(&mut summary);
    summary.elapsed = t0.elapsed();
    summary.log();
    Ok(summary)
}

/// Find the first dump file, counting locator errors met on the way.
fn first_dump(mut files: DumpFiles) -> (Option<PathBuf>, DumpFiles, ErrorCounts) {
    let mut errors = ErrorCounts::default();
    while let Some(entry) = files.next() {
        match entry {
            Ok(path) => return (Some(path), files, errors),
            Err(e) => {
                warn!("{e}");
                errors.record(e.kind());
            }
        }
    }
    (None, files, errors)
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {pos} articles ({per_sec}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

// ── Producer ──

struct Producer<'a> {
    settings: &'a Settings,
    filter: &'a ArticleFilter,
    cancel: &'a AtomicBool,
    tx: mpsc::Sender<Article>,
    progress: ProgressBar,
    stats: ProducerStats,
}

enum Flow {
    Continue,
    Stop,
}

impl Producer<'_> {
    fn run(&mut self, files: DumpFiles) {
        for entry in files {
            if self.should_stop() {
                break;
            }
            match entry {
                Ok(path) => {
                    if let Flow::Stop = self.process_file(&path) {
                        break;
                    }
                }
                Err(e) => self.stats.record_error(&e),
            }
        }
    }

    fn should_stop(&mut self) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            self.stats.interrupted = true;
        }
        if let Some(cap) = self.settings.max_articles {
            if self.stats.accepted >= cap {
                self.stats.cap_reached = true;
            }
        }
        self.stats.interrupted || self.stats.cap_reached
    }

    fn process_file(&mut self, path: &Path) -> Flow {
        let reader = match source::open_decompressed(path) {
            Ok(r) => r,
            Err(e) => {
                self.stats.record_error(&e);
                self.stats.files_failed += 1;
                return Flow::Continue;
            }
        };
        self.stats.files_opened += 1;
        info!("Reading {}", path.display());
        self.progress.set_message(path.display().to_string());

        let mut batch: Vec<RawRecord> = Vec::with_capacity(self.settings.batch_size);
        let mut failed = false;
        let mut flow = Flow::Continue;

        let mut stream = RecordStream::new(reader, path);
        for event in stream.by_ref() {
            if self.should_stop() {
                flow = Flow::Stop;
                break;
            }
            match event {
                Ok(ParseEvent::Record(raw)) => {
                    self.stats.records += 1;
                    batch.push(raw);
                    if batch.len() >= self.settings.batch_size {
                        if let Flow::Stop = self.flush(&mut batch) {
                            flow = Flow::Stop;
                            break;
                        }
                    }
                }
                Ok(ParseEvent::Skipped { title, reason }) => {
                    self.stats.records += 1;
                    match reason {
                        SkipReason::Namespace => self.stats.skipped_namespace += 1,
                        SkipReason::Redirect => self.stats.skipped_redirect += 1,
                    }
                    debug!(?reason, "Skipped {title}");
                }
                Ok(ParseEvent::Malformed(m)) => {
                    self.stats.records += 1;
                    self.stats
                        .record_error(&PipelineError::MalformedRecord(m));
                }
                Err(e) => {
                    self.stats.record_error(&e);
                    failed = true;
                    break;
                }
            }
        }

        if let Flow::Stop = self.flush(&mut batch) {
            flow = Flow::Stop;
        }
        debug!(
            namespace = stream.namespace().unwrap_or("-"),
            buffered = stream.buffered_bytes(),
            "Done with {}",
            path.display()
        );
        if failed {
            self.stats.files_failed += 1;
        } else if matches!(flow, Flow::Continue) {
            self.stats.files_completed += 1;
        }
        flow
    }

    /// Assemble the batch in parallel and forward accepted articles in order.
    fn flush(&mut self, batch: &mut Vec<RawRecord>) -> Flow {
        if batch.is_empty() {
            return Flow::Continue;
        }
        let filter = self.filter;
        let assembled: Vec<Assembly> = std::mem::take(batch)
            .into_par_iter()
            .map(|raw| assemble(raw, filter))
            .collect();

        for item in assembled {
            match item {
                Assembly::Filtered { title } => {
                    self.stats.filtered += 1;
                    debug!("Filtered {title}");
                }
                Assembly::Accepted(article) => {
                    if self.should_stop() {
                        return Flow::Stop;
                    }
                    if self.tx.blocking_send(article).is_err() {
                        warn!("Writers stopped receiving; ending parse");
                        return Flow::Stop;
                    }
                    self.stats.accepted += 1;
                    self.progress.inc(1);
                    if self.stats.accepted % self.settings.progress_every == 0 {
                        info!("Accepted {} articles", self.stats.accepted);
                    }
                }
            }
        }
        batch.reserve(self.settings.batch_size);
        Flow::Continue
    }
}

// ── Consumer ──

/// The three writers. A writer that fails is dropped and the rest go on.
struct Outputs {
    documents: Option<DocumentWriter>,
    relational: Option<RelationalWriter>,
    index: Option<CategoryIndexWriter>,
    failed: Vec<(OutputKind, String)>,
}

impl Outputs {
    fn open(settings: &Settings) -> Self {
        let mut failed = Vec::new();

        let documents = settings
            .format
            .documents()
            .then(|| DocumentWriter::create(settings.documents_path()))
            .and_then(|r| keep(r, OutputKind::Documents, &mut failed));
        let relational = settings
            .format
            .relational()
            .then(|| RelationalWriter::open(&settings.database_path(), settings.commit_every))
            .and_then(|r| keep(r, OutputKind::Relational, &mut failed));
        let index = Some(CategoryIndexWriter::new(settings.category_index_path()));

        Self {
            documents,
            relational,
            index,
            failed,
        }
    }

    fn write(&mut self, article: &Article) {
        if let Some(w) = &mut self.documents {
            if let Err(e) = w.write(article) {
                fail(OutputKind::Documents, e, &mut self.failed);
                self.documents = None;
            }
        }
        if let Some(w) = &mut self.relational {
            if let Err(e) = w.write(article) {
                fail(OutputKind::Relational, e, &mut self.failed);
                self.relational = None;
            }
        }
        if let Some(w) = &mut self.index {
            w.add(article);
        }
    }

    fn finish(mut self, summary: &mut RunSummary) {
        if let Some(w) = self.documents.take() {
            summary.documents_written = keep(w.finish(), OutputKind::Documents, &mut self.failed);
        }
        if let Some(w) = self.relational.take() {
            summary.articles_stored = keep(w.finish(), OutputKind::Relational, &mut self.failed);
        }
        if let Some(w) = self.index.take() {
            summary.categories_indexed =
                keep(w.finish(), OutputKind::CategoryIndex, &mut self.failed);
        }
        summary.errors.persistence += self.failed.len();
        summary.failed_outputs = self.failed;
    }
}

fn fail(output: OutputKind, source: StoreError, failed: &mut Vec<(OutputKind, String)>) {
    let err = PipelineError::persistence(output, source);
    warn!("{err}; continuing without it");
    failed.push((output, err.to_string()));
}

fn keep<T>(
    result: Result<T, StoreError>,
    output: OutputKind,
    failed: &mut Vec<(OutputKind, String)>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            fail(output, e, failed);
            None
        }
    }
}
