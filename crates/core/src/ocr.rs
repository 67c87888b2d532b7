//! Batched OCR over image pages from many files.
//!
//! [`OcrScheduler::enqueue`] only records work. [`OcrScheduler::run`] writes
//! every queued page to a base64 JSON-lines batch file, asks the
//! [`ResourceGovernor`] how many workers to start, and lets each worker take
//! every `n`-th slot of the batch. Workers poll the governor and the cancel
//! flag between pages.

use crate::cancel::CancelFlag;
use crate::config::OcrConfig;
use crate::error::IngestError;
use crate::governor::{ResourceGovernor, WorkKind, WorkerPlan};
use crate::traits::OcrEngine;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, GrayImage, ImageFormat};
use imageproc::distance_transform::Norm;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const GAUSSIAN_SIGMA: f32 = 0.8;
const THRESHOLD_BLOCK_RADIUS: u32 = 15;
const CLOSE_RADIUS: u8 = 1;

/// Grayscale, light Gaussian denoise, adaptive threshold, then a 3x3 close.
pub fn preprocess(image: &DynamicImage) -> GrayImage {
    let gray = image.to_luma8();
    let denoised = imageproc::filter::gaussian_blur_f32(&gray, GAUSSIAN_SIGMA);
    let binary = imageproc::contrast::adaptive_threshold(&denoised, THRESHOLD_BLOCK_RADIUS);
    imageproc::morphology::close(&binary, Norm::LInf, CLOSE_RADIUS)
}

/// Runs the `tesseract` binary once per page and reads its stdout.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    binary: PathBuf,
}

impl TesseractEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new("tesseract")
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, png_path: &Path, languages: &str, psm: u8) -> Result<String, IngestError> {
        let output = tokio::process::Command::new(&self.binary)
            .arg(png_path)
            .arg("stdout")
            .arg("-l")
            .arg(languages)
            .arg("--psm")
            .arg(psm.to_string())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(IngestError::OcrWorkerCrash(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Clone)]
pub struct OcrTask {
    pub task_id: String,
    pub page_index: u32,
    pub image: DynamicImage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrFailure {
    pub task_id: String,
    pub page_index: u32,
    pub details: String,
}

#[derive(Debug, Default)]
pub struct OcrRun {
    /// task_id → page_index → recognized text.
    pub pages: BTreeMap<String, BTreeMap<u32, String>>,
    pub failures: Vec<OcrFailure>,
    pub emergency_stopped: bool,
    pub cancelled: bool,
    pub plan: Option<WorkerPlan>,
}

impl OcrRun {
    pub fn text(&self, task_id: &str, page_index: u32) -> Option<&str> {
        self.pages
            .get(task_id)
            .and_then(|pages| pages.get(&page_index))
            .map(String::as_str)
    }

    fn insert(&mut self, task_id: &str, page_index: u32, text: String) {
        self.pages
            .entry(task_id.to_string())
            .or_default()
            .insert(page_index, text);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchLine {
    slot: usize,
    task_id: String,
    page_index: u32,
    png_base64: String,
}

#[derive(Debug, Clone)]
struct SlotMeta {
    task_id: String,
    page_index: u32,
}

#[derive(Debug, Default)]
struct WorkerOutput {
    recognized: Vec<(usize, String)>,
    failed: Vec<(usize, String)>,
}

pub struct OcrScheduler {
    engine: Arc<dyn OcrEngine>,
    config: Arc<OcrConfig>,
    queue: Vec<OcrTask>,
}

impl OcrScheduler {
    pub fn new(engine: Arc<dyn OcrEngine>, config: OcrConfig) -> Self {
        Self {
            engine,
            config: Arc::new(config),
            queue: Vec::new(),
        }
    }

    /// Queues one page; no work happens until [`OcrScheduler::run`].
    pub fn enqueue(&mut self, task_id: impl Into<String>, image: DynamicImage, page_index: u32) {
        self.queue.push(OcrTask {
            task_id: task_id.into(),
            page_index,
            image,
        });
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Processes the whole queue in one bounded-parallel pass. The queue is
    /// empty afterwards, whatever the outcome.
    pub async fn run(
        &mut self,
        governor: Arc<ResourceGovernor>,
        cancel: &CancelFlag,
    ) -> Result<OcrRun, IngestError> {
        let tasks = std::mem::take(&mut self.queue);
        let mut run = OcrRun::default();
        if tasks.is_empty() {
            return Ok(run);
        }

        let scratch = tempfile::Builder::new().prefix("kbvault-ocr-").tempdir()?;
        let batch_path = scratch.path().join("batch.jsonl");
        let slots = {
            let batch_path = batch_path.clone();
            tokio::task::spawn_blocking(move || write_batch(&batch_path, tasks))
                .await
                .map_err(|error| IngestError::OcrWorkerCrash(error.to_string()))??
        };

        let plan = {
            let governor = Arc::clone(&governor);
            let task_count = slots.len();
            tokio::task::spawn_blocking(move || governor.recommend_workers(task_count, WorkKind::Ocr))
                .await
                .map_err(|error| IngestError::OcrWorkerCrash(error.to_string()))?
        };
        let workers = plan.workers.clamp(1, slots.len());
        info!(
            pages = slots.len(),
            workers,
            strategy = %plan.strategy,
            engine = self.engine.name(),
            "starting OCR batch"
        );
        governor.monitor(workers);

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let context = WorkerContext {
                worker,
                workers,
                batch_path: batch_path.clone(),
                scratch: scratch.path().to_path_buf(),
                engine: Arc::clone(&self.engine),
                config: Arc::clone(&self.config),
                governor: Arc::clone(&governor),
                cancel: cancel.clone(),
            };
            handles.push((worker, tokio::spawn(run_worker(context))));
        }

        for (worker, handle) in handles {
            let crashed = match handle.await {
                Ok(Ok(output)) => {
                    for (slot, text) in output.recognized {
                        let meta = &slots[slot];
                        run.insert(&meta.task_id, meta.page_index, text);
                    }
                    for (slot, details) in output.failed {
                        let meta = &slots[slot];
                        run.insert(&meta.task_id, meta.page_index, String::new());
                        run.failures.push(OcrFailure {
                            task_id: meta.task_id.clone(),
                            page_index: meta.page_index,
                            details,
                        });
                    }
                    None
                }
                Ok(Err(error)) => Some(error.to_string()),
                Err(error) => Some(error.to_string()),
            };

            if let Some(details) = crashed {
                warn!(worker, %details, "OCR worker crashed; its pages are left empty");
                for slot in (worker..slots.len()).step_by(workers) {
                    let meta = &slots[slot];
                    run.insert(&meta.task_id, meta.page_index, String::new());
                    run.failures.push(OcrFailure {
                        task_id: meta.task_id.clone(),
                        page_index: meta.page_index,
                        details: IngestError::OcrWorkerCrash(details.clone()).to_string(),
                    });
                }
            }
        }

        governor.stop();
        run.emergency_stopped = governor.should_emergency_stop();
        run.cancelled = cancel.is_cancelled();
        run.plan = Some(plan);
        if run.emergency_stopped {
            warn!(recognized = run.pages.values().map(BTreeMap::len).sum::<usize>(), "OCR batch emergency-stopped");
        }
        Ok(run)
    }
}

fn write_batch(path: &Path, tasks: Vec<OcrTask>) -> Result<Vec<SlotMeta>, IngestError> {
    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    let mut slots = Vec::with_capacity(tasks.len());
    for (slot, task) in tasks.into_iter().enumerate() {
        let mut png = Vec::new();
        task.image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        let line = BatchLine {
            slot,
            task_id: task.task_id.clone(),
            page_index: task.page_index,
            png_base64: STANDARD.encode(&png),
        };
        serde_json::to_writer(&mut writer, &line)?;
        writer.write_all(b"\n")?;
        slots.push(SlotMeta {
            task_id: task.task_id,
            page_index: task.page_index,
        });
    }
    writer.flush()?;
    Ok(slots)
}

struct WorkerContext {
    worker: usize,
    workers: usize,
    batch_path: PathBuf,
    scratch: PathBuf,
    engine: Arc<dyn OcrEngine>,
    config: Arc<OcrConfig>,
    governor: Arc<ResourceGovernor>,
    cancel: CancelFlag,
}

async fn run_worker(context: WorkerContext) -> Result<WorkerOutput, IngestError> {
    let batch = tokio::fs::read_to_string(&context.batch_path).await?;
    let languages = context.config.language_arg();
    let mut output = WorkerOutput::default();

    for line in batch.lines().filter(|line| !line.trim().is_empty()) {
        let entry: BatchLine = serde_json::from_str(line)?;
        if entry.slot % context.workers != context.worker {
            continue;
        }
        if context.governor.should_emergency_stop() || context.cancel.is_cancelled() {
            debug!(worker = context.worker, "OCR worker stopping early");
            break;
        }
        context.governor.pause_if_throttled().await;

        let slot = entry.slot;
        match recognize_entry(&context, entry, &languages).await {
            Ok(text) => output.recognized.push((slot, text.trim().to_string())),
            Err(error) => {
                warn!(worker = context.worker, slot, %error, "OCR page failed");
                output.failed.push((slot, error.to_string()));
            }
        }
    }
    Ok(output)
}

async fn recognize_entry(
    context: &WorkerContext,
    entry: BatchLine,
    languages: &str,
) -> Result<String, IngestError> {
    let png_path = context.scratch.join(format!("slot-{}.png", entry.slot));
    let prepared_path = png_path.clone();
    tokio::task::spawn_blocking(move || -> Result<(), IngestError> {
        let bytes = STANDARD
            .decode(entry.png_base64.as_bytes())
            .map_err(|error| IngestError::InvalidArgument(format!("batch slot {}: {error}", entry.slot)))?;
        let image = image::load_from_memory_with_format(&bytes, ImageFormat::Png)?;
        preprocess(&image).save_with_format(&prepared_path, ImageFormat::Png)?;
        Ok(())
    })
    .await
    .map_err(|error| IngestError::OcrWorkerCrash(error.to_string()))??;

    let text = context
        .engine
        .recognize(&png_path, languages, context.config.page_segmentation_mode)
        .await;
    let _ = tokio::fs::remove_file(&png_path).await;
    text
}
