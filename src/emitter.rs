//! Hand-off of converted frames to persistence.
//!
//! [`FrameEmitter::emit`] only queues the frame; encoding and disk I/O happen
//! on a blocking writer task so the session can start assembling the next
//! frame immediately.

use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::types::{EmittedFrame, ReceiverEvent};

/// Frames queued for the writer before `emit` starts dropping them.
pub const DEFAULT_WRITER_QUEUE: usize = 8;

/// Destination for finished frames.  Called on a blocking thread.
pub trait FrameSink: Send + 'static {
    /// Persist `frame`; returns where it went.
    fn write_frame(&mut self, frame: EmittedFrame) -> Result<PathBuf>;
}

// ── PNG files ────────────────────────────────────────────────────────────────

/// Writes each frame to `<dir>/<prefix>-<session>-<sequence:05>.png`.
#[derive(Debug, Clone)]
pub struct PngFileSink {
    dir: PathBuf,
    prefix: String,
}

impl PngFileSink {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn path_for(&self, frame: &EmittedFrame) -> PathBuf {
        self.dir.join(format!(
            "{}-{}-{:05}.png",
            self.prefix, frame.session, frame.sequence
        ))
    }
}

impl FrameSink for PngFileSink {
    fn write_frame(&mut self, frame: EmittedFrame) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(&frame);
        let (width, height) = (frame.width, frame.height);
        let img = image::RgbImage::from_raw(width, height, frame.rgb)
            .ok_or_else(|| anyhow!("buffer does not hold a {width}x{height} RGB image"))?;

        let file = match File::create_new(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                bail!("refusing to overwrite {}", path.display())
            }
            Err(e) => {
                return Err(anyhow::Error::from(e).context(format!("creating {}", path.display())))
            }
        };
        let mut out = BufWriter::new(file);
        let written = img
            .write_to(&mut out, image::ImageFormat::Png)
            .map_err(anyhow::Error::from)
            .and_then(|()| out.flush().map_err(anyhow::Error::from));
        if let Err(e) = written {
            // Don't leave a truncated PNG behind under the frame's name.
            drop(out);
            let _ = std::fs::remove_file(&path);
            return Err(e).with_context(|| format!("encoding {}", path.display()));
        }
        Ok(path)
    }
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// Keeps frames in memory.  Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<EmittedFrame>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every frame written so far.
    pub fn frames(&self) -> Vec<EmittedFrame> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, frame: EmittedFrame) -> Result<PathBuf> {
        let location = PathBuf::from(format!("memory:{}/{}", frame.session, frame.sequence));
        self.frames
            .lock()
            .map_err(|_| anyhow!("memory sink poisoned"))?
            .push(frame);
        Ok(location)
    }
}

// ── Emitter ──────────────────────────────────────────────────────────────────

/// Numbers frames per session and queues them for the writer task.
pub struct FrameEmitter {
    tx: mpsc::Sender<EmittedFrame>,
    writer: JoinHandle<()>,
    session: String,
    next_sequence: u64,
}

impl FrameEmitter {
    /// Start the writer task with a queue of [`DEFAULT_WRITER_QUEUE`] frames.
    /// Must be called from inside a tokio runtime.
    pub fn spawn<S: FrameSink>(sink: S, events: Option<mpsc::Sender<ReceiverEvent>>) -> Self {
        Self::spawn_with_queue(sink, events, DEFAULT_WRITER_QUEUE)
    }

    /// Like [`FrameEmitter::spawn`], holding at most `queue` unwritten frames.
    pub fn spawn_with_queue<S: FrameSink>(
        mut sink: S,
        events: Option<mpsc::Sender<ReceiverEvent>>,
        queue: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<EmittedFrame>(queue.max(1));
        let writer = tokio::task::spawn_blocking(move || {
            while let Some(frame) = rx.blocking_recv() {
                let sequence = frame.sequence;
                let event = match sink.write_frame(frame) {
                    Ok(location) => {
                        info!("frame #{sequence} saved to {}", location.display());
                        ReceiverEvent::FrameSaved { sequence, location }
                    }
                    Err(e) => {
                        warn!("frame #{sequence} could not be saved: {e:#}");
                        ReceiverEvent::EmitFailed {
                            sequence,
                            reason: format!("{e:#}"),
                        }
                    }
                };
                if let Some(events) = &events {
                    if events.try_send(event).is_err() {
                        debug!("event channel full or closed; frame #{sequence} event dropped");
                    }
                }
            }
            debug!("frame writer stopped");
        });
        Self {
            tx,
            writer,
            session: String::new(),
            next_sequence: 0,
        }
    }

    /// Start numbering frames for a new session tagged `session`.
    pub fn begin_session(&mut self, session: impl Into<String>) {
        self.session = session.into();
        self.next_sequence = 0;
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Queue a converted frame for persistence and return its sequence
    /// number.  Never waits for encoding; when the writer queue is full the
    /// frame is dropped and no sequence number is consumed.
    pub fn emit(&mut self, rgb: Vec<u8>, width: u32, height: u32) -> Result<u64> {
        let sequence = self.next_sequence;
        let frame = EmittedFrame {
            session: self.session.clone(),
            sequence,
            width,
            height,
            rgb,
        };
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("frame writer is behind; dropping frame #{sequence}");
                bail!("frame writer queue full, frame #{sequence} dropped");
            }
            Err(TrySendError::Closed(_)) => bail!("frame writer has stopped"),
        }
        self.next_sequence += 1;
        Ok(sequence)
    }

    /// Flush queued frames and stop the writer.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.writer.await {
            warn!("frame writer task failed: {e}");
        }
    }
}
