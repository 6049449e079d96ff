// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use canonical_error::{CanonicalError, internal_error};
use chrono::{DateTime, Local};
use futures::future::join_all;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// A still frame converted to RGB, waiting to be encoded.
#[derive(Clone)]
pub struct StillImage {
    pub sequence: u32,
    pub captured_at: DateTime<Local>,
    pub image: RgbImage,
}

#[derive(Clone, Debug)]
pub struct EncodedStill {
    pub sequence: u32,
    pub captured_at: DateTime<Local>,
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

/// Destination for encoded stills. Stills reach the sinks one at a time, in
/// submission order; for each still, all sinks write concurrently on the
/// writer's task.
#[async_trait]
pub trait StillSink: Send {
    fn name(&self) -> String;

    async fn write(&mut self, still: &EncodedStill) -> Result<(), CanonicalError>;
}

/// Writes each still to `<dir>/frame{sequence:06}.jpg`.
pub struct JpegFileSink {
    dir: PathBuf,
    dir_created: bool,
}

impl JpegFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JpegFileSink{dir: dir.into(), dir_created: false}
    }

    pub fn path_for(&self, sequence: u32) -> PathBuf {
        self.dir.join(format!("frame{:06}.jpg", sequence))
    }
}

#[async_trait]
impl StillSink for JpegFileSink {
    fn name(&self) -> String {
        format!("file:{}", self.dir.display())
    }

    async fn write(&mut self, still: &EncodedStill) -> Result<(), CanonicalError> {
        if !self.dir_created {
            tokio::fs::create_dir_all(&self.dir).await.map_err(|e| internal_error(
                format!("could not create {}: {}", self.dir.display(), e).as_str()))?;
            self.dir_created = true;
        }
        let path = self.path_for(still.sequence);
        tokio::fs::write(&path, &still.jpeg).await.map_err(|e| internal_error(
            format!("could not write {}: {}", path.display(), e).as_str()))?;
        debug!("Wrote {} ({} bytes)", path.display(), still.jpeg.len());
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
pub struct StillWriterOptions {
    /// Stills waiting for the encoder beyond this are dropped.
    pub capacity: usize,
    pub jpeg_quality: u8,
}

impl Default for StillWriterOptions {
    fn default() -> Self {
        StillWriterOptions{capacity: 8, jpeg_quality: 90}
    }
}

/// Encodes stills to JPEG in the background and hands them to the sinks.
/// Submitting never blocks: when the queue is full the new still is dropped.
pub struct StillWriter {
    sender: mpsc::Sender<StillImage>,
    dropped: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
    worker: JoinHandle<()>,
}

impl StillWriter {
    /// Must be called within a tokio runtime.
    pub fn start(sinks: Vec<Box<dyn StillSink>>, options: StillWriterOptions) -> Self {
        let (sender, receiver) = mpsc::channel(options.capacity.max(1));
        let written = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(Self::worker(receiver, sinks, options.jpeg_quality,
                                               written.clone()));
        StillWriter{sender, dropped: Arc::new(AtomicU64::new(0)), written, worker}
    }

    /// Queues `still` for encoding. Returns false if it was dropped.
    pub fn submit(&self, still: StillImage) -> bool {
        match self.sender.try_send(still) {
            Ok(()) => true,
            Err(TrySendError::Full(still)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Still queue full, dropping still {} ({} dropped so far)",
                      still.sequence, dropped);
                false
            },
            Err(TrySendError::Closed(still)) => {
                error!("Still writer has stopped, dropping still {}", still.sequence);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            },
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stills encoded and passed to the sinks so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Waits for every queued still to be written, then stops the worker.
    /// Returns the number of stills written.
    pub async fn shutdown(self) -> u64 {
        let StillWriter{sender, written, worker, ..} = self;
        drop(sender);
        if let Err(e) = worker.await {
            error!("Still writer task failed: {}", e);
        }
        written.load(Ordering::Relaxed)
    }

    async fn worker(mut receiver: mpsc::Receiver<StillImage>,
                    mut sinks: Vec<Box<dyn StillSink>>,
                    quality: u8,
                    written: Arc<AtomicU64>) {
        while let Some(still) = receiver.recv().await {
            let sequence = still.sequence;
            let encoded = match tokio::task::spawn_blocking(
                move || encode_jpeg(still, quality)).await
            {
                Ok(Ok(encoded)) => encoded,
                Ok(Err(e)) => {
                    warn!("Could not encode still {}: {}", sequence, e);
                    continue;
                },
                Err(e) => {
                    error!("JPEG encoder for still {} failed: {}", sequence, e);
                    continue;
                },
            };
            // Sinks write concurrently.
            let results = join_all(sinks.iter_mut().map(|sink| sink.write(&encoded))).await;
            for (sink, result) in sinks.iter().zip(results) {
                if let Err(e) = result {
                    warn!("Sink {} failed for still {}: {}", sink.name(), sequence, e);
                }
            }
            written.fetch_add(1, Ordering::Relaxed);
        }
        info!("Still writer finished after {} stills", written.load(Ordering::Relaxed));
    }
}

pub fn encode_jpeg(still: StillImage, quality: u8) -> Result<EncodedStill, CanonicalError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode_image(&still.image)
        .map_err(|e| internal_error(format!("JPEG encoding failed: {}", e).as_str()))?;
    Ok(EncodedStill{sequence: still.sequence,
                    captured_at: still.captured_at,
                    width: still.image.width(),
                    height: still.image.height(),
                    jpeg})
}
