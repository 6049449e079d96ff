use chrono::{DateTime, Local};
use log::{debug, warn};

use crate::abstract_camera::{FrameMetadata, StreamConfiguration, StreamRole};
use crate::image_conversion::{to_rgb565, to_rgb_image};
use crate::still_writer::{StillImage, StillWriter};

/// A completed frame as seen by a consumer. Borrowed from the request for
/// the duration of the call; consumers copy what they want to keep.
pub struct CompletedFrame<'a> {
    pub role: StreamRole,
    /// The device's frame sequence, continued across pipeline restarts so
    /// it never repeats within a session.
    pub sequence: u32,
    pub config: &'a StreamConfiguration,
    pub metadata: &'a FrameMetadata,
    pub data: &'a [u8],
}

/// Whatever wants to look at completed frames. Called on the session's
/// thread before the request is re-queued, so implementations must not
/// block for long.
pub trait FrameConsumer {
    fn consume(&mut self, frame: CompletedFrame<'_>);
}

/// Display driver for the viewfinder: a small panel taking big-endian RGB565.
pub trait PreviewSink: Send {
    fn show(&mut self, width: u32, height: u32, rgb565: &[u8]);
}

/// Viewfinder frames go to the preview panel, still frames go to the still
/// writer.
pub struct AstroFrameConsumer {
    preview: Option<Box<dyn PreviewSink>>,
    writer: Option<StillWriter>,
    preview_frames: u64,
    stills_submitted: u64,
}

impl AstroFrameConsumer {
    pub fn new(preview: Option<Box<dyn PreviewSink>>, writer: Option<StillWriter>) -> Self {
        AstroFrameConsumer{preview, writer, preview_frames: 0, stills_submitted: 0}
    }

    pub fn preview_frames(&self) -> u64 {
        self.preview_frames
    }

    pub fn stills_submitted(&self) -> u64 {
        self.stills_submitted
    }

    pub fn writer(&self) -> Option<&StillWriter> {
        self.writer.as_ref()
    }

    /// Gives up the still writer so the caller can drain it.
    pub fn take_writer(&mut self) -> Option<StillWriter> {
        self.writer.take()
    }

    fn show_preview(&mut self, frame: &CompletedFrame<'_>) {
        let Some(preview) = &mut self.preview else {
            return;
        };
        let config = frame.config;
        match to_rgb_image(config.pixel_format, config.size, config.stride, frame.data) {
            Ok(image) => {
                preview.show(image.width(), image.height(), &to_rgb565(&image));
                self.preview_frames += 1;
            },
            Err(e) => warn!("Could not convert viewfinder frame: {}", e),
        }
    }

    fn submit_still(&mut self, frame: &CompletedFrame<'_>) {
        let Some(writer) = &self.writer else {
            debug!("No still writer, discarding still {}", frame.sequence);
            return;
        };
        let config = frame.config;
        let image = match to_rgb_image(config.pixel_format, config.size, config.stride,
                                       frame.data) {
            Ok(image) => image,
            Err(e) => {
                warn!("Could not convert still frame {}: {}", frame.sequence, e);
                return;
            },
        };
        let captured_at: DateTime<Local> = Local::now();
        if writer.submit(StillImage{sequence: frame.sequence, captured_at, image}) {
            self.stills_submitted += 1;
        }
    }
}

impl FrameConsumer for AstroFrameConsumer {
    fn consume(&mut self, frame: CompletedFrame<'_>) {
        match frame.role {
            StreamRole::Viewfinder => self.show_preview(&frame),
            StreamRole::StillCapture => self.submit_still(&frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstract_camera::{PixelFormat, Size};
    use crate::image_conversion::pack_rgb_image;
    use image::{Rgb, RgbImage};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct RecordingPreview(Arc<Mutex<Vec<(u32, u32, Vec<u8>)>>>);

    impl PreviewSink for RecordingPreview {
        fn show(&mut self, width: u32, height: u32, rgb565: &[u8]) {
            self.0.lock().unwrap().push((width, height, rgb565.to_vec()));
        }
    }

    fn config(role: StreamRole, size: Size) -> StreamConfiguration {
        let format = PixelFormat::Xrgb8888;
        let stride = size.width as usize * 4;
        StreamConfiguration{role, pixel_format: format, size, stride,
                            frame_size: format.frame_size(size, stride),
                            buffer_count: 4, stream: None}
    }

    #[test]
    fn test_viewfinder_goes_to_preview() {
        let shown = Arc::new(Mutex::new(Vec::new()));
        let mut consumer = AstroFrameConsumer::new(
            Some(Box::new(RecordingPreview(shown.clone()))), None);
        let config = config(StreamRole::Viewfinder, Size::new(2, 2));
        let data = pack_rgb_image(&RgbImage::from_pixel(2, 2, Rgb([255, 0, 0])),
                                  PixelFormat::Xrgb8888, 8);
        let metadata = FrameMetadata{sequence: 0, timestamp: Duration::ZERO,
                                     bytes_used: data.len()};
        consumer.consume(CompletedFrame{role: StreamRole::Viewfinder, sequence: 0,
                                        config: &config,
                                        metadata: &metadata, data: &data});
        let shown = shown.lock().unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].0, 2);
        assert_eq!(shown[0].2, vec![0xF8, 0x00, 0xF8, 0x00, 0xF8, 0x00, 0xF8, 0x00]);
        assert_eq!(consumer.preview_frames(), 1);
    }

    #[test]
    fn test_bad_frame_is_skipped() {
        let shown = Arc::new(Mutex::new(Vec::new()));
        let mut consumer = AstroFrameConsumer::new(
            Some(Box::new(RecordingPreview(shown.clone()))), None);
        let viewfinder = config(StreamRole::Viewfinder, Size::new(4, 4));
        let metadata = FrameMetadata{sequence: 0, timestamp: Duration::ZERO, bytes_used: 3};
        consumer.consume(CompletedFrame{role: StreamRole::Viewfinder, sequence: 0,
                                        config: &viewfinder,
                                        metadata: &metadata, data: &[0, 0, 0]});
        assert!(shown.lock().unwrap().is_empty());
        // Stills without a writer are discarded quietly.
        let still = config(StreamRole::StillCapture, Size::new(4, 4));
        consumer.consume(CompletedFrame{role: StreamRole::StillCapture, sequence: 0,
                                        config: &still,
                                        metadata: &metadata, data: &[0; 64]});
        assert_eq!(consumer.stills_submitted(), 0);
    }
}
