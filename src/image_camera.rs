// Fake camera that yields frames rendered from a fixed image. For testing and
// for running the rig without camera hardware.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error, resource_exhausted_error};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use log::{debug, warn};

use crate::abstract_camera::{AbstractCamera, BufferId, CameraConfiguration,
                             CompletionSink, ConfigurationStatus, ControlList,
                             FrameBuffer, FrameBufferAllocator, FrameMetadata,
                             PixelFormat, Request, RequestId, RequestStatus,
                             Size, StreamConfiguration, StreamId, StreamRole};
use crate::image_conversion::pack_rgb_image;

/// When queued requests complete.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FrameTiming {
    /// Only when complete_next() or complete_all() is called.
    Manual,
    /// A background thread completes the oldest queued request this often.
    Interval(Duration),
}

#[derive(Clone, Debug)]
pub struct ImageCameraOptions {
    /// Buffers allocated per stream.
    pub buffer_count: usize,
    /// Most streams one configuration may hold.
    pub max_streams: usize,
    /// Total buffers the device can hand out, across streams.
    pub buffer_budget: Option<usize>,
    /// Total requests the device can create.
    pub request_limit: Option<usize>,
    pub supported_formats: Vec<PixelFormat>,
    pub timing: FrameTiming,
}

impl Default for ImageCameraOptions {
    fn default() -> Self {
        ImageCameraOptions{buffer_count: 4,
                           max_streams: 2,
                           buffer_budget: None,
                           request_limit: None,
                           supported_formats: vec![PixelFormat::Xrgb8888,
                                                   PixelFormat::Xbgr8888,
                                                   PixelFormat::Rgb888,
                                                   PixelFormat::Bgr888,
                                                   PixelFormat::Yuv420],
                           timing: FrameTiming::Manual}
    }
}

#[derive(Default)]
struct SharedState {
    configured: Option<CameraConfiguration>,
    running: bool,
    released: bool,
    sink: Option<CompletionSink>,

    // Buffers handed out by allocators, by stream.
    mapped: BTreeMap<StreamId, Vec<BufferId>>,
    next_buffer_id: u64,

    next_request_id: RequestId,
    requests_created: usize,

    queue: VecDeque<Request>,
    queue_counts: HashMap<RequestId, usize>,
    queue_history: Vec<(RequestId, u64, ControlList)>,

    sequences: BTreeMap<StreamId, u32>,
    started_at: Option<Instant>,
    rendered: HashMap<StreamId, Arc<Vec<u8>>>,

    stop_worker: bool,
}

impl SharedState {
    fn stream_config(&self, stream: StreamId) -> Option<&StreamConfiguration> {
        self.configured.as_ref()
            .and_then(|c| c.streams.iter().find(|s| s.stream == Some(stream)))
    }

    fn mapped_total(&self) -> usize {
        self.mapped.values().map(Vec::len).sum()
    }
}

pub struct ImageCamera {
    image: Arc<RgbImage>,
    options: ImageCameraOptions,
    state: Arc<Mutex<SharedState>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ImageCamera {
    pub fn new(image: RgbImage) -> Result<Self, CanonicalError> {
        if image.width() < 2 || image.height() < 2 {
            return Err(invalid_argument_error(
                format!("image {}x{} is too small", image.width(), image.height()).as_str()));
        }
        Ok(Self::with_options(image, ImageCameraOptions::default()))
    }

    pub fn with_options(image: RgbImage, options: ImageCameraOptions) -> Self {
        assert!(image.width() >= 2 && image.height() >= 2);
        ImageCamera{image: Arc::new(image),
                    options,
                    state: Arc::new(Mutex::new(SharedState::default())),
                    worker: Mutex::new(None)}
    }

    /// A dark sky with a scattering of stars. Deterministic.
    pub fn star_field(width: u32, height: u32) -> RgbImage {
        let mut image = RgbImage::from_pixel(width, height, Rgb([4, 6, 12]));
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as u32
        };
        let num_stars = (width * height / 2000).max(8);
        for _ in 0..num_stars {
            let x = (next() % width) as i32;
            let y = (next() % height) as i32;
            let radius = (next() % 3) as i32;
            let level = 128 + (next() % 128) as u8;
            draw_filled_circle_mut(&mut image, (x, y), radius, Rgb([level, level, level]));
        }
        image
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        // A poisoned lock means a test thread panicked; keep going with the
        // state as it was.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Completes the oldest queued request. Returns false if none was queued.
    pub fn complete_next(&self) -> bool {
        let completed = Self::complete_locked(&self.image, &mut self.lock());
        match completed {
            Some((request, sink)) => {
                sink(request);
                true
            },
            None => false,
        }
    }

    /// Completes every request queued at the time of the call, oldest first.
    pub fn complete_all(&self) -> usize {
        let queued = self.queued_count();
        let mut completed = 0;
        for _ in 0..queued {
            if !self.complete_next() {
                break;
            }
            completed += 1;
        }
        completed
    }

    fn complete_locked(image: &RgbImage, state: &mut SharedState)
                       -> Option<(Request, CompletionSink)> {
        let sink = state.sink.clone()?;
        let mut request = state.queue.pop_front()?;
        let stream = request.stream()?;
        let config = state.stream_config(stream)?.clone();
        let frame = state.rendered.entry(stream).or_insert_with(|| {
            let scaled = imageops::resize(image, config.size.width, config.size.height,
                                          FilterType::Triangle);
            Arc::new(pack_rgb_image(&scaled, config.pixel_format, config.stride))
        }).clone();
        let sequence = state.sequences.entry(stream).or_insert(0);
        let metadata = FrameMetadata{
            sequence: *sequence,
            timestamp: state.started_at.map(|t| t.elapsed()).unwrap_or_default(),
            bytes_used: frame.len()};
        *sequence += 1;
        request.complete(RequestStatus::Complete, Some(metadata), Some(frame.to_vec()));
        Some((request, sink))
    }

    fn worker(image: Arc<RgbImage>, state: Arc<Mutex<SharedState>>, interval: Duration) {
        loop {
            thread::sleep(interval);
            let completed = {
                let mut locked_state = state.lock().unwrap_or_else(|e| e.into_inner());
                if locked_state.stop_worker {
                    return;
                }
                Self::complete_locked(&image, &mut locked_state)
            };
            if let Some((request, sink)) = completed {
                sink(request);
            }
        }
    }

    fn stop_worker(&self) {
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            self.lock().stop_worker = true;
            if handle.join().is_err() {
                warn!("ImageCamera worker panicked");
            }
        }
    }

    // Inspection, mostly for tests.

    pub fn queued_count(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn queued_for(&self, stream: StreamId) -> usize {
        self.lock().queue.iter().filter(|r| r.stream() == Some(stream)).count()
    }

    /// How many times the request with `id` has been queued.
    pub fn queue_count(&self, id: RequestId) -> usize {
        self.lock().queue_counts.get(&id).copied().unwrap_or(0)
    }

    /// (request id, cookie, controls) of every accepted enqueue, in order.
    pub fn queue_history(&self) -> Vec<(RequestId, u64, ControlList)> {
        self.lock().queue_history.clone()
    }

    pub fn mapped_buffer_count(&self) -> usize {
        self.lock().mapped_total()
    }

    pub fn requests_created(&self) -> usize {
        self.lock().requests_created
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }
}

impl AbstractCamera for ImageCamera {
    fn id(&self) -> String {
        "image-camera".to_string()
    }

    fn model(&self) -> String {
        "ImageCamera".to_string()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn generate_configuration(&self, roles: &[StreamRole])
                              -> Result<CameraConfiguration, CanonicalError> {
        if roles.len() > self.options.max_streams {
            return Err(invalid_argument_error(
                format!("{} streams requested, camera supports {}",
                        roles.len(), self.options.max_streams).as_str()));
        }
        let (width, height) = self.dimensions();
        let mut streams = Vec::with_capacity(roles.len());
        for role in roles {
            if streams.iter().any(|s: &StreamConfiguration| s.role == *role) {
                return Err(invalid_argument_error(
                    format!("role {} requested twice", role).as_str()));
            }
            let size = match role {
                StreamRole::Viewfinder => Size::new((width / 2) & !1, (height / 2) & !1),
                StreamRole::StillCapture => Size::new(width & !1, height & !1),
            };
            let format = PixelFormat::Xrgb8888;
            let stride = size.width as usize * format.bytes_per_pixel();
            streams.push(StreamConfiguration{
                role: *role,
                pixel_format: format,
                size,
                stride,
                frame_size: format.frame_size(size, stride),
                buffer_count: self.options.buffer_count,
                stream: None});
        }
        Ok(CameraConfiguration{streams})
    }

    fn validate(&self, config: &mut CameraConfiguration) -> ConfigurationStatus {
        if config.streams.is_empty() || config.streams.len() > self.options.max_streams {
            return ConfigurationStatus::Invalid;
        }
        let (max_width, max_height) = self.dimensions();
        let mut status = ConfigurationStatus::Valid;
        for stream_config in &mut config.streams {
            let requested = stream_config.clone();
            if stream_config.size.width == 0 || stream_config.size.height == 0 {
                return ConfigurationStatus::Invalid;
            }
            if !self.options.supported_formats.contains(&stream_config.pixel_format) {
                stream_config.pixel_format = PixelFormat::Xrgb8888;
            }
            let width = stream_config.size.width.clamp(2, max_width) & !1;
            let height = stream_config.size.height.clamp(2, max_height) & !1;
            stream_config.size = Size::new(width, height);
            let format = stream_config.pixel_format;
            stream_config.stride = match format {
                PixelFormat::Yuv420 => width as usize,
                _ => width as usize * format.bytes_per_pixel(),
            };
            stream_config.frame_size = format.frame_size(stream_config.size,
                                                         stream_config.stride);
            stream_config.buffer_count = self.options.buffer_count;
            if stream_config.pixel_format != requested.pixel_format ||
                stream_config.size != requested.size
            {
                status = ConfigurationStatus::Adjusted;
            }
        }
        status
    }

    fn configure(&self, config: &mut CameraConfiguration) -> Result<(), CanonicalError> {
        let mut locked_state = self.lock();
        if locked_state.released {
            return Err(failed_precondition_error("camera has been released"));
        }
        if locked_state.running {
            return Err(failed_precondition_error("pipeline is running"));
        }
        let mut check = config.clone();
        if self.validate(&mut check) != ConfigurationStatus::Valid ||
            check.streams != config.streams
        {
            return Err(invalid_argument_error("configuration is not validated"));
        }
        for (index, stream_config) in config.streams.iter_mut().enumerate() {
            stream_config.stream = Some(StreamId(index as u32));
        }
        let unchanged = locked_state.configured.as_ref() == Some(&*config);
        if !unchanged && locked_state.mapped_total() > 0 {
            return Err(failed_precondition_error(
                "buffers of the previous configuration are still allocated"));
        }
        debug!("ImageCamera configured with {:?}", config.roles());
        locked_state.configured = Some(config.clone());
        locked_state.rendered.clear();
        Ok(())
    }

    fn create_allocator(&self) -> Box<dyn FrameBufferAllocator> {
        Box::new(ImageAllocator{state: self.state.clone(),
                                buffer_count: self.options.buffer_count,
                                buffer_budget: self.options.buffer_budget,
                                buffers: BTreeMap::new()})
    }

    fn create_request(&self, cookie: u64) -> Option<Request> {
        let mut locked_state = self.lock();
        if let Some(limit) = self.options.request_limit {
            if locked_state.requests_created >= limit {
                return None;
            }
        }
        locked_state.next_request_id += 1;
        locked_state.requests_created += 1;
        Some(Request::new(locked_state.next_request_id, cookie))
    }

    fn set_completion_sink(&self, sink: CompletionSink) {
        self.lock().sink = Some(sink);
    }

    fn start(&self) -> Result<(), CanonicalError> {
        {
            let mut locked_state = self.lock();
            if locked_state.configured.is_none() {
                return Err(failed_precondition_error("camera is not configured"));
            }
            if locked_state.running {
                return Err(failed_precondition_error("pipeline already running"));
            }
            locked_state.running = true;
            locked_state.sequences.clear();
            locked_state.started_at = Some(Instant::now());
            locked_state.stop_worker = false;
        }
        if let FrameTiming::Interval(interval) = self.options.timing {
            let image = self.image.clone();
            let state = self.state.clone();
            *self.worker.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(thread::spawn(move || Self::worker(image, state, interval)));
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), CanonicalError> {
        self.stop_worker();
        let (cancelled, sink) = {
            let mut locked_state = self.lock();
            locked_state.running = false;
            let cancelled: Vec<Request> = locked_state.queue.drain(..).collect();
            (cancelled, locked_state.sink.clone())
        };
        debug!("ImageCamera stopped, cancelling {} requests", cancelled.len());
        for mut request in cancelled {
            request.complete(RequestStatus::Cancelled, None, None);
            if let Some(sink) = &sink {
                sink(request);
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.lock().running
    }

    fn queue_request(&self, request: Request) -> Result<(), (Request, CanonicalError)> {
        let mut locked_state = self.lock();
        if !locked_state.running {
            return Err((request, failed_precondition_error("pipeline is not running")));
        }
        if request.status() != RequestStatus::Pending {
            return Err((request, failed_precondition_error("request was not reused")));
        }
        let Some(buffer) = request.buffer() else {
            return Err((request, invalid_argument_error("request has no buffer")));
        };
        let known = locked_state.mapped.get(&buffer.stream)
            .is_some_and(|ids| ids.contains(&buffer.id));
        if !known {
            return Err((request, invalid_argument_error("buffer is not allocated")));
        }
        if locked_state.queue.iter().any(|r| r.id() == request.id()) {
            return Err((request, failed_precondition_error("request is already queued")));
        }
        *locked_state.queue_counts.entry(request.id()).or_insert(0) += 1;
        locked_state.queue_history.push(
            (request.id(), request.cookie(), request.controls().clone()));
        locked_state.queue.push_back(request);
        Ok(())
    }

    fn release(&self) {
        let mut locked_state = self.lock();
        locked_state.released = true;
        locked_state.sink = None;
    }
}

/// We arrange to stop the frame thread when ImageCamera goes out of scope.
impl Drop for ImageCamera {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

struct ImageAllocator {
    state: Arc<Mutex<SharedState>>,
    buffer_count: usize,
    buffer_budget: Option<usize>,
    buffers: BTreeMap<StreamId, Vec<FrameBuffer>>,
}

impl FrameBufferAllocator for ImageAllocator {
    fn allocate(&mut self, stream: StreamId) -> Result<usize, CanonicalError> {
        let mut locked_state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let length = match locked_state.stream_config(stream) {
            Some(config) => config.frame_size,
            None => return Err(invalid_argument_error(
                format!("stream {:?} is not configured", stream).as_str())),
        };
        if self.buffers.get(&stream).is_some_and(|b| !b.is_empty()) {
            return Err(failed_precondition_error(
                format!("stream {:?} already has buffers", stream).as_str()));
        }
        if let Some(budget) = self.buffer_budget {
            if locked_state.mapped_total() + self.buffer_count > budget {
                return Err(resource_exhausted_error("out of buffer memory"));
            }
        }
        let mut buffers = Vec::with_capacity(self.buffer_count);
        for _ in 0..self.buffer_count {
            locked_state.next_buffer_id += 1;
            buffers.push(FrameBuffer{id: BufferId(locked_state.next_buffer_id),
                                     stream,
                                     length});
        }
        locked_state.mapped.insert(stream, buffers.iter().map(|b| b.id).collect());
        self.buffers.insert(stream, buffers);
        Ok(self.buffer_count)
    }

    fn buffers(&self, stream: StreamId) -> &[FrameBuffer] {
        self.buffers.get(&stream).map(Vec::as_slice).unwrap_or(&[])
    }

    fn free(&mut self, stream: StreamId) -> Result<(), CanonicalError> {
        let mut locked_state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if locked_state.queue.iter().any(|r| r.stream() == Some(stream)) {
            return Err(failed_precondition_error(
                format!("stream {:?} has queued requests", stream).as_str()));
        }
        locked_state.mapped.remove(&stream);
        self.buffers.remove(&stream);
        Ok(())
    }
}
