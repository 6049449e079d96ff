// libcamera-backed camera for the Raspberry Pi. libcamera objects borrow the
// CameraManager and must stay on one thread, so a worker thread owns all of
// them and the AbstractCamera methods talk to it over a channel.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error, internal_error,
                      invalid_argument_error, not_found_error,
                      resource_exhausted_error, unavailable_error};
use log::{debug, error, info, warn};

use libcamera::{
    camera::{ActiveCamera, CameraConfigurationStatus},
    camera_manager::CameraManager,
    controls,
    framebuffer::AsFrameBuffer,
    framebuffer_allocator,
    framebuffer_map::MemoryMappedFrameBuffer,
    geometry,
    pixel_format,
    properties,
    request::{self as native_request, ReuseFlag as NativeReuseFlag},
    stream::{self as native_stream, Stream},
};

use crate::abstract_camera::{AbstractCamera, BufferId, CameraConfiguration,
                             CompletionSink, ConfigurationStatus, ControlId,
                             ControlList, ControlValue, EnumeratedCameraInfo,
                             FrameBuffer, FrameBufferAllocator, FrameMetadata,
                             PixelFormat, Request, RequestId, RequestStatus,
                             Size, StreamConfiguration, StreamId, StreamRole};

type MappedBuffer = MemoryMappedFrameBuffer<framebuffer_allocator::FrameBuffer>;
type NativeConfiguration = libcamera::camera::CameraConfiguration;
type NativeRequest = native_request::Request;

fn native_role(role: StreamRole) -> native_stream::StreamRole {
    match role {
        StreamRole::Viewfinder => native_stream::StreamRole::ViewFinder,
        StreamRole::StillCapture => native_stream::StreamRole::StillCapture,
    }
}

fn native_format(format: PixelFormat) -> pixel_format::PixelFormat {
    pixel_format::PixelFormat::new(u32::from_le_bytes(format.fourcc()), 0)
}

fn io_error(what: &str, e: impl std::fmt::Debug) -> CanonicalError {
    failed_precondition_error(format!("{} failed: {:?}", what, e).as_str())
}

enum Command {
    GenerateConfiguration(Vec<StreamRole>),
    Validate(CameraConfiguration),
    Configure(CameraConfiguration),
    Allocate(StreamId),
    Free(StreamId),
    CreateRequest(u64),
    SetSink(CompletionSink),
    Start,
    Stop,
    Queue(Request),
    Shutdown,
}

enum Reply {
    Configuration(Result<CameraConfiguration, CanonicalError>),
    Validated(ConfigurationStatus, CameraConfiguration),
    Allocated(Result<Vec<FrameBuffer>, CanonicalError>),
    Created(Option<Request>),
    Queued(Result<(), (Request, CanonicalError)>),
    Done(Result<(), CanonicalError>),
}

enum WorkerMessage {
    Command(Command, mpsc::Sender<Reply>),
    Completed(NativeRequest),
}

pub struct RpiCamera {
    id: String,
    model: String,
    dimensions: (u32, u32),

    sender: mpsc::Sender<WorkerMessage>,
    running: AtomicBool,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RpiCamera {
    pub fn enumerate_cameras() -> Result<Vec<EnumeratedCameraInfo>, CanonicalError> {
        let mgr = CameraManager::new().map_err(|e| io_error("CameraManager::new", e))?;
        let cameras = mgr.cameras();
        let mut answer = vec![];
        for i in 0..cameras.len() {
            let Some(cam) = cameras.get(i) else {
                continue;
            };
            let props = cam.properties();
            let model = props.get::<properties::Model>()
                .map(|m| m.to_string()).unwrap_or_else(|_| "unknown".to_string());
            let (width, height) = props.get::<properties::PixelArraySize>()
                .map(|s| (s.width, s.height)).unwrap_or((0, 0));
            answer.push(EnumeratedCameraInfo{model, width, height});
        }
        Ok(answer)
    }

    /// Acquires the camera at `camera_index` of enumerate_cameras().
    pub fn new(camera_index: usize) -> Result<Self, CanonicalError> {
        let (sender, receiver) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let completions = sender.clone();
        let worker = thread::Builder::new()
            .name("rpi-camera".to_string())
            .spawn(move || worker_main(camera_index, receiver, completions, ready_tx))
            .map_err(|e| io_error("spawning camera thread", e))?;
        let (id, model, dimensions) = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            },
            Err(_) => {
                let _ = worker.join();
                return Err(unavailable_error("camera thread exited during setup"));
            },
        };
        info!("Acquired camera {} ({}) {}x{}", id, model, dimensions.0, dimensions.1);
        Ok(RpiCamera{id, model, dimensions, sender,
                     running: AtomicBool::new(false),
                     worker: Mutex::new(Some(worker))})
    }

    fn call(&self, command: Command) -> Result<Reply, CanonicalError> {
        call(&self.sender, command)
    }

    fn shutdown(&self) {
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let (reply_tx, _reply_rx) = mpsc::channel();
            let _ = self.sender.send(WorkerMessage::Command(Command::Shutdown, reply_tx));
            if handle.join().is_err() {
                warn!("Camera thread panicked");
            }
        }
    }
}

fn call(sender: &mpsc::Sender<WorkerMessage>, command: Command)
        -> Result<Reply, CanonicalError> {
    let (reply_tx, reply_rx) = mpsc::channel();
    sender.send(WorkerMessage::Command(command, reply_tx))
        .map_err(|_| failed_precondition_error("camera has been released"))?;
    reply_rx.recv().map_err(|_| failed_precondition_error("camera has been released"))
}

fn done(reply: Result<Reply, CanonicalError>) -> Result<(), CanonicalError> {
    match reply? {
        Reply::Done(result) => result,
        _ => Err(failed_precondition_error("unexpected reply from camera thread")),
    }
}

impl AbstractCamera for RpiCamera {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn generate_configuration(&self, roles: &[StreamRole])
                              -> Result<CameraConfiguration, CanonicalError> {
        match self.call(Command::GenerateConfiguration(roles.to_vec()))? {
            Reply::Configuration(result) => result,
            _ => Err(failed_precondition_error("unexpected reply from camera thread")),
        }
    }

    fn validate(&self, config: &mut CameraConfiguration) -> ConfigurationStatus {
        match self.call(Command::Validate(config.clone())) {
            Ok(Reply::Validated(status, validated)) => {
                *config = validated;
                status
            },
            _ => ConfigurationStatus::Invalid,
        }
    }

    fn configure(&self, config: &mut CameraConfiguration) -> Result<(), CanonicalError> {
        match self.call(Command::Configure(config.clone()))? {
            Reply::Configuration(result) => {
                *config = result?;
                Ok(())
            },
            _ => Err(failed_precondition_error("unexpected reply from camera thread")),
        }
    }

    fn create_allocator(&self) -> Box<dyn FrameBufferAllocator> {
        Box::new(RpiAllocator{sender: self.sender.clone(), buffers: BTreeMap::new()})
    }

    fn create_request(&self, cookie: u64) -> Option<Request> {
        match self.call(Command::CreateRequest(cookie)) {
            Ok(Reply::Created(request)) => request,
            _ => None,
        }
    }

    fn set_completion_sink(&self, sink: CompletionSink) {
        if let Err(e) = done(self.call(Command::SetSink(sink))) {
            warn!("Could not set completion sink: {}", e);
        }
    }

    fn start(&self) -> Result<(), CanonicalError> {
        done(self.call(Command::Start))?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), CanonicalError> {
        done(self.call(Command::Stop))?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn queue_request(&self, request: Request) -> Result<(), (Request, CanonicalError)> {
        let replica = request.replica();
        let (reply_tx, reply_rx) = mpsc::channel();
        if let Err(mpsc::SendError(message)) =
            self.sender.send(WorkerMessage::Command(Command::Queue(request), reply_tx))
        {
            let request = match message {
                WorkerMessage::Command(Command::Queue(request), _) => request,
                _ => replica,
            };
            return Err((request, failed_precondition_error("camera has been released")));
        }
        match reply_rx.recv() {
            Ok(Reply::Queued(result)) => result,
            Ok(_) => {
                error!("Camera thread sent the wrong reply for request {}", replica.id());
                Err((replica, internal_error("unexpected reply to queue command")))
            },
            // The worker went away holding the request.
            Err(_) => {
                error!("Camera thread exited while queueing request {}", replica.id());
                Err((replica, unavailable_error("camera thread exited")))
            },
        }
    }

    fn release(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown();
    }
}

impl Drop for RpiCamera {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RpiAllocator {
    sender: mpsc::Sender<WorkerMessage>,
    buffers: BTreeMap<StreamId, Vec<FrameBuffer>>,
}

impl FrameBufferAllocator for RpiAllocator {
    fn allocate(&mut self, stream: StreamId) -> Result<usize, CanonicalError> {
        match call(&self.sender, Command::Allocate(stream))? {
            Reply::Allocated(result) => {
                let buffers = result?;
                let count = buffers.len();
                self.buffers.insert(stream, buffers);
                Ok(count)
            },
            _ => Err(failed_precondition_error("unexpected reply from camera thread")),
        }
    }

    fn buffers(&self, stream: StreamId) -> &[FrameBuffer] {
        self.buffers.get(&stream).map(Vec::as_slice).unwrap_or(&[])
    }

    fn free(&mut self, stream: StreamId) -> Result<(), CanonicalError> {
        done(call(&self.sender, Command::Free(stream)))?;
        self.buffers.remove(&stream);
        Ok(())
    }
}

type CameraInfo = (String, String, (u32, u32));

fn worker_main(camera_index: usize,
               receiver: mpsc::Receiver<WorkerMessage>,
               completions: mpsc::Sender<WorkerMessage>,
               ready: mpsc::Sender<Result<CameraInfo, CanonicalError>>) {
    let mgr = match CameraManager::new() {
        Ok(mgr) => mgr,
        Err(e) => {
            let _ = ready.send(Err(io_error("CameraManager::new", e)));
            return;
        },
    };
    let cameras = mgr.cameras();
    let Some(cam) = cameras.get(camera_index) else {
        let _ = ready.send(Err(not_found_error(
            format!("no camera at index {}", camera_index).as_str())));
        return;
    };
    let props = cam.properties();
    let model = props.get::<properties::Model>()
        .map(|m| m.to_string()).unwrap_or_else(|_| "unknown".to_string());
    let dimensions = props.get::<properties::PixelArraySize>()
        .map(|s| (s.width, s.height)).unwrap_or((0, 0));
    let mut active = match cam.acquire() {
        Ok(active) => active,
        Err(e) => {
            let _ = ready.send(Err(io_error("acquiring camera", e)));
            return;
        },
    };
    active.on_request_completed(move |request| {
        let _ = completions.send(WorkerMessage::Completed(request));
    });
    let allocator = framebuffer_allocator::FrameBufferAllocator::new(&active);
    let _ = ready.send(Ok((cam.id().to_string(), model, dimensions)));

    let mut worker = Worker{active, allocator,
                            config: None, applied: None,
                            streams: BTreeMap::new(),
                            unattached: HashMap::new(),
                            by_stream: BTreeMap::new(),
                            idle: HashMap::new(),
                            in_flight: HashMap::new(),
                            sink: None,
                            next_buffer_id: 0,
                            next_request_id: 0,
                            running: false};
    worker.run(receiver);
    debug!("Camera thread exiting");
}

struct Worker<'d> {
    active: ActiveCamera<'d>,
    allocator: framebuffer_allocator::FrameBufferAllocator,
    config: Option<NativeConfiguration>,
    applied: Option<CameraConfiguration>,
    streams: BTreeMap<StreamId, Stream>,

    // Mapped buffers not yet attached to a native request.
    unattached: HashMap<BufferId, MappedBuffer>,
    by_stream: BTreeMap<StreamId, Vec<BufferId>>,
    // Native requests are created on first use and keyed by their buffer;
    // the buffer id doubles as the native cookie.
    idle: HashMap<BufferId, NativeRequest>,
    in_flight: HashMap<BufferId, Request>,

    sink: Option<CompletionSink>,
    next_buffer_id: u64,
    next_request_id: RequestId,
    running: bool,
}

impl<'d> Worker<'d> {
    fn run(&mut self, receiver: mpsc::Receiver<WorkerMessage>) {
        let mut backlog: VecDeque<(Command, mpsc::Sender<Reply>)> = VecDeque::new();
        loop {
            let (command, reply) = match backlog.pop_front() {
                Some(pending) => pending,
                None => match receiver.recv() {
                    Ok(WorkerMessage::Command(command, reply)) => (command, reply),
                    Ok(WorkerMessage::Completed(request)) => {
                        self.complete(request);
                        continue;
                    },
                    Err(_) => return,
                },
            };
            let answer = match command {
                Command::GenerateConfiguration(roles) =>
                    Reply::Configuration(self.generate(&roles)),
                Command::Validate(mut config) => {
                    let status = self.validate(&mut config);
                    Reply::Validated(status, config)
                },
                Command::Configure(config) => Reply::Configuration(self.configure(config)),
                Command::Allocate(stream) => Reply::Allocated(self.allocate(stream)),
                Command::Free(stream) => Reply::Done(self.free(stream)),
                Command::CreateRequest(cookie) => {
                    self.next_request_id += 1;
                    Reply::Created(Some(Request::new(self.next_request_id, cookie)))
                },
                Command::SetSink(sink) => {
                    self.sink = Some(sink);
                    Reply::Done(Ok(()))
                },
                Command::Start => Reply::Done(self.start()),
                Command::Stop => {
                    let result = self.stop();
                    // Deliver the cancellations before stop() returns.
                    while let Ok(message) = receiver.try_recv() {
                        match message {
                            WorkerMessage::Completed(request) => self.complete(request),
                            WorkerMessage::Command(c, r) => backlog.push_back((c, r)),
                        }
                    }
                    Reply::Done(result)
                },
                Command::Queue(request) => Reply::Queued(self.queue(request)),
                Command::Shutdown => {
                    if self.running {
                        let _ = self.stop();
                    }
                    self.sink = None;
                    let _ = reply.send(Reply::Done(Ok(())));
                    return;
                },
            };
            let _ = reply.send(answer);
        }
    }

    fn native_config(&self, config: &CameraConfiguration)
                     -> Result<NativeConfiguration, CanonicalError> {
        let roles: Vec<_> = config.streams.iter().map(|s| native_role(s.role)).collect();
        let mut native = self.active.generate_configuration(&roles)
            .ok_or_else(|| invalid_argument_error("camera cannot serve these roles"))?;
        for (index, stream_config) in config.streams.iter().enumerate() {
            let Some(mut native_stream) = native.get_mut(index) else {
                return Err(invalid_argument_error("camera dropped a stream"));
            };
            native_stream.set_pixel_format(native_format(stream_config.pixel_format));
            native_stream.set_size(geometry::Size{width: stream_config.size.width,
                                                  height: stream_config.size.height});
            if stream_config.buffer_count > 0 {
                native_stream.set_buffer_count(stream_config.buffer_count as u32);
            }
        }
        Ok(native)
    }

    /// Copies the device's view of each stream back. Returns false if the
    /// device picked a pixel format we cannot decode.
    fn read_back(native: &NativeConfiguration, config: &mut CameraConfiguration) -> bool {
        let mut known = true;
        for (index, stream_config) in config.streams.iter_mut().enumerate() {
            let Some(native_stream) = native.get(index) else {
                return false;
            };
            let fourcc = native_stream.get_pixel_format().fourcc().to_le_bytes();
            match PixelFormat::from_fourcc(fourcc) {
                Some(format) => stream_config.pixel_format = format,
                None => {
                    warn!("Camera chose unsupported format {:?} for {}",
                          String::from_utf8_lossy(&fourcc), stream_config.role);
                    known = false;
                },
            }
            let size = native_stream.get_size();
            stream_config.size = Size::new(size.width, size.height);
            stream_config.stride = native_stream.get_stride() as usize;
            stream_config.frame_size = native_stream.get_frame_size() as usize;
            stream_config.buffer_count = native_stream.get_buffer_count() as usize;
        }
        known
    }

    fn generate(&self, roles: &[StreamRole]) -> Result<CameraConfiguration, CanonicalError> {
        let native_roles: Vec<_> = roles.iter().map(|r| native_role(*r)).collect();
        let native = self.active.generate_configuration(&native_roles)
            .ok_or_else(|| invalid_argument_error("camera cannot serve these roles"))?;
        let mut config = CameraConfiguration{streams: roles.iter().map(|role| {
            StreamConfiguration{role: *role, pixel_format: PixelFormat::Xrgb8888,
                                size: Size::new(0, 0), stride: 0, frame_size: 0,
                                buffer_count: 0, stream: None}
        }).collect()};
        if !Self::read_back(&native, &mut config) {
            // Ask for something we can decode; validation negotiates from here.
            for stream_config in &mut config.streams {
                stream_config.pixel_format = PixelFormat::Xrgb8888;
            }
        }
        Ok(config)
    }

    fn validate(&self, config: &mut CameraConfiguration) -> ConfigurationStatus {
        let mut native = match self.native_config(config) {
            Ok(native) => native,
            Err(e) => {
                warn!("Cannot validate configuration: {}", e);
                return ConfigurationStatus::Invalid;
            },
        };
        let requested = config.clone();
        let status = match native.validate() {
            CameraConfigurationStatus::Valid => ConfigurationStatus::Valid,
            CameraConfigurationStatus::Adjusted => ConfigurationStatus::Adjusted,
            CameraConfigurationStatus::Invalid => return ConfigurationStatus::Invalid,
        };
        if !Self::read_back(&native, config) {
            return ConfigurationStatus::Invalid;
        }
        let changed = config.streams.iter().zip(&requested.streams)
            .any(|(a, b)| a.pixel_format != b.pixel_format || a.size != b.size);
        if changed { ConfigurationStatus::Adjusted } else { status }
    }

    fn configure(&mut self, mut config: CameraConfiguration)
                 -> Result<CameraConfiguration, CanonicalError> {
        if self.running {
            return Err(failed_precondition_error("pipeline is running"));
        }
        for stream_config in &mut config.streams {
            stream_config.stream = None;
        }
        let unchanged = self.applied.as_ref().is_some_and(|applied| {
            applied.streams.iter().zip(&config.streams).all(|(a, b)| {
                a.role == b.role && a.pixel_format == b.pixel_format && a.size == b.size
            }) && applied.streams.len() == config.streams.len()
        });
        if unchanged {
            if let Some(applied) = &self.applied {
                return Ok(applied.clone());
            }
        }
        if !self.by_stream.is_empty() {
            return Err(failed_precondition_error(
                "buffers of the previous configuration are still allocated"));
        }
        let mut native = self.native_config(&config)?;
        if !matches!(native.validate(), CameraConfigurationStatus::Valid) {
            return Err(invalid_argument_error("configuration is not validated"));
        }
        self.active.configure(&mut native).map_err(|e| io_error("configure", e))?;
        Self::read_back(&native, &mut config);
        self.streams.clear();
        for (index, stream_config) in config.streams.iter_mut().enumerate() {
            let stream = native.get(index).and_then(|s| s.stream())
                .ok_or_else(|| failed_precondition_error("configured stream missing"))?;
            let id = StreamId(index as u32);
            self.streams.insert(id, stream);
            stream_config.stream = Some(id);
        }
        debug!("Camera configured with {:?}", config.roles());
        self.config = Some(native);
        self.applied = Some(config.clone());
        Ok(config)
    }

    fn allocate(&mut self, stream: StreamId) -> Result<Vec<FrameBuffer>, CanonicalError> {
        let Some(native_stream) = self.streams.get(&stream) else {
            return Err(invalid_argument_error(
                format!("stream {:?} is not configured", stream).as_str()));
        };
        if self.by_stream.contains_key(&stream) {
            return Err(failed_precondition_error(
                format!("stream {:?} already has buffers", stream).as_str()));
        }
        let native_buffers = self.allocator.alloc(native_stream)
            .map_err(|e| resource_exhausted_error(
                format!("buffer allocation failed: {:?}", e).as_str()))?;
        let mut buffers = Vec::with_capacity(native_buffers.len());
        let mut ids = Vec::with_capacity(native_buffers.len());
        for native_buffer in native_buffers {
            let mapped = MemoryMappedFrameBuffer::new(native_buffer)
                .map_err(|e| resource_exhausted_error(
                    format!("mapping buffer failed: {:?}", e).as_str()))?;
            let length = mapped.data().iter().map(|plane| plane.len()).sum();
            self.next_buffer_id += 1;
            let id = BufferId(self.next_buffer_id);
            self.unattached.insert(id, mapped);
            ids.push(id);
            buffers.push(FrameBuffer{id, stream, length});
        }
        self.by_stream.insert(stream, ids);
        Ok(buffers)
    }

    fn free(&mut self, stream: StreamId) -> Result<(), CanonicalError> {
        if self.in_flight.values().any(|r| r.stream() == Some(stream)) {
            return Err(failed_precondition_error(
                format!("stream {:?} has queued requests", stream).as_str()));
        }
        for id in self.by_stream.remove(&stream).unwrap_or_default() {
            self.unattached.remove(&id);
            self.idle.remove(&id);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), CanonicalError> {
        if self.config.is_none() {
            return Err(failed_precondition_error("camera is not configured"));
        }
        if self.running {
            return Err(failed_precondition_error("pipeline already running"));
        }
        self.active.start(None).map_err(|e| io_error("start", e))?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CanonicalError> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.active.stop().map_err(|e| io_error("stop", e))
    }

    fn stamp_controls(native: &mut NativeRequest, controls: &ControlList) {
        let list = native.controls_mut();
        for (id, value) in controls.iter() {
            let result = match (id, value) {
                (ControlId::AeEnable, ControlValue::Bool(v)) =>
                    list.set(controls::AeEnable(*v)),
                (ControlId::ExposureTime, ControlValue::Int32(v)) =>
                    list.set(controls::ExposureTime(*v)),
                (ControlId::AnalogueGain, ControlValue::Float(v)) =>
                    list.set(controls::AnalogueGain(*v)),
                _ => {
                    warn!("Ignoring control {:?} = {:?}", id, value);
                    continue;
                },
            };
            if let Err(e) = result {
                warn!("Could not set {:?}: {:?}", id, e);
            }
        }
    }

    fn queue(&mut self, request: Request) -> Result<(), (Request, CanonicalError)> {
        if !self.running {
            return Err((request, failed_precondition_error("pipeline is not running")));
        }
        if request.status() != RequestStatus::Pending {
            return Err((request, failed_precondition_error("request was not reused")));
        }
        let Some(buffer) = request.buffer().cloned() else {
            return Err((request, invalid_argument_error("request has no buffer")));
        };
        let Some(stream) = self.streams.get(&buffer.stream).copied() else {
            return Err((request, invalid_argument_error("stream is not configured")));
        };
        if self.in_flight.contains_key(&buffer.id) {
            return Err((request, failed_precondition_error("buffer is already queued")));
        }
        let mut native = match self.idle.remove(&buffer.id) {
            Some(native) => native,
            None => {
                let Some(mapped) = self.unattached.remove(&buffer.id) else {
                    return Err((request, invalid_argument_error("buffer is not allocated")));
                };
                let Some(mut native) = self.active.create_request(Some(buffer.id.0)) else {
                    self.unattached.insert(buffer.id, mapped);
                    return Err((request, resource_exhausted_error(
                        "camera could not create a request")));
                };
                if let Err(e) = native.add_buffer(&stream, mapped) {
                    return Err((request, io_error("attaching buffer", e)));
                }
                native
            },
        };
        Self::stamp_controls(&mut native, request.controls());
        if let Err(e) = self.active.queue_request(native) {
            return Err((request, io_error("queue_request", e)));
        }
        self.in_flight.insert(buffer.id, request);
        Ok(())
    }

    fn complete(&mut self, mut native: NativeRequest) {
        let buffer_id = BufferId(native.cookie());
        let Some(mut request) = self.in_flight.remove(&buffer_id) else {
            debug!("Completion for unknown buffer {:?}", buffer_id);
            return;
        };
        let stream = request.stream().and_then(|s| self.streams.get(&s).copied());
        let mut metadata = None;
        let mut frame = None;
        let status = match native.status() {
            native_request::RequestStatus::Complete => RequestStatus::Complete,
            _ => RequestStatus::Cancelled,
        };
        if status == RequestStatus::Complete {
            if let Some(mapped) = stream.and_then(|s| native.buffer::<MappedBuffer>(&s)) {
                let planes = mapped.data();
                let used: Vec<usize> = mapped.metadata()
                    .map(|m| m.planes().into_iter().map(|p| p.bytes_used as usize).collect())
                    .unwrap_or_default();
                let mut data = Vec::new();
                for (index, plane) in planes.iter().enumerate() {
                    let len = used.get(index).copied().unwrap_or(plane.len()).min(plane.len());
                    data.extend_from_slice(&plane[..len]);
                }
                let timestamp = mapped.metadata()
                    .map(|m| Duration::from_nanos(m.timestamp())).unwrap_or_default();
                metadata = Some(FrameMetadata{sequence: native.sequence(),
                                              timestamp,
                                              bytes_used: data.len()});
                frame = Some(data);
            }
        }
        request.complete(status, metadata, frame);
        native.reuse(NativeReuseFlag::REUSE_BUFFERS);
        self.idle.insert(buffer_id, native);
        match &self.sink {
            Some(sink) => sink(request),
            None => debug!("No completion sink, dropping request {}", request.id()),
        }
    }
}
