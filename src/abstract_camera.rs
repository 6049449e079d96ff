use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error};

/// Purpose of a stream. The role is also carried by every request as its
/// cookie, so a completion can be dispatched without asking the device which
/// stream it came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamRole {
    Viewfinder,
    StillCapture,
}

impl StreamRole {
    pub fn cookie(&self) -> u64 {
        match self {
            StreamRole::Viewfinder => 1,
            StreamRole::StillCapture => 2,
        }
    }

    pub fn from_cookie(cookie: u64) -> Option<StreamRole> {
        match cookie {
            1 => Some(StreamRole::Viewfinder),
            2 => Some(StreamRole::StillCapture),
            _ => None,
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

/// Pixel layouts we know how to consume. Names follow the DRM fourcc
/// convention, so multi-byte formats are little-endian: XRGB8888 is stored
/// in memory as B, G, R, X and RGB888 as B, G, R.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Xrgb8888,
    Xbgr8888,
    Rgb888,
    Bgr888,
    /// Planar 4:2:0, Y plane followed by U then V at half resolution.
    Yuv420,
}

impl PixelFormat {
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Xrgb8888 => *b"XR24",
            PixelFormat::Xbgr8888 => *b"XB24",
            PixelFormat::Rgb888 => *b"RG24",
            PixelFormat::Bgr888 => *b"BG24",
            PixelFormat::Yuv420 => *b"YU12",
        }
    }

    pub fn from_fourcc(fourcc: [u8; 4]) -> Option<PixelFormat> {
        match &fourcc {
            b"XR24" => Some(PixelFormat::Xrgb8888),
            b"XB24" => Some(PixelFormat::Xbgr8888),
            b"RG24" => Some(PixelFormat::Rgb888),
            b"BG24" => Some(PixelFormat::Bgr888),
            b"YU12" => Some(PixelFormat::Yuv420),
            _ => None,
        }
    }

    /// Bytes per pixel of the first plane.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Xrgb8888 | PixelFormat::Xbgr8888 => 4,
            PixelFormat::Rgb888 | PixelFormat::Bgr888 => 3,
            PixelFormat::Yuv420 => 1,
        }
    }

    /// Minimum bytes needed for a frame with the given row stride.
    pub fn frame_size(&self, size: Size, stride: usize) -> usize {
        let rows = size.height as usize;
        match self {
            PixelFormat::Yuv420 => {
                let chroma_stride = stride.div_ceil(2);
                let chroma_rows = rows.div_ceil(2);
                stride * rows + 2 * chroma_stride * chroma_rows
            },
            _ => stride * rows,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.fourcc()))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Size {
        Size{width, height}
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Identifies a stream of the applied configuration. Assigned by the device
/// when a configuration is applied.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

pub type RequestId = u64;

/// Parameters of one stream. The caller may edit `pixel_format` and `size`
/// before validation; `stride`, `frame_size` and `buffer_count` are filled in
/// by the device and must be re-read after validation.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfiguration {
    pub role: StreamRole,
    pub pixel_format: PixelFormat,
    pub size: Size,
    pub stride: usize,
    pub frame_size: usize,
    pub buffer_count: usize,

    // Set once the configuration has been applied.
    pub stream: Option<StreamId>,
}

impl fmt::Display for StreamConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{} ({}, stride {}, {} buffers)",
               self.size, self.pixel_format, self.role, self.stride,
               self.buffer_count)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigurationStatus {
    Valid,
    /// Some values were changed to what the hardware supports.
    Adjusted,
    Invalid,
}

/// A set of one or more stream configurations to be applied together.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CameraConfiguration {
    pub streams: Vec<StreamConfiguration>,
}

impl CameraConfiguration {
    pub fn get(&self, role: StreamRole) -> Option<&StreamConfiguration> {
        self.streams.iter().find(|s| s.role == role)
    }

    pub fn get_mut(&mut self, role: StreamRole) -> Option<&mut StreamConfiguration> {
        self.streams.iter_mut().find(|s| s.role == role)
    }

    pub fn roles(&self) -> Vec<StreamRole> {
        self.streams.iter().map(|s| s.role).collect()
    }
}

/// Hardware-shareable memory backing one frame of one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameBuffer {
    pub id: BufferId,
    pub stream: StreamId,
    pub length: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlId {
    AeEnable,
    /// Microseconds.
    ExposureTime,
    /// Multiplier.
    AnalogueGain,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ControlValue {
    Bool(bool),
    Int32(i32),
    Float(f32),
}

/// Per-request control overrides.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlList(BTreeMap<ControlId, ControlValue>);

impl ControlList {
    pub fn new() -> Self {
        ControlList(BTreeMap::new())
    }

    pub fn set(&mut self, id: ControlId, value: ControlValue) {
        self.0.insert(id, value);
    }

    pub fn get(&self, id: ControlId) -> Option<ControlValue> {
        self.0.get(&id).copied()
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ControlId, &ControlValue)> {
        self.0.iter()
    }

    pub fn exposure_time(&self) -> Option<Duration> {
        match self.get(ControlId::ExposureTime) {
            Some(ControlValue::Int32(us)) if us >= 0 =>
                Some(Duration::from_micros(us as u64)),
            _ => None,
        }
    }

    pub fn analogue_gain(&self) -> Option<f32> {
        match self.get(ControlId::AnalogueGain) {
            Some(ControlValue::Float(g)) => Some(g),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Complete,
    /// The pipeline was stopped while the request was queued.
    Cancelled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReuseFlag {
    Default,
    ReuseBuffers,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame counter of the stream; restarts from 0 each time the pipeline
    /// is started.
    pub sequence: u32,
    pub timestamp: Duration,
    pub bytes_used: usize,
}

/// A unit of work submitted to the pipeline. A request is an owned value:
/// queueing moves it into the device and completion hands it back through
/// the `CompletionSink`.
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    cookie: u64,
    buffer: Option<FrameBuffer>,
    controls: ControlList,
    status: RequestStatus,
    metadata: Option<FrameMetadata>,
    frame: Option<Vec<u8>>,
}

impl Request {
    /// For device implementations.
    pub fn new(id: RequestId, cookie: u64) -> Request {
        Request{id,
                cookie,
                buffer: None,
                controls: ControlList::new(),
                status: RequestStatus::Pending,
                metadata: None,
                frame: None}
    }

    pub fn id(&self) -> RequestId { self.id }
    pub fn cookie(&self) -> u64 { self.cookie }
    pub fn status(&self) -> RequestStatus { self.status }
    pub fn buffer(&self) -> Option<&FrameBuffer> { self.buffer.as_ref() }
    pub fn stream(&self) -> Option<StreamId> { self.buffer.as_ref().map(|b| b.stream) }
    pub fn controls(&self) -> &ControlList { &self.controls }
    pub fn controls_mut(&mut self) -> &mut ControlList { &mut self.controls }
    pub fn metadata(&self) -> Option<&FrameMetadata> { self.metadata.as_ref() }

    /// Pixel data of the completed frame. Only valid until the request is
    /// reused.
    pub fn frame_data(&self) -> Option<&[u8]> { self.frame.as_deref() }

    /// Binds `buffer` to this request. Exactly one buffer per request.
    pub fn add_buffer(&mut self, stream: StreamId, buffer: &FrameBuffer)
                      -> Result<(), CanonicalError> {
        if buffer.stream != stream {
            return Err(invalid_argument_error(
                format!("buffer {:?} belongs to stream {:?}, not {:?}",
                        buffer.id, buffer.stream, stream).as_str()));
        }
        if let Some(existing) = &self.buffer {
            return Err(failed_precondition_error(
                format!("request {} already holds buffer {:?}",
                        self.id, existing.id).as_str()));
        }
        self.buffer = Some(buffer.clone());
        Ok(())
    }

    /// Records the outcome of a pipeline cycle. For device implementations.
    pub fn complete(&mut self, status: RequestStatus,
                    metadata: Option<FrameMetadata>, frame: Option<Vec<u8>>) {
        self.status = status;
        self.metadata = metadata;
        self.frame = frame;
    }

    /// Makes a completed request queueable again. Controls are always
    /// cleared; the buffer binding survives only with `ReuseBuffers`.
    pub fn reuse(&mut self, flag: ReuseFlag) {
        self.status = RequestStatus::Pending;
        self.metadata = None;
        self.frame = None;
        self.controls.clear();
        if flag != ReuseFlag::ReuseBuffers {
            self.buffer = None;
        }
    }

    /// A pending request with the same identity, buffer binding and
    /// controls. For device implementations that lose a request they were
    /// handed and must return one to the caller's pool.
    pub fn replica(&self) -> Request {
        Request{id: self.id,
                cookie: self.cookie,
                buffer: self.buffer.clone(),
                controls: self.controls.clone(),
                status: RequestStatus::Pending,
                metadata: None,
                frame: None}
    }
}

/// Receives completed (or cancelled) requests. Devices may invoke it from
/// any thread.
pub type CompletionSink = Arc<dyn Fn(Request) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct EnumeratedCameraInfo {
    pub model: String,
    pub width: u32,
    pub height: u32,
}

/// Allocates frame buffers for the streams of the applied configuration.
pub trait FrameBufferAllocator: Send {
    /// Allocates the device's buffer count for `stream`, returning how many
    /// were allocated. Fails if `stream` already has buffers.
    fn allocate(&mut self, stream: StreamId) -> Result<usize, CanonicalError>;

    fn buffers(&self, stream: StreamId) -> &[FrameBuffer];

    /// Releases all buffers of `stream`. Fails if any request referencing
    /// them is still queued.
    fn free(&mut self, stream: StreamId) -> Result<(), CanonicalError>;
}

/// AbstractCamera models a camera device in the way the camera middleware
/// exposes it: negotiate a configuration, allocate buffers, create requests,
/// start the pipeline and feed it requests. Completed requests come back
/// asynchronously through the sink registered with set_completion_sink(),
/// possibly on a device-owned thread.
///
/// Methods take `&self`; the handle is shared (`Arc`) between whoever opened
/// the camera and the session driving it.
pub trait AbstractCamera: Send + Sync {
    /// Stable identifier of the device, e.g. its sysfs path.
    fn id(&self) -> String;

    /// Returns a string identifying what kind of camera this is.
    fn model(&self) -> String;

    /// (width, height) of the sensor's pixel array.
    fn dimensions(&self) -> (u32, u32);

    /// Returns the device's default configuration for `roles`, one stream
    /// per role in the given order. Fails with InvalidArgument if the device
    /// cannot serve that combination of roles.
    fn generate_configuration(&self, roles: &[StreamRole])
                              -> Result<CameraConfiguration, CanonicalError>;

    /// Adjusts `config` in place to values the hardware supports.
    fn validate(&self, config: &mut CameraConfiguration) -> ConfigurationStatus;

    /// Applies a validated configuration and assigns a StreamId to each of
    /// its streams. Fails with FailedPrecondition while the pipeline is
    /// running.
    fn configure(&self, config: &mut CameraConfiguration) -> Result<(), CanonicalError>;

    fn create_allocator(&self) -> Box<dyn FrameBufferAllocator>;

    /// Returns None if the device cannot create another request.
    fn create_request(&self, cookie: u64) -> Option<Request>;

    fn set_completion_sink(&self, sink: CompletionSink);

    fn start(&self) -> Result<(), CanonicalError>;

    /// Stops the pipeline. Every request still queued is handed back to the
    /// completion sink with RequestStatus::Cancelled.
    fn stop(&self) -> Result<(), CanonicalError>;

    fn is_running(&self) -> bool;

    /// On failure the request is handed back together with the error.
    fn queue_request(&self, request: Request) -> Result<(), (Request, CanonicalError)>;

    /// Gives up exclusive use of the device.
    fn release(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(id: u64, stream: u32) -> FrameBuffer {
        FrameBuffer{id: BufferId(id), stream: StreamId(stream), length: 16}
    }

    #[test]
    fn test_cookie_maps_back_to_role() {
        for role in [StreamRole::Viewfinder, StreamRole::StillCapture] {
            assert_eq!(StreamRole::from_cookie(role.cookie()), Some(role));
        }
        assert_eq!(StreamRole::from_cookie(0), None);
    }

    #[test]
    fn test_request_takes_one_buffer() {
        let mut request = Request::new(7, StreamRole::Viewfinder.cookie());
        request.add_buffer(StreamId(0), &buffer(1, 0)).unwrap();
        assert!(request.add_buffer(StreamId(0), &buffer(2, 0)).is_err());
        assert_eq!(request.buffer().unwrap().id, BufferId(1));
    }

    #[test]
    fn test_request_rejects_foreign_buffer() {
        let mut request = Request::new(7, StreamRole::Viewfinder.cookie());
        assert!(request.add_buffer(StreamId(0), &buffer(1, 1)).is_err());
        assert!(request.buffer().is_none());
    }

    #[test]
    fn test_reuse_keeps_buffer_and_clears_controls() {
        let mut request = Request::new(7, StreamRole::StillCapture.cookie());
        request.add_buffer(StreamId(1), &buffer(3, 1)).unwrap();
        request.controls_mut().set(ControlId::ExposureTime, ControlValue::Int32(5000));
        request.complete(RequestStatus::Complete,
                         Some(FrameMetadata{sequence: 4,
                                            timestamp: Duration::from_millis(10),
                                            bytes_used: 16}),
                         Some(vec![0; 16]));
        request.reuse(ReuseFlag::ReuseBuffers);
        assert_eq!(request.status(), RequestStatus::Pending);
        assert!(request.metadata().is_none());
        assert!(request.frame_data().is_none());
        assert!(request.controls().is_empty());
        assert_eq!(request.buffer().unwrap().id, BufferId(3));

        request.reuse(ReuseFlag::Default);
        assert!(request.buffer().is_none());
    }

    #[test]
    fn test_replica_is_pending_with_same_binding() {
        let mut request = Request::new(9, StreamRole::StillCapture.cookie());
        request.add_buffer(StreamId(1), &buffer(4, 1)).unwrap();
        request.controls_mut().set(ControlId::ExposureTime, ControlValue::Int32(2000));
        request.complete(RequestStatus::Complete, None, Some(vec![1, 2, 3]));

        let replica = request.replica();
        assert_eq!(replica.id(), 9);
        assert_eq!(replica.cookie(), StreamRole::StillCapture.cookie());
        assert_eq!(replica.status(), RequestStatus::Pending);
        assert_eq!(replica.buffer().unwrap().id, BufferId(4));
        assert_eq!(replica.controls(), request.controls());
        assert!(replica.frame_data().is_none());
    }

    #[test]
    fn test_yuv420_frame_size() {
        let size = Size::new(4, 3);
        assert_eq!(PixelFormat::Yuv420.frame_size(size, 4), 12 + 2 * 2 * 2);
        assert_eq!(PixelFormat::Xrgb8888.frame_size(size, 16), 48);
    }

    #[test]
    fn test_fourcc_round_trip() {
        assert_eq!(PixelFormat::from_fourcc(*b"XR24"), Some(PixelFormat::Xrgb8888));
        assert_eq!(PixelFormat::from_fourcc(*b"NV12"), None);
        assert_eq!(PixelFormat::Yuv420.to_string(), "YU12");
    }
}
