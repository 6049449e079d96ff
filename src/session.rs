use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use canonical_error::failed_precondition_error;
use log::{debug, error, info, warn};

use crate::abstract_camera::{AbstractCamera, CompletionSink, Request,
                             RequestStatus, ReuseFlag, StreamConfiguration,
                             StreamId, StreamRole};
use crate::buffer_pool::BufferPool;
use crate::error::SessionError;
use crate::frame_consumer::{CompletedFrame, FrameConsumer};
use crate::request_factory::{RequestFactory, RequestPool, StillExposure};
use crate::stream_config::{StreamConfigurationManager, StreamSettings};

/// How the viewfinder and still-capture streams share the camera.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamStrategy {
    /// One configuration with only the stream currently needed. A still
    /// capture stops the pipeline, reconfigures for stills, captures, then
    /// reconfigures back to the viewfinder.
    SingleActiveStream,
    /// One configuration holding both streams; a still capture is just more
    /// requests and the viewfinder keeps running.
    DualConcurrentStream,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Previewing,
    Capturing,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub strategy: StreamStrategy,
    pub viewfinder: StreamSettings,
    pub still: StreamSettings,
    pub still_exposure: StillExposure,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions{
            strategy: StreamStrategy::DualConcurrentStream,
            viewfinder: StreamSettings{pixel_format: None,
                                       size: Some(crate::abstract_camera::Size::new(128, 128))},
            still: StreamSettings::default(),
            still_exposure: StillExposure::default(),
        }
    }
}

/// Continues a stream's frame numbering across pipeline restarts, which
/// reset the device's metadata sequence to 0.
#[derive(Copy, Clone, Debug, Default)]
struct FrameNumbering {
    base: u32,
    next: u32,
}

impl FrameNumbering {
    fn number(&mut self, device_sequence: u32) -> u32 {
        let number = self.base.wrapping_add(device_sequence);
        self.next = self.next.max(number.wrapping_add(1));
        number
    }

    fn restart(&mut self) {
        self.base = self.next;
    }
}

/// Drives one camera: negotiates streams, owns buffers and request pools,
/// keeps the viewfinder fed and runs still captures on demand.
///
/// All methods are meant to be called from one thread. The device hands
/// completed requests to the CompletionSink given at construction; that sink
/// is expected to forward them to whatever thread owns the session, which
/// then passes them to process_completed().
pub struct CameraSession {
    // Held until teardown; None afterwards.
    camera: Option<Arc<dyn AbstractCamera>>,
    buffers: Option<BufferPool>,

    streams: StreamConfigurationManager,
    factory: RequestFactory,
    pools: BTreeMap<StreamRole, RequestPool>,
    numbering: BTreeMap<StreamRole, FrameNumbering>,

    options: SessionOptions,
    state: SessionState,
    completion_sink: CompletionSink,
}

impl CameraSession {
    pub fn new(camera: Arc<dyn AbstractCamera>, options: SessionOptions,
               completion_sink: CompletionSink) -> Self {
        let allocator = camera.create_allocator();
        CameraSession{camera: Some(camera),
                      buffers: Some(BufferPool::new(allocator)),
                      streams: StreamConfigurationManager::new(),
                      factory: RequestFactory::new(options.still_exposure),
                      pools: BTreeMap::new(),
                      numbering: BTreeMap::new(),
                      options,
                      state: SessionState::Idle,
                      completion_sink}
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn strategy(&self) -> StreamStrategy {
        self.options.strategy
    }

    pub fn pool(&self, role: StreamRole) -> Option<&RequestPool> {
        self.pools.get(&role)
    }

    pub fn stream_config(&self, role: StreamRole) -> Option<&StreamConfiguration> {
        self.streams.stream_config(role)
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn invalid_state(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState{operation, state: self.state.to_string()}
    }

    fn camera(&self, operation: &'static str) -> Result<Arc<dyn AbstractCamera>, SessionError> {
        self.camera.clone().ok_or_else(|| self.invalid_state(operation))
    }

    fn settings(&self, role: StreamRole) -> StreamSettings {
        match role {
            StreamRole::Viewfinder => self.options.viewfinder,
            StreamRole::StillCapture => self.options.still,
        }
    }

    /// Idle -> Configured -> Previewing. Any failure is returned as is; the
    /// session makes no attempt to retry.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(self.invalid_state("start"));
        }
        let camera = self.camera("start")?;
        let roles: &[StreamRole] = match self.options.strategy {
            StreamStrategy::DualConcurrentStream =>
                &[StreamRole::Viewfinder, StreamRole::StillCapture],
            StreamStrategy::SingleActiveStream => &[StreamRole::Viewfinder],
        };
        self.configure_streams(camera.as_ref(), roles)?;
        self.set_state(SessionState::Configured);
        for role in roles {
            self.ensure_pool(camera.as_ref(), *role)?;
        }
        camera.set_completion_sink(self.completion_sink.clone());
        self.start_pipeline(camera.as_ref())?;
        let queued = self.queue_idle(camera.as_ref(), StreamRole::Viewfinder)?;
        info!("Preview started with {} viewfinder requests", queued);
        self.set_state(SessionState::Previewing);
        Ok(())
    }

    /// Queues the still-capture requests. In the dual-stream strategy the
    /// viewfinder requests stay queued; in the single-stream strategy the
    /// pipeline is stopped and reconfigured for stills first.
    pub fn request_still_frame(&mut self) -> Result<usize, SessionError> {
        if self.state != SessionState::Previewing {
            return Err(self.invalid_state("request_still_frame"));
        }
        let camera = self.camera("request_still_frame")?;
        if self.options.strategy == StreamStrategy::SingleActiveStream {
            self.switch_to(camera.as_ref(), StreamRole::StillCapture)?;
        }
        let queued = self.queue_idle(camera.as_ref(), StreamRole::StillCapture)?;
        if queued == 0 {
            warn!("No still requests available to queue");
            if self.options.strategy == StreamStrategy::SingleActiveStream {
                self.start_preview()?;
            }
            return Ok(0);
        }
        info!("Queued {} still requests", queued);
        self.set_state(SessionState::Capturing);
        Ok(queued)
    }

    /// Resumes the viewfinder feed after a still capture. In the dual-stream
    /// strategy this only re-queues idle viewfinder requests.
    pub fn start_preview(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Capturing | SessionState::Configured |
            SessionState::Previewing => (),
            _ => return Err(self.invalid_state("start_preview")),
        }
        let camera = self.camera("start_preview")?;
        if self.options.strategy == StreamStrategy::SingleActiveStream {
            self.switch_to(camera.as_ref(), StreamRole::Viewfinder)?;
        }
        let queued = self.queue_idle(camera.as_ref(), StreamRole::Viewfinder)?;
        debug!("Preview resumed, {} viewfinder requests re-queued", queued);
        self.set_state(SessionState::Previewing);
        Ok(())
    }

    /// Hands a request straight to the pipeline. The request must belong to
    /// one of this session's pools. On failure the request goes back to its
    /// pool as idle.
    pub fn queue_request(&mut self, request: Request) -> Result<(), SessionError> {
        let Some(camera) = self.camera.clone() else {
            return Err(self.invalid_state("queue_request"));
        };
        let role = StreamRole::from_cookie(request.cookie());
        let Some(pool) = role.and_then(|r| self.pools.get_mut(&r)) else {
            return Err(SessionError::QueueFailure{
                request: request.id(),
                cause: failed_precondition_error("request does not belong to this session")});
        };
        if !pool.is_lent(request.id()) {
            return Err(SessionError::QueueFailure{
                request: request.id(),
                cause: failed_precondition_error("request is not lent from its pool")});
        }
        match camera.queue_request(request) {
            Ok(()) => Ok(()),
            Err((request, cause)) => {
                let id = request.id();
                let _ = pool.park(request);
                Err(SessionError::QueueFailure{request: id, cause})
            },
        }
    }

    /// Runs one completion on the session's thread: skips cancelled
    /// requests, lets `consumer` look at the frame, then re-queues viewfinder
    /// requests or, once every still request is back, resumes the preview.
    pub fn process_completed(&mut self, mut request: Request,
                             consumer: &mut dyn FrameConsumer)
                             -> Result<(), SessionError> {
        let Some(role) = StreamRole::from_cookie(request.cookie()) else {
            warn!("Dropping request {} with unknown cookie {}", request.id(), request.cookie());
            return Ok(());
        };
        if self.state == SessionState::Stopped {
            debug!("Dropping {} request {} after teardown", role, request.id());
            return Ok(());
        }
        let current = self.pools.get(&role).is_some_and(|p| p.is_lent(request.id()));
        if !current {
            // Left over from a configuration that has since been replaced.
            debug!("Dropping stale {} request {}", role, request.id());
            return Ok(());
        }

        if request.status() == RequestStatus::Cancelled {
            info!("{} request {} cancelled", role, request.id());
            if let Some(pool) = self.pools.get_mut(&role) {
                let _ = pool.retire(request);
            }
            return self.after_still_returned(role);
        }

        match (self.streams.stream_config(role), request.metadata(), request.frame_data()) {
            (Some(config), Some(metadata), Some(data)) => {
                let sequence = self.numbering.entry(role).or_default()
                    .number(metadata.sequence);
                consumer.consume(CompletedFrame{role, sequence, config, metadata, data});
            },
            _ => warn!("{} request {} completed without frame data", role, request.id()),
        }

        request.reuse(ReuseFlag::ReuseBuffers);
        self.factory.arm(&mut request, role);
        match role {
            StreamRole::Viewfinder => {
                let feeding = matches!(self.state, SessionState::Previewing |
                                                   SessionState::Capturing);
                let serving = self.streams.stream_config(StreamRole::Viewfinder).is_some();
                if feeding && serving {
                    if let Err(e) = self.queue_request(request) {
                        error!("Could not re-queue viewfinder request: {}", e);
                    }
                } else if let Some(pool) = self.pools.get_mut(&role) {
                    let _ = pool.park(request);
                }
                Ok(())
            },
            StreamRole::StillCapture => {
                if let Some(pool) = self.pools.get_mut(&role) {
                    let _ = pool.park(request);
                }
                self.after_still_returned(role)
            },
        }
    }

    fn after_still_returned(&mut self, role: StreamRole) -> Result<(), SessionError> {
        if role != StreamRole::StillCapture || self.state != SessionState::Capturing {
            return Ok(());
        }
        let outstanding = self.pools.get(&role).map(RequestPool::lent_count).unwrap_or(0);
        if outstanding > 0 {
            return Ok(());
        }
        info!("Still capture complete");
        self.start_preview()
    }

    /// Stops the pipeline and releases everything in reverse order of
    /// construction: buffers, requests, configuration, allocator, camera.
    /// Safe to call more than once.
    pub fn teardown(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }
        let mut result = Ok(());
        if let Some(camera) = self.camera.clone() {
            result = self.release_streams(camera.as_ref());
        }
        self.streams.release();
        self.buffers = None;
        if let Some(camera) = self.camera.take() {
            camera.release();
        }
        self.set_state(SessionState::Stopped);
        result
    }

    /// Stops the pipeline, then frees the buffers of every allocated stream
    /// (including streams whose requests were never built) and drops all
    /// request pools. Returns the first error but always does every step.
    fn release_streams(&mut self, camera: &dyn AbstractCamera) -> Result<(), SessionError> {
        let mut first_error = None;
        if camera.is_running() {
            if let Err(cause) = camera.stop() {
                first_error.get_or_insert(SessionError::PipelineFailure{action: "stop", cause});
            }
        }
        if let Some(buffers) = &mut self.buffers {
            for stream in buffers.allocated_streams() {
                let role = self.streams.active()
                    .and_then(|c| c.streams.iter().find(|s| s.stream == Some(stream)))
                    .map(|s| s.role)
                    .unwrap_or(StreamRole::Viewfinder);
                if let Err(e) = buffers.free(stream, role) {
                    first_error.get_or_insert(e);
                }
            }
        }
        let released: usize = self.pools.values_mut().map(RequestPool::release).sum();
        self.pools.clear();
        debug!("Released {} requests", released);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn configure_streams(&mut self, camera: &dyn AbstractCamera, roles: &[StreamRole])
                         -> Result<(), SessionError> {
        let mut config = self.streams.generate(camera, roles)?;
        for role in roles {
            StreamConfigurationManager::customize(&mut config, *role, &self.settings(*role));
        }
        self.streams.validate(camera, &mut config)?;
        self.streams.reconfigure(camera, config)?;
        Ok(())
    }

    /// Allocates buffers and builds the request pool for `role`, unless the
    /// role already has a pool for the applied configuration.
    fn ensure_pool(&mut self, camera: &dyn AbstractCamera, role: StreamRole)
                   -> Result<(), SessionError> {
        let stream = self.applied_stream(role)?;
        if let Some(pool) = self.pools.get(&role) {
            if pool.stream() == stream && !pool.is_empty() {
                debug!("Reusing {} pool of {} requests", role, pool.len());
                return Ok(());
            }
        }
        let state = self.state;
        let buffers = self.buffers.as_mut().ok_or_else(|| SessionError::InvalidState{
            operation: "allocate", state: state.to_string()})?;
        buffers.ensure_allocated(stream, role)?;
        let pool = self.factory.build_requests(camera, stream, buffers.buffers(stream), role)?;
        self.pools.insert(role, pool);
        Ok(())
    }

    fn applied_stream(&self, role: StreamRole) -> Result<StreamId, SessionError> {
        self.streams.stream_config(role)
            .and_then(|c| c.stream)
            .ok_or_else(|| SessionError::ConfigurationFailure{
                cause: failed_precondition_error(
                    format!("no {} stream in the applied configuration", role).as_str())})
    }

    fn start_pipeline(&mut self, camera: &dyn AbstractCamera) -> Result<(), SessionError> {
        camera.start().map_err(|cause| SessionError::PipelineFailure{action: "start", cause})?;
        for numbering in self.numbering.values_mut() {
            numbering.restart();
        }
        Ok(())
    }

    fn queue_idle(&mut self, camera: &dyn AbstractCamera, role: StreamRole)
                  -> Result<usize, SessionError> {
        let Some(pool) = self.pools.get_mut(&role) else {
            return Ok(0);
        };
        let mut queued = 0;
        while let Some(request) = pool.lend_idle() {
            if let Err((request, cause)) = camera.queue_request(request) {
                let id = request.id();
                let _ = pool.park(request);
                return Err(SessionError::QueueFailure{request: id, cause});
            }
            queued += 1;
        }
        Ok(queued)
    }

    /// Single-stream strategy: make `role` the one configured stream. The
    /// outgoing role's pool is released, since both roles share the same
    /// hardware stream. If the switch fails the session falls back to a
    /// running viewfinder, or is torn down when even that fails; the error
    /// of the switch is returned either way.
    fn switch_to(&mut self, camera: &dyn AbstractCamera, role: StreamRole)
                 -> Result<(), SessionError> {
        if self.streams.serves(&[role]) && camera.is_running() {
            return Ok(());
        }
        let result = self.try_switch(camera, role);
        if let Err(e) = &result {
            error!("Switching to the {} stream failed: {}", role, e);
            self.recover(camera, role);
        }
        result
    }

    fn try_switch(&mut self, camera: &dyn AbstractCamera, role: StreamRole)
                  -> Result<(), SessionError> {
        if camera.is_running() {
            camera.stop().map_err(|cause| SessionError::PipelineFailure{
                action: "stop", cause})?;
        }
        let outgoing: Vec<StreamRole> =
            self.pools.keys().copied().filter(|r| *r != role).collect();
        for other in outgoing {
            if let Some(mut pool) = self.pools.remove(&other) {
                if let Some(buffers) = &mut self.buffers {
                    buffers.free(pool.stream(), other)?;
                }
                let released = pool.release();
                debug!("Released {} {} requests", released, other);
            }
        }
        self.configure_streams(camera, &[role])?;
        self.ensure_pool(camera, role)?;
        self.start_pipeline(camera)
    }

    fn recover(&mut self, camera: &dyn AbstractCamera, failed: StreamRole) {
        if let Err(e) = self.release_streams(camera) {
            warn!("Releasing streams after a failed switch: {}", e);
        }
        if failed != StreamRole::Viewfinder {
            match self.resume_viewfinder(camera) {
                Ok(queued) => {
                    info!("Viewfinder restored with {} requests", queued);
                    self.set_state(SessionState::Previewing);
                    return;
                },
                Err(e) => error!("Could not restore the viewfinder: {}", e),
            }
        }
        if let Err(e) = self.teardown() {
            error!("Error tearing down camera session: {}", e);
        }
    }

    fn resume_viewfinder(&mut self, camera: &dyn AbstractCamera)
                         -> Result<usize, SessionError> {
        if let Err(e) = self.configure_streams(camera, &[StreamRole::Viewfinder])
            .and_then(|()| self.ensure_pool(camera, StreamRole::Viewfinder))
            .and_then(|()| self.start_pipeline(camera))
        {
            let _ = self.release_streams(camera);
            return Err(e);
        }
        self.queue_idle(camera, StreamRole::Viewfinder)
    }
}

/// Tears down on drop if the owner did not.
impl Drop for CameraSession {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            error!("Error tearing down camera session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstract_camera::Size;
    use crate::image_camera::{ImageCamera, ImageCameraOptions};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        // (role, session sequence, device sequence, size)
        frames: Vec<(StreamRole, u32, u32, Size)>,
    }

    impl FrameConsumer for Recorder {
        fn consume(&mut self, frame: CompletedFrame<'_>) {
            self.frames.push((frame.role, frame.sequence, frame.metadata.sequence,
                              frame.config.size));
        }
    }

    /// Collects completions so tests can feed them back by hand, the way the
    /// event loop would.
    fn collecting_sink() -> (CompletionSink, Arc<Mutex<Vec<Request>>>) {
        let completed = Arc::new(Mutex::new(Vec::new()));
        let store = completed.clone();
        let sink: CompletionSink = Arc::new(move |request: Request| {
            store.lock().unwrap().push(request);
        });
        (sink, completed)
    }

    fn drain(session: &mut CameraSession, completed: &Arc<Mutex<Vec<Request>>>,
             consumer: &mut dyn FrameConsumer) {
        loop {
            let batch: Vec<Request> = completed.lock().unwrap().drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for request in batch {
                session.process_completed(request, consumer).unwrap();
            }
        }
    }

    fn session_with(strategy: StreamStrategy, options: ImageCameraOptions)
                    -> (Arc<ImageCamera>, CameraSession, Arc<Mutex<Vec<Request>>>) {
        let cam = Arc::new(ImageCamera::with_options(ImageCamera::star_field(320, 240),
                                                     options));
        let (sink, completed) = collecting_sink();
        let session = CameraSession::new(
            cam.clone(),
            SessionOptions{strategy, ..Default::default()},
            sink);
        (cam, session, completed)
    }

    fn stream_of(session: &CameraSession, role: StreamRole) -> StreamId {
        session.pool(role).unwrap().stream()
    }

    #[test]
    fn test_start_queues_viewfinder_only() {
        let (cam, mut session, _) = session_with(StreamStrategy::DualConcurrentStream,
                                                 ImageCameraOptions::default());
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Previewing);
        assert!(cam.is_running());
        assert_eq!(cam.queued_for(stream_of(&session, StreamRole::Viewfinder)), 4);
        assert_eq!(cam.queued_for(stream_of(&session, StreamRole::StillCapture)), 0);
        assert_eq!(session.pool(StreamRole::StillCapture).unwrap().idle_count(), 4);
        // Viewfinder size came from the options, clamped by validation.
        assert_eq!(session.stream_config(StreamRole::Viewfinder).unwrap().size,
                   Size::new(128, 128));
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (_cam, mut session, _) = session_with(StreamStrategy::DualConcurrentStream,
                                                  ImageCameraOptions::default());
        session.start().unwrap();
        let err = session.start().unwrap_err();
        assert!(matches!(err, SessionError::InvalidState{..}));
    }

    #[test]
    fn test_start_reports_failing_stage() {
        let (_cam, mut session, _) = session_with(
            StreamStrategy::DualConcurrentStream,
            ImageCameraOptions{max_streams: 1, ..Default::default()});
        let err = session.start().unwrap_err();
        assert_eq!(err.stage(), crate::error::SetupStage::Configure);

        let (_cam, mut session, _) = session_with(
            StreamStrategy::DualConcurrentStream,
            ImageCameraOptions{buffer_budget: Some(6), ..Default::default()});
        let err = session.start().unwrap_err();
        assert!(matches!(err, SessionError::AllocationFailure{
            role: StreamRole::StillCapture, ..}));

        let (_cam, mut session, _) = session_with(
            StreamStrategy::DualConcurrentStream,
            ImageCameraOptions{request_limit: Some(5), ..Default::default()});
        let err = session.start().unwrap_err();
        assert_eq!(err.stage(), crate::error::SetupStage::CreateRequest);
    }

    #[test]
    fn test_viewfinder_requeued_once_per_completion() {
        let (cam, mut session, completed) = session_with(
            StreamStrategy::DualConcurrentStream, ImageCameraOptions::default());
        session.start().unwrap();
        let mut recorder = Recorder::default();
        for _ in 0..3 {
            assert_eq!(cam.complete_all(), 4);
            drain(&mut session, &completed, &mut recorder);
        }
        let vf = stream_of(&session, StreamRole::Viewfinder);
        assert_eq!(cam.queued_for(vf), 4);
        for id in session.pool(StreamRole::Viewfinder).unwrap().request_ids() {
            // Initial queue plus one re-queue per completion.
            assert_eq!(cam.queue_count(id), 4);
        }
        assert_eq!(recorder.frames.len(), 12);
        assert!(recorder.frames.iter().all(|f| f.0 == StreamRole::Viewfinder));
        assert_eq!(cam.requests_created(), 8);
    }

    #[test]
    fn test_dual_stream_still_capture() {
        let (cam, mut session, completed) = session_with(
            StreamStrategy::DualConcurrentStream, ImageCameraOptions::default());
        session.start().unwrap();
        let vf = stream_of(&session, StreamRole::Viewfinder);
        let still = stream_of(&session, StreamRole::StillCapture);

        assert_eq!(session.request_still_frame().unwrap(), 4);
        assert_eq!(session.state(), SessionState::Capturing);
        assert_eq!(cam.queued_for(vf), 4);
        assert_eq!(cam.queued_for(still), 4);

        // A second press while capturing is refused.
        assert!(session.request_still_frame().is_err());

        let mut recorder = Recorder::default();
        cam.complete_all();
        drain(&mut session, &completed, &mut recorder);
        assert_eq!(session.state(), SessionState::Previewing);
        let stills: Vec<u32> = recorder.frames.iter()
            .filter(|f| f.0 == StreamRole::StillCapture).map(|f| f.1).collect();
        assert_eq!(stills, vec![0, 1, 2, 3]);
        // Without a pipeline restart the numbers are the device's own.
        assert!(recorder.frames.iter().all(|f| f.1 == f.2));
        assert_eq!(cam.queued_for(vf), 4);
        assert_eq!(cam.queued_for(still), 0);

        // Same requests again, no new allocation.
        let ids_before = session.pool(StreamRole::StillCapture).unwrap().request_ids();
        assert_eq!(session.request_still_frame().unwrap(), 4);
        assert_eq!(session.pool(StreamRole::StillCapture).unwrap().request_ids(), ids_before);
        assert_eq!(cam.mapped_buffer_count(), 8);
        assert_eq!(cam.requests_created(), 8);
    }

    #[test]
    fn test_still_controls_survive_reuse() {
        let (cam, mut session, completed) = session_with(
            StreamStrategy::DualConcurrentStream, ImageCameraOptions::default());
        session.start().unwrap();
        let mut recorder = Recorder::default();
        for _ in 0..2 {
            session.request_still_frame().unwrap();
            cam.complete_all();
            drain(&mut session, &completed, &mut recorder);
        }
        let history = cam.queue_history();
        let still_cookie = StreamRole::StillCapture.cookie();
        let stills: Vec<_> = history.iter().filter(|h| h.1 == still_cookie).collect();
        assert_eq!(stills.len(), 8);
        assert!(stills.iter().all(|h| h.2.exposure_time().is_some() &&
                                      h.2.analogue_gain().is_some()));
        assert!(history.iter().filter(|h| h.1 != still_cookie).all(|h| h.2.is_empty()));
    }

    #[test]
    fn test_single_stream_still_capture() {
        let (cam, mut session, completed) = session_with(
            StreamStrategy::SingleActiveStream, ImageCameraOptions::default());
        session.start().unwrap();
        assert!(session.pool(StreamRole::StillCapture).is_none());
        assert_eq!(cam.queued_count(), 4);

        assert_eq!(session.request_still_frame().unwrap(), 4);
        assert!(session.pool(StreamRole::Viewfinder).is_none());
        assert_eq!(session.stream_config(StreamRole::StillCapture).unwrap().size,
                   Size::new(320, 240));
        assert_eq!(cam.queued_count(), 4);
        assert_eq!(cam.mapped_buffer_count(), 4);

        let mut recorder = Recorder::default();
        cam.complete_all();
        drain(&mut session, &completed, &mut recorder);
        // Stale cancelled viewfinder requests were dropped, the stills were
        // consumed and the viewfinder is back.
        assert_eq!(recorder.frames.len(), 4);
        assert_eq!(session.state(), SessionState::Previewing);
        assert!(session.pool(StreamRole::StillCapture).is_none());
        assert_eq!(session.pool(StreamRole::Viewfinder).unwrap().lent_count(), 4);
        assert_eq!(cam.queued_count(), 4);
        assert_eq!(cam.mapped_buffer_count(), 4);

        // The second capture restarts the device's sequence at 0; the
        // session carries on from where the first capture stopped.
        session.request_still_frame().unwrap();
        cam.complete_all();
        drain(&mut session, &completed, &mut recorder);
        let stills: Vec<(u32, u32)> = recorder.frames.iter()
            .filter(|f| f.0 == StreamRole::StillCapture).map(|f| (f.1, f.2)).collect();
        assert_eq!(stills, vec![(0, 0), (1, 1), (2, 2), (3, 3),
                                (4, 0), (5, 1), (6, 2), (7, 3)]);
    }

    #[test]
    fn test_failed_still_switch_restores_viewfinder() {
        let cam = Arc::new(ImageCamera::new(ImageCamera::star_field(320, 240)).unwrap());
        let (sink, completed) = collecting_sink();
        let mut session = CameraSession::new(
            cam.clone(),
            SessionOptions{strategy: StreamStrategy::SingleActiveStream,
                           still: StreamSettings{pixel_format: None,
                                                 size: Some(Size::new(0, 0))},
                           ..Default::default()},
            sink);
        session.start().unwrap();

        let err = session.request_still_frame().unwrap_err();
        assert!(matches!(err, SessionError::ConfigurationError{..}));
        assert_eq!(session.state(), SessionState::Previewing);
        assert!(cam.is_running());
        assert!(session.pool(StreamRole::StillCapture).is_none());
        assert_eq!(cam.queued_for(stream_of(&session, StreamRole::Viewfinder)), 4);
        assert_eq!(cam.mapped_buffer_count(), 4);

        // Old viewfinder requests come back cancelled and are ignored; the
        // new ones keep cycling.
        let mut recorder = Recorder::default();
        drain(&mut session, &completed, &mut recorder);
        cam.complete_all();
        drain(&mut session, &completed, &mut recorder);
        assert_eq!(recorder.frames.len(), 4);
        assert_eq!(cam.queued_count(), 4);
    }

    #[test]
    fn test_failed_still_switch_without_fallback_tears_down() {
        // The viewfinder uses up every request the camera can create.
        let (cam, mut session, _) = session_with(
            StreamStrategy::SingleActiveStream,
            ImageCameraOptions{request_limit: Some(4), ..Default::default()});
        session.start().unwrap();

        let err = session.request_still_frame().unwrap_err();
        assert!(matches!(err, SessionError::RequestCreationFailure{
            role: StreamRole::StillCapture, index: 0}));
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!cam.is_running());
        assert_eq!(cam.mapped_buffer_count(), 0);
        assert!(cam.is_released());
        assert!(matches!(session.request_still_frame(),
                         Err(SessionError::InvalidState{..})));
    }

    #[test]
    fn test_failed_return_to_viewfinder_is_reported() {
        // Room for the first viewfinder pool and one still pool only.
        let (cam, mut session, completed) = session_with(
            StreamStrategy::SingleActiveStream,
            ImageCameraOptions{request_limit: Some(8), ..Default::default()});
        session.start().unwrap();
        assert_eq!(session.request_still_frame().unwrap(), 4);
        cam.complete_all();

        let mut recorder = Recorder::default();
        let batch: Vec<Request> = completed.lock().unwrap().drain(..).collect();
        let failures: Vec<SessionError> = batch.into_iter()
            .filter_map(|r| session.process_completed(r, &mut recorder).err())
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], SessionError::RequestCreationFailure{
            role: StreamRole::Viewfinder, ..}));
        assert_eq!(recorder.frames.len(), 4);
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(cam.mapped_buffer_count(), 0);
        assert!(cam.is_released());
    }

    #[test]
    fn test_cancelled_requests_leave_rotation() {
        let (cam, mut session, completed) = session_with(
            StreamStrategy::DualConcurrentStream, ImageCameraOptions::default());
        session.start().unwrap();
        // Stop the pipeline underneath the session.
        cam.stop().unwrap();
        let mut recorder = Recorder::default();
        drain(&mut session, &completed, &mut recorder);
        let pool = session.pool(StreamRole::Viewfinder).unwrap();
        assert_eq!(pool.retired_count(), 4);
        assert!(recorder.frames.is_empty());
        assert_eq!(cam.queued_count(), 0);
    }

    #[test]
    fn test_queue_request_rejects_foreign_request() {
        let (cam, mut session, _) = session_with(
            StreamStrategy::DualConcurrentStream, ImageCameraOptions::default());
        session.start().unwrap();
        let stranger = cam.create_request(StreamRole::Viewfinder.cookie()).unwrap();
        assert!(matches!(session.queue_request(stranger),
                         Err(SessionError::QueueFailure{..})));
    }

    #[test]
    fn test_teardown_releases_everything_once() {
        let (cam, mut session, completed) = session_with(
            StreamStrategy::DualConcurrentStream, ImageCameraOptions::default());
        assert_eq!(Arc::strong_count(&cam), 2);
        session.start().unwrap();
        session.request_still_frame().unwrap();
        session.teardown().unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!cam.is_running());
        assert_eq!(cam.mapped_buffer_count(), 0);
        assert!(cam.is_released());
        assert_eq!(Arc::strong_count(&cam), 1);

        // Cancelled requests arriving late are dropped quietly.
        let mut recorder = Recorder::default();
        drain(&mut session, &completed, &mut recorder);
        assert!(recorder.frames.is_empty());

        session.teardown().unwrap();
        assert_eq!(Arc::strong_count(&cam), 1);
        assert!(session.request_still_frame().is_err());
    }

    #[test]
    fn test_drop_tears_down() {
        let (cam, session, _) = session_with(
            StreamStrategy::DualConcurrentStream, ImageCameraOptions::default());
        drop(session);
        assert_eq!(Arc::strong_count(&cam), 1);
        assert!(cam.is_released());
    }
}
