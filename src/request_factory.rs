use std::time::Duration;

use log::{debug, warn};

use crate::abstract_camera::{AbstractCamera, ControlId, ControlValue,
                             FrameBuffer, Request, RequestId, StreamId,
                             StreamRole};
use crate::error::SessionError;

/// Exposure policy for still captures. Viewfinder requests never carry
/// exposure overrides, so they run under the camera's auto-exposure.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum StillExposure {
    /// Leave exposure to the camera.
    Auto,
    /// Fixed manual exposure, stamped on every still request.
    Manual { exposure_time: Duration, analogue_gain: f32 },
}

impl Default for StillExposure {
    fn default() -> Self {
        StillExposure::Manual{exposure_time: Duration::from_millis(100),
                              analogue_gain: 4.0}
    }
}

/// Builds one request per allocated buffer of a stream and tags each with
/// its stream role.
#[derive(Clone, Debug, Default)]
pub struct RequestFactory {
    still_exposure: StillExposure,
}

impl RequestFactory {
    pub fn new(still_exposure: StillExposure) -> Self {
        RequestFactory{still_exposure}
    }

    pub fn still_exposure(&self) -> StillExposure {
        self.still_exposure
    }

    pub fn build_requests(&self, camera: &dyn AbstractCamera, stream: StreamId,
                          buffers: &[FrameBuffer], role: StreamRole)
                          -> Result<RequestPool, SessionError> {
        let mut slots = Vec::with_capacity(buffers.len());
        for (index, buffer) in buffers.iter().enumerate() {
            let mut request = camera.create_request(role.cookie())
                .ok_or(SessionError::RequestCreationFailure{role, index})?;
            request.add_buffer(stream, buffer)
                .map_err(|cause| SessionError::BufferBindingFailure{role, index, cause})?;
            self.arm(&mut request, role);
            slots.push(Slot::Idle(request));
        }
        debug!("Built {} {} requests", slots.len(), role);
        Ok(RequestPool{role, stream, slots})
    }

    /// Stamps the per-role controls onto a fresh or just-reused request.
    pub fn arm(&self, request: &mut Request, role: StreamRole) {
        if role != StreamRole::StillCapture {
            return;
        }
        if let StillExposure::Manual{exposure_time, analogue_gain} = self.still_exposure {
            let micros = i32::try_from(exposure_time.as_micros()).unwrap_or(i32::MAX);
            let controls = request.controls_mut();
            controls.set(ControlId::AeEnable, ControlValue::Bool(false));
            controls.set(ControlId::ExposureTime, ControlValue::Int32(micros));
            controls.set(ControlId::AnalogueGain, ControlValue::Float(analogue_gain));
        }
    }
}

#[derive(Debug)]
enum Slot {
    /// Owned by the pool, ready to be queued.
    Idle(Request),
    /// Handed to the pipeline or to the completion handler.
    Lent(RequestId),
    /// Came back cancelled; kept only so teardown releases it.
    Retired(Request),
}

impl Slot {
    fn id(&self) -> RequestId {
        match self {
            Slot::Idle(r) | Slot::Retired(r) => r.id(),
            Slot::Lent(id) => *id,
        }
    }
}

/// The requests of one stream role, one per buffer.
#[derive(Debug)]
pub struct RequestPool {
    role: StreamRole,
    stream: StreamId,
    slots: Vec<Slot>,
}

impl RequestPool {
    pub fn role(&self) -> StreamRole { self.role }
    pub fn stream(&self) -> StreamId { self.stream }
    pub fn len(&self) -> usize { self.slots.len() }
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.slots.iter().map(Slot::id).collect()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.slots.iter().any(|s| s.id() == id)
    }

    pub fn idle_count(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Idle(_))).count()
    }

    pub fn lent_count(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Lent(_))).count()
    }

    pub fn retired_count(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Retired(_))).count()
    }

    /// Takes the next idle request out of the pool, leaving its slot lent.
    pub fn lend_idle(&mut self) -> Option<Request> {
        let slot = self.slots.iter_mut().find(|s| matches!(s, Slot::Idle(_)))?;
        let id = slot.id();
        match std::mem::replace(slot, Slot::Lent(id)) {
            Slot::Idle(request) => Some(request),
            _ => None,
        }
    }

    pub fn is_lent(&self, id: RequestId) -> bool {
        self.slots.iter().any(|s| matches!(s, Slot::Lent(lent) if *lent == id))
    }

    /// Returns a lent request to the pool as idle. Hands the request back if
    /// it does not belong here.
    pub fn park(&mut self, request: Request) -> Result<(), Request> {
        self.put_back(request, false)
    }

    /// Returns a lent request to the pool, removed from rotation.
    pub fn retire(&mut self, request: Request) -> Result<(), Request> {
        self.put_back(request, true)
    }

    fn put_back(&mut self, request: Request, retire: bool) -> Result<(), Request> {
        let id = request.id();
        match self.slots.iter_mut().find(|s| matches!(s, Slot::Lent(lent) if *lent == id)) {
            Some(slot) => {
                *slot = if retire { Slot::Retired(request) } else { Slot::Idle(request) };
                Ok(())
            },
            None => {
                warn!("Request {} is not lent from the {} pool", id, self.role);
                Err(request)
            },
        }
    }

    /// Drops every request the pool still owns. Returns how many were
    /// released.
    pub fn release(&mut self) -> usize {
        let owned = self.slots.iter().filter(|s| !matches!(s, Slot::Lent(_))).count();
        self.slots.clear();
        owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::image_camera::{ImageCamera, ImageCameraOptions};
    use crate::stream_config::StreamConfigurationManager;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn setup(roles: &[StreamRole], options: ImageCameraOptions)
             -> (ImageCamera, BufferPool, Vec<StreamId>) {
        let cam = ImageCamera::with_options(ImageCamera::star_field(320, 240), options);
        let mut manager = StreamConfigurationManager::new();
        let mut config = manager.generate(&cam, roles).unwrap();
        manager.validate(&cam, &mut config).unwrap();
        let applied = manager.apply(&cam, config).unwrap();
        let streams: Vec<StreamId> =
            applied.streams.iter().map(|s| s.stream.unwrap()).collect();
        let mut pool = BufferPool::new(cam.create_allocator());
        for (role, stream) in roles.iter().zip(&streams) {
            pool.ensure_allocated(*stream, *role).unwrap();
        }
        (cam, pool, streams)
    }

    #[test]
    fn test_still_requests_carry_manual_exposure() {
        let roles = [StreamRole::Viewfinder, StreamRole::StillCapture];
        let (cam, pool, streams) = setup(&roles, ImageCameraOptions::default());
        let factory = RequestFactory::new(StillExposure::Manual{
            exposure_time: Duration::from_millis(250), analogue_gain: 2.5});

        let mut still = factory.build_requests(
            &cam, streams[1], pool.buffers(streams[1]), StreamRole::StillCapture).unwrap();
        let request = still.lend_idle().unwrap();
        assert_eq!(request.controls().exposure_time(), Some(Duration::from_millis(250)));
        assert_eq!(request.controls().analogue_gain(), Some(2.5));
        assert_eq!(request.controls().get(ControlId::AeEnable),
                   Some(ControlValue::Bool(false)));
        assert_eq!(request.cookie(), StreamRole::StillCapture.cookie());

        let mut viewfinder = factory.build_requests(
            &cam, streams[0], pool.buffers(streams[0]), StreamRole::Viewfinder).unwrap();
        let request = viewfinder.lend_idle().unwrap();
        assert!(request.controls().is_empty());
    }

    #[test]
    fn test_auto_exposure_stamps_nothing() {
        let roles = [StreamRole::StillCapture];
        let (cam, pool, streams) = setup(&roles, ImageCameraOptions::default());
        let factory = RequestFactory::new(StillExposure::Auto);
        let mut still = factory.build_requests(
            &cam, streams[0], pool.buffers(streams[0]), StreamRole::StillCapture).unwrap();
        assert!(still.lend_idle().unwrap().controls().is_empty());
    }

    #[test]
    fn test_request_creation_failure() {
        let roles = [StreamRole::Viewfinder];
        let (cam, pool, streams) = setup(
            &roles, ImageCameraOptions{request_limit: Some(2), ..Default::default()});
        let err = RequestFactory::default().build_requests(
            &cam, streams[0], pool.buffers(streams[0]), StreamRole::Viewfinder).unwrap_err();
        assert!(matches!(err, SessionError::RequestCreationFailure{index: 2, ..}));
    }

    #[test]
    fn test_buffer_binding_failure() {
        let roles = [StreamRole::Viewfinder, StreamRole::StillCapture];
        let (cam, pool, streams) = setup(&roles, ImageCameraOptions::default());
        // Viewfinder buffers offered for the still stream.
        let err = RequestFactory::default().build_requests(
            &cam, streams[1], pool.buffers(streams[0]), StreamRole::StillCapture).unwrap_err();
        assert!(matches!(err, SessionError::BufferBindingFailure{index: 0, ..}));
    }

    #[test]
    fn test_lend_park_retire() {
        let roles = [StreamRole::Viewfinder];
        let (cam, pool, streams) = setup(&roles, ImageCameraOptions::default());
        let mut requests = RequestFactory::default().build_requests(
            &cam, streams[0], pool.buffers(streams[0]), StreamRole::Viewfinder).unwrap();
        let a = requests.lend_idle().unwrap();
        let b = requests.lend_idle().unwrap();
        assert_eq!(requests.idle_count(), 2);
        assert_eq!(requests.lent_count(), 2);
        assert!(requests.is_lent(a.id()));

        requests.park(a).unwrap();
        requests.retire(b).unwrap();
        assert_eq!(requests.idle_count(), 3);
        assert_eq!(requests.retired_count(), 1);
        assert_eq!(requests.lent_count(), 0);

        // A request from elsewhere is handed back.
        let stranger = Request::new(9999, StreamRole::Viewfinder.cookie());
        assert!(requests.park(stranger).is_err());

        assert_eq!(requests.release(), 4);
        assert!(requests.is_empty());
    }

    proptest! {
        #[test]
        fn prop_one_request_per_buffer(buffer_count in 1usize..8) {
            let roles = [StreamRole::Viewfinder, StreamRole::StillCapture];
            let (cam, pool, streams) = setup(
                &roles, ImageCameraOptions{buffer_count, ..Default::default()});
            let factory = RequestFactory::default();
            for (role, stream) in roles.iter().zip(&streams) {
                let mut requests = factory.build_requests(
                    &cam, *stream, pool.buffers(*stream), *role).unwrap();
                prop_assert_eq!(requests.len(), buffer_count);
                let mut bound = HashSet::new();
                while let Some(request) = requests.lend_idle() {
                    prop_assert_eq!(request.stream(), Some(*stream));
                    prop_assert!(bound.insert(request.buffer().unwrap().id));
                }
                prop_assert_eq!(bound.len(), buffer_count);
            }
        }
    }
}
