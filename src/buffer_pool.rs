use std::collections::BTreeSet;

use log::{debug, info};

use crate::abstract_camera::{FrameBuffer, FrameBufferAllocator, StreamId,
                             StreamRole};
use crate::error::SessionError;

/// Owns the device allocator and backs each configured stream with buffers
/// that are allocated once and then reused for as long as the stream's
/// configuration stays applied.
pub struct BufferPool {
    allocator: Box<dyn FrameBufferAllocator>,

    // Streams we have allocated for and not yet freed.
    populated: BTreeSet<StreamId>,
}

impl BufferPool {
    pub fn new(allocator: Box<dyn FrameBufferAllocator>) -> Self {
        BufferPool{allocator, populated: BTreeSet::new()}
    }

    /// Allocates buffers for `stream` unless it already has some. Returns the
    /// number of buffers backing the stream either way.
    pub fn ensure_allocated(&mut self, stream: StreamId, role: StreamRole)
                            -> Result<usize, SessionError> {
        let existing = self.allocator.buffers(stream).len();
        if existing > 0 {
            debug!("{} stream {:?} already has {} buffers", role, stream, existing);
            self.populated.insert(stream);
            return Ok(existing);
        }
        let count = self.allocator.allocate(stream)
            .map_err(|cause| SessionError::AllocationFailure{role, cause})?;
        info!("Allocated {} buffers for {} stream", count, role);
        self.populated.insert(stream);
        Ok(count)
    }

    pub fn buffers(&self, stream: StreamId) -> &[FrameBuffer] {
        self.allocator.buffers(stream)
    }

    pub fn is_allocated(&self, stream: StreamId) -> bool {
        !self.allocator.buffers(stream).is_empty()
    }

    /// Releases the buffers of `stream`. The stream must be idle.
    pub fn free(&mut self, stream: StreamId, role: StreamRole) -> Result<(), SessionError> {
        if !self.populated.remove(&stream) {
            return Ok(());
        }
        debug!("Freeing buffers of {} stream {:?}", role, stream);
        self.allocator.free(stream)
            .map_err(|cause| SessionError::AllocationFailure{role, cause})
    }

    pub fn allocated_streams(&self) -> Vec<StreamId> {
        self.populated.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstract_camera::AbstractCamera;
    use crate::image_camera::{ImageCamera, ImageCameraOptions};
    use crate::stream_config::StreamConfigurationManager;

    fn configured_camera(options: ImageCameraOptions) -> (ImageCamera, StreamId) {
        let cam = ImageCamera::with_options(ImageCamera::star_field(320, 240), options);
        let mut manager = StreamConfigurationManager::new();
        let mut config = manager.generate(&cam, &[StreamRole::Viewfinder]).unwrap();
        manager.validate(&cam, &mut config).unwrap();
        let stream = manager.apply(&cam, config).unwrap()
            .get(StreamRole::Viewfinder).unwrap().stream.unwrap();
        (cam, stream)
    }

    #[test]
    fn test_allocation_is_idempotent() {
        let (cam, stream) = configured_camera(ImageCameraOptions::default());
        let mut pool = BufferPool::new(cam.create_allocator());
        assert_eq!(pool.ensure_allocated(stream, StreamRole::Viewfinder).unwrap(), 4);
        let first: Vec<_> = pool.buffers(stream).to_vec();

        assert_eq!(pool.ensure_allocated(stream, StreamRole::Viewfinder).unwrap(), 4);
        assert_eq!(pool.buffers(stream), first.as_slice());
        assert_eq!(cam.mapped_buffer_count(), 4);
    }

    #[test]
    fn test_allocation_failure() {
        let (cam, stream) = configured_camera(
            ImageCameraOptions{buffer_budget: Some(2), ..Default::default()});
        let mut pool = BufferPool::new(cam.create_allocator());
        let err = pool.ensure_allocated(stream, StreamRole::Viewfinder).unwrap_err();
        assert!(matches!(err, SessionError::AllocationFailure{..}));
        assert!(!pool.is_allocated(stream));
    }

    #[test]
    fn test_free_releases_buffers() {
        let (cam, stream) = configured_camera(ImageCameraOptions::default());
        let mut pool = BufferPool::new(cam.create_allocator());
        pool.ensure_allocated(stream, StreamRole::Viewfinder).unwrap();
        pool.free(stream, StreamRole::Viewfinder).unwrap();
        assert_eq!(cam.mapped_buffer_count(), 0);
        assert!(pool.allocated_streams().is_empty());
        // Freeing twice is harmless.
        pool.free(stream, StreamRole::Viewfinder).unwrap();
    }
}
