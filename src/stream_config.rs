use canonical_error::{failed_precondition_error, invalid_argument_error};
use log::{debug, info, warn};

use crate::abstract_camera::{AbstractCamera, CameraConfiguration,
                             ConfigurationStatus, PixelFormat, Size,
                             StreamConfiguration, StreamRole};
use crate::error::SessionError;

/// Requested parameters for one stream. Fields left as None keep the
/// device's default.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct StreamSettings {
    pub pixel_format: Option<PixelFormat>,
    pub size: Option<Size>,
}

/// Negotiates and applies the camera's stream configuration, and remembers
/// which configuration is currently applied.
#[derive(Default)]
pub struct StreamConfigurationManager {
    active: Option<CameraConfiguration>,
}

impl StreamConfigurationManager {
    pub fn new() -> Self {
        StreamConfigurationManager{active: None}
    }

    /// Asks the device for its default configuration covering `roles`.
    pub fn generate(&self, camera: &dyn AbstractCamera, roles: &[StreamRole])
                    -> Result<CameraConfiguration, SessionError> {
        if roles.is_empty() {
            return Err(SessionError::ConfigurationError{
                cause: invalid_argument_error("no stream roles requested")});
        }
        let config = camera.generate_configuration(roles)
            .map_err(|cause| SessionError::ConfigurationError{cause})?;
        for stream_config in &config.streams {
            info!("Default {} configuration is: {}", stream_config.role, stream_config);
        }
        Ok(config)
    }

    /// Applies the caller's requested format and size to the draft
    /// configuration. No negotiation happens here; see validate().
    pub fn customize(config: &mut CameraConfiguration, role: StreamRole,
                     settings: &StreamSettings) {
        if let Some(stream_config) = config.get_mut(role) {
            if let Some(format) = settings.pixel_format {
                stream_config.pixel_format = format;
            }
            if let Some(size) = settings.size {
                stream_config.size = size;
            }
        }
    }

    /// Lets the device clamp the configuration to supported values. The
    /// configuration is canonical afterwards; callers must re-read sizes and
    /// formats from it.
    pub fn validate(&self, camera: &dyn AbstractCamera,
                    config: &mut CameraConfiguration)
                    -> Result<ConfigurationStatus, SessionError> {
        let status = camera.validate(config);
        match status {
            ConfigurationStatus::Invalid => {
                return Err(SessionError::ConfigurationError{
                    cause: invalid_argument_error("camera reports configuration invalid")});
            },
            ConfigurationStatus::Adjusted => {
                warn!("Camera adjusted the requested configuration");
            },
            ConfigurationStatus::Valid => (),
        }
        for stream_config in &config.streams {
            info!("Validated {} configuration is: {}", stream_config.role, stream_config);
        }
        Ok(status)
    }

    /// Applies `config` to a stopped pipeline. Applying while the pipeline
    /// runs is refused; use reconfigure() for that.
    pub fn apply(&mut self, camera: &dyn AbstractCamera,
                 mut config: CameraConfiguration)
                 -> Result<&CameraConfiguration, SessionError> {
        if camera.is_running() {
            return Err(SessionError::ConfigurationFailure{
                cause: failed_precondition_error(
                    "cannot apply a configuration while the pipeline is running")});
        }
        camera.configure(&mut config)
            .map_err(|cause| SessionError::ConfigurationFailure{cause})?;
        if config.streams.iter().any(|s| s.stream.is_none()) {
            return Err(SessionError::ConfigurationFailure{
                cause: failed_precondition_error("camera did not assign streams")});
        }
        debug!("Applied configuration with roles {:?}", config.roles());
        Ok(self.active.insert(config))
    }

    /// Stops the pipeline if needed, then applies `config`. The pipeline is
    /// left configured but stopped; the caller restarts it once buffers and
    /// requests are in place.
    pub fn reconfigure(&mut self, camera: &dyn AbstractCamera,
                       config: CameraConfiguration)
                       -> Result<&CameraConfiguration, SessionError> {
        if camera.is_running() {
            info!("Stopping pipeline to reconfigure");
            camera.stop().map_err(|cause| SessionError::PipelineFailure{
                action: "stop", cause})?;
        }
        self.apply(camera, config)
    }

    pub fn active(&self) -> Option<&CameraConfiguration> {
        self.active.as_ref()
    }

    pub fn stream_config(&self, role: StreamRole) -> Option<&StreamConfiguration> {
        self.active.as_ref().and_then(|c| c.get(role))
    }

    /// True if the applied configuration serves exactly `roles`, in order.
    pub fn serves(&self, roles: &[StreamRole]) -> bool {
        match &self.active {
            Some(config) => config.roles() == roles,
            None => false,
        }
    }

    pub fn release(&mut self) {
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_camera::{ImageCamera, ImageCameraOptions};

    fn camera() -> ImageCamera {
        ImageCamera::with_options(ImageCamera::star_field(640, 480),
                                  ImageCameraOptions::default())
    }

    #[test]
    fn test_generate_rejects_empty_roles() {
        let cam = camera();
        let manager = StreamConfigurationManager::new();
        let err = manager.generate(&cam, &[]).unwrap_err();
        assert!(matches!(err, SessionError::ConfigurationError{..}));
    }

    #[test]
    fn test_generate_rejects_too_many_streams() {
        let cam = ImageCamera::with_options(
            ImageCamera::star_field(640, 480),
            ImageCameraOptions{max_streams: 1, ..Default::default()});
        let manager = StreamConfigurationManager::new();
        let err = manager.generate(
            &cam, &[StreamRole::Viewfinder, StreamRole::StillCapture]).unwrap_err();
        assert!(matches!(err, SessionError::ConfigurationError{..}));
    }

    #[test]
    fn test_validate_clamps_size() {
        let cam = camera();
        let manager = StreamConfigurationManager::new();
        let mut config = manager.generate(&cam, &[StreamRole::Viewfinder]).unwrap();
        StreamConfigurationManager::customize(
            &mut config, StreamRole::Viewfinder,
            &StreamSettings{pixel_format: None, size: Some(Size::new(4000, 127))});
        let status = manager.validate(&cam, &mut config).unwrap();
        assert_eq!(status, ConfigurationStatus::Adjusted);
        let vf = config.get(StreamRole::Viewfinder).unwrap();
        assert_eq!(vf.size, Size::new(640, 126));
        assert_eq!(vf.stride, 640 * 4);
    }

    #[test]
    fn test_apply_assigns_streams() {
        let cam = camera();
        let mut manager = StreamConfigurationManager::new();
        let mut config = manager.generate(
            &cam, &[StreamRole::Viewfinder, StreamRole::StillCapture]).unwrap();
        manager.validate(&cam, &mut config).unwrap();
        let applied = manager.apply(&cam, config).unwrap();
        assert!(applied.streams.iter().all(|s| s.stream.is_some()));
        assert!(manager.serves(&[StreamRole::Viewfinder, StreamRole::StillCapture]));
        assert!(!manager.serves(&[StreamRole::Viewfinder]));
    }

    #[test]
    fn test_apply_refused_while_running() {
        let cam = camera();
        let mut manager = StreamConfigurationManager::new();
        let mut config = manager.generate(&cam, &[StreamRole::Viewfinder]).unwrap();
        manager.validate(&cam, &mut config).unwrap();
        manager.apply(&cam, config.clone()).unwrap();
        cam.start().unwrap();

        let err = manager.apply(&cam, config.clone()).unwrap_err();
        assert!(matches!(err, SessionError::ConfigurationFailure{..}));

        // reconfigure() stops first.
        manager.reconfigure(&cam, config).unwrap();
        assert!(!cam.is_running());
    }
}
