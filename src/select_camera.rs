use std::sync::Arc;
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error, not_found_error};
use log::info;

use crate::abstract_camera::{AbstractCamera, EnumeratedCameraInfo};
use crate::image_camera::{FrameTiming, ImageCamera, ImageCameraOptions};
#[cfg(feature = "rpi")]
use crate::rpi_camera::RpiCamera;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CameraInterface {
    /// Software camera rendering a synthetic star field.
    Image,
    /// libcamera, when built with the `rpi` feature.
    Rpi,
}

// Sensor size of the software camera. Matches the IMX296 global shutter
// sensor common on Pi astro rigs.
const IMAGE_CAMERA_SIZE: (u32, u32) = (1456, 1088);
const IMAGE_CAMERA_FRAME_INTERVAL: Duration = Duration::from_millis(100);

pub fn enumerate_cameras(interface: CameraInterface)
                         -> Result<Vec<EnumeratedCameraInfo>, CanonicalError> {
    match interface {
        CameraInterface::Image => Ok(vec![EnumeratedCameraInfo{
            model: "ImageCamera".to_string(),
            width: IMAGE_CAMERA_SIZE.0,
            height: IMAGE_CAMERA_SIZE.1}]),
        #[cfg(feature = "rpi")]
        CameraInterface::Rpi => RpiCamera::enumerate_cameras(),
        #[cfg(not(feature = "rpi"))]
        CameraInterface::Rpi => Ok(vec![]),
    }
}

/// Returns a shared camera handle:
/// * If `camera_interface` is given, a camera on that interface is returned or
///   an error if there is none.
/// * Otherwise a libcamera camera is preferred when one is present, falling
///   back to the software camera.
/// * `camera_index` selects among the cameras of the interface.
pub fn select_camera(camera_interface: Option<CameraInterface>, camera_index: usize)
                     -> Result<Arc<dyn AbstractCamera>, CanonicalError> {
    let interface = match camera_interface {
        Some(interface) => interface,
        None => {
            if enumerate_cameras(CameraInterface::Rpi)?.is_empty() {
                info!("No libcamera camera found, using the software camera");
                CameraInterface::Image
            } else {
                CameraInterface::Rpi
            }
        },
    };
    let cameras = enumerate_cameras(interface)?;
    if cameras.is_empty() {
        return Err(not_found_error(
            format!("No camera found on interface {:?}", interface).as_str()));
    }
    if camera_index >= cameras.len() {
        return Err(failed_precondition_error(
            format!("Camera index {} out of range; {} cameras on {:?}",
                    camera_index, cameras.len(), interface).as_str()));
    }
    match interface {
        CameraInterface::Image => {
            let (width, height) = IMAGE_CAMERA_SIZE;
            Ok(Arc::new(ImageCamera::with_options(
                ImageCamera::star_field(width, height),
                ImageCameraOptions{timing: FrameTiming::Interval(IMAGE_CAMERA_FRAME_INTERVAL),
                                   ..Default::default()})))
        },
        #[cfg(feature = "rpi")]
        CameraInterface::Rpi => Ok(Arc::new(RpiCamera::new(camera_index)?)),
        #[cfg(not(feature = "rpi"))]
        CameraInterface::Rpi => Err(failed_precondition_error(
            "Built without libcamera support; enable the 'rpi' feature")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_camera_selected() {
        let camera = select_camera(Some(CameraInterface::Image), 0).unwrap();
        assert_eq!(camera.model(), "ImageCamera");
        assert_eq!(camera.dimensions(), IMAGE_CAMERA_SIZE);
        assert!(select_camera(Some(CameraInterface::Image), 1).is_err());
    }

    #[cfg(not(feature = "rpi"))]
    #[test]
    fn test_fallback_without_libcamera() {
        assert!(select_camera(Some(CameraInterface::Rpi), 0).is_err());
        let camera = select_camera(None, 0).unwrap();
        assert_eq!(camera.model(), "ImageCamera");
    }
}
