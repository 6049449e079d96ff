// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod abstract_camera;
pub mod buffer_pool;
pub mod error;
pub mod event_loop;
pub mod frame_consumer;
pub mod image_camera;
pub mod image_conversion;
pub mod request_factory;
#[cfg(feature = "rpi")]
pub mod rpi_camera;
pub mod select_camera;
pub mod session;
pub mod shutter;
pub mod still_writer;
pub mod stream_config;
pub mod uploader;
