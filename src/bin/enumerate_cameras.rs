// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use env_logger;

use astro_camera::select_camera::{CameraInterface, enumerate_cameras};

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    for interface in [CameraInterface::Rpi, CameraInterface::Image] {
        match enumerate_cameras(interface) {
            Ok(cameras) => {
                println!("Found {} {:?} cameras: ", cameras.len(), interface);
                for (i, info) in cameras.iter().enumerate() {
                    println!("{}: {:?}", i, info);
                }
            },
            Err(e) => println!("Could not enumerate {:?} cameras: {}", interface, e),
        }
    }
}
