// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use env_logger;
use log::{error, info, warn};

use astro_camera::abstract_camera::{PixelFormat, Size};
use astro_camera::event_loop::{EventLoop, LoopExit};
use astro_camera::frame_consumer::AstroFrameConsumer;
use astro_camera::request_factory::StillExposure;
use astro_camera::select_camera::{CameraInterface, select_camera};
use astro_camera::session::{CameraSession, SessionOptions, StreamStrategy};
use astro_camera::shutter::{ShutterTrigger, stdin_shutter};
use astro_camera::still_writer::{JpegFileSink, StillSink, StillWriter,
                                 StillWriterOptions};
use astro_camera::stream_config::StreamSettings;
use astro_camera::uploader::TcpStillSink;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CameraArg {
    Image,
    Rpi,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StrategyArg {
    /// Viewfinder and still streams configured together.
    Dual,
    /// One stream at a time; stills interrupt the viewfinder.
    Single,
}

fn parse_size(arg: &str) -> Result<Size, String> {
    let (w, h) = arg.split_once('x').ok_or_else(|| format!("expected WxH, got {}", arg))?;
    let width = w.parse::<u32>().map_err(|e| e.to_string())?;
    let height = h.parse::<u32>().map_err(|e| e.to_string())?;
    Ok(Size::new(width, height))
}

/// Astrophotography capture rig: keeps a small viewfinder running and writes
/// a burst of still frames each time the shutter is pressed.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Camera interface. Defaults to libcamera if a camera is present,
    /// otherwise the software camera.
    #[arg(long, value_enum)]
    camera: Option<CameraArg>,

    /// Which camera on the interface.
    #[arg(long, default_value_t = 0)]
    index: usize,

    #[arg(long, value_enum, default_value_t = StrategyArg::Dual)]
    strategy: StrategyArg,

    /// Viewfinder size, WxH.
    #[arg(long, default_value = "128x128", value_parser = parse_size)]
    viewfinder_size: Size,

    /// Still size, WxH. Defaults to the camera's still size.
    #[arg(long, value_parser = parse_size)]
    still_size: Option<Size>,

    /// Still exposure time in microseconds.
    #[arg(long, default_value_t = 100_000)]
    exposure_us: u64,

    /// Still analogue gain.
    #[arg(long, default_value_t = 4.0)]
    gain: f32,

    /// Let the camera choose still exposure; overrides --exposure-us and
    /// --gain.
    #[arg(long)]
    auto_exposure: bool,

    #[arg(long, default_value = "stills")]
    stills_dir: PathBuf,

    #[arg(long, default_value_t = 90)]
    jpeg_quality: u8,

    /// Also send each still to this host:port.
    #[arg(long)]
    upload: Option<String>,

    /// Seconds to run before shutting down. 0 runs until Ctrl-C.
    #[arg(long, default_value_t = 3)]
    timeout_secs: u64,

    /// GPIO pin of the shutter button (with the rpi feature).
    #[arg(long, default_value_t = 27)]
    shutter_pin: u8,

    #[arg(long, default_value_t = 150)]
    debounce_ms: u64,
}

#[tokio::main]
async fn main() {
    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(1);
    }));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let interface = args.camera.map(|c| match c {
        CameraArg::Image => CameraInterface::Image,
        CameraArg::Rpi => CameraInterface::Rpi,
    });
    let camera = match select_camera(interface, args.index) {
        Ok(camera) => camera,
        Err(e) => {
            eprintln!("Could not open camera: {}", e);
            std::process::exit(1);
        },
    };
    info!("Using camera {} ({})", camera.model(), camera.id());

    let still_exposure = if args.auto_exposure {
        StillExposure::Auto
    } else {
        StillExposure::Manual{exposure_time: Duration::from_micros(args.exposure_us),
                              analogue_gain: args.gain}
    };
    let options = SessionOptions{
        strategy: match args.strategy {
            StrategyArg::Dual => StreamStrategy::DualConcurrentStream,
            StrategyArg::Single => StreamStrategy::SingleActiveStream,
        },
        viewfinder: StreamSettings{pixel_format: Some(PixelFormat::Xrgb8888),
                                   size: Some(args.viewfinder_size)},
        still: StreamSettings{pixel_format: Some(PixelFormat::Xrgb8888),
                              size: args.still_size},
        still_exposure,
    };

    let (mut event_loop, sender) = EventLoop::new();
    let mut session = CameraSession::new(camera, options, sender.completion_sink());

    let mut sinks: Vec<Box<dyn StillSink>> = vec![Box::new(JpegFileSink::new(&args.stills_dir))];
    if let Some(address) = &args.upload {
        sinks.push(Box::new(TcpStillSink::new(address)));
    }
    let writer = StillWriter::start(sinks, StillWriterOptions{
        jpeg_quality: args.jpeg_quality, ..Default::default()});
    let mut consumer = AstroFrameConsumer::new(None, Some(writer));

    if let Err(e) = session.start() {
        eprintln!("Fatal error during {}: {}", e.stage(), e);
        let _ = session.teardown();
        std::process::exit(1);
    }

    let trigger = Arc::new(ShutterTrigger::new(sender.clone(),
                                               Duration::from_millis(args.debounce_ms)));
    #[cfg(feature = "rpi")]
    let _button = match astro_camera::shutter::ShutterButton::new(args.shutter_pin,
                                                                  trigger.clone()) {
        Ok(button) => Some(button),
        Err(e) => {
            warn!("No shutter button: {}", e);
            None
        },
    };
    #[cfg(not(feature = "rpi"))]
    info!("Built without GPIO support; shutter pin {} unused", args.shutter_pin);
    tokio::spawn(stdin_shutter(trigger.clone()));

    let stopper = sender.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            stopper.stop();
        }
    });

    let run_time = match args.timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let exit = event_loop.exec(&mut session, &mut consumer, run_time).await;

    let mut code = 0;
    if let LoopExit::Failed(e) = &exit {
        eprintln!("Fatal error during {}: {}", e.stage(), e);
        code = 1;
    }
    if let Err(e) = session.teardown() {
        error!("Teardown failed: {}", e);
        code = 1;
    }
    if let Some(writer) = consumer.take_writer() {
        let dropped = writer.dropped();
        let written = writer.shutdown().await;
        info!("Wrote {} stills, dropped {}", written, dropped);
        if dropped > 0 {
            warn!("Some stills were dropped; the encoder could not keep up");
        }
    }
    info!("Exiting after {:?} with {} shutter presses", exit, trigger.accepted());
    // Exit explicitly; a pending stdin read would otherwise hold up runtime
    // shutdown.
    std::process::exit(code);
}
