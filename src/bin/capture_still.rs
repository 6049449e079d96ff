use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::offset::Local;
use chrono::DateTime;
use clap::Parser;
use env_logger;
use log::info;

use astro_camera::event_loop::EventLoop;
use astro_camera::frame_consumer::AstroFrameConsumer;
use astro_camera::select_camera::select_camera;
use astro_camera::session::{CameraSession, SessionOptions, SessionState};
use astro_camera::still_writer::{JpegFileSink, StillWriter, StillWriterOptions};

/// Captures one burst of still frames and writes them as JPEG files.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Directory for the JPEG files.
    #[arg(short, long, default_value = "stills")]
    output: PathBuf,

    /// Give up if the capture has not finished after this many seconds.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
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

    let camera = select_camera(None, 0).unwrap();
    info!("camera: {}", camera.model());
    let (mut event_loop, sender) = EventLoop::new();
    let mut session = CameraSession::new(camera, SessionOptions::default(),
                                         sender.completion_sink());
    let writer = StillWriter::start(vec![Box::new(JpegFileSink::new(&args.output))],
                                    StillWriterOptions::default());
    let mut consumer = AstroFrameConsumer::new(None, Some(writer));

    session.start().unwrap();
    let queued = session.request_still_frame().unwrap();
    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    while session.state() == SessionState::Capturing && Instant::now() < deadline {
        event_loop.exec(&mut session, &mut consumer, Some(Duration::from_millis(100))).await;
    }
    let finished = session.state() != SessionState::Capturing;
    session.teardown().unwrap();

    let written = match consumer.take_writer() {
        Some(writer) => writer.shutdown().await,
        None => 0,
    };
    let datetime: DateTime<Local> = Local::now();
    if !finished {
        eprintln!("Still capture did not finish within {}s", args.timeout_secs);
        std::process::exit(1);
    }
    info!("Captured {} of {} stills into {} at {}",
          written, queued, args.output.display(), datetime.format("%d/%m/%Y %T"));
}
