use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

use crate::abstract_camera::{CompletionSink, Request};
use crate::error::SessionError;
use crate::frame_consumer::FrameConsumer;
use crate::session::{CameraSession, SessionState};

/// Work posted to the session's thread from elsewhere: the camera's
/// completion thread, the shutter, a signal handler.
#[derive(Debug)]
pub enum Event {
    RequestCompleted(Request),
    ShutterPressed,
    Stop,
}

#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Returns false if the loop has gone away.
    pub fn post(&self, event: Event) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.post(Event::Stop)
    }

    /// A sink for the camera that defers each completed request to the loop.
    pub fn completion_sink(&self) -> CompletionSink {
        let sender = self.sender.clone();
        Arc::new(move |request: Request| {
            let id = request.id();
            if sender.send(Event::RequestCompleted(request)).is_err() {
                debug!("Event loop gone, dropping completed request {}", id);
            }
        })
    }
}

#[derive(Debug)]
pub enum LoopExit {
    /// The run time given to exec() elapsed.
    Timeout,
    /// A Stop event arrived.
    Stopped,
    /// Every sender was dropped.
    Disconnected,
    /// The session could not carry on.
    Failed(SessionError),
}

/// Runs every session operation on one task, one event at a time.
pub struct EventLoop {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventLoop {
    pub fn new() -> (EventLoop, EventSender) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (EventLoop{receiver}, EventSender{sender})
    }

    /// Dispatches events until `run_time` elapses (forever if None), a Stop
    /// event arrives or all senders are gone.
    pub async fn exec(&mut self, session: &mut CameraSession,
                      consumer: &mut dyn FrameConsumer,
                      run_time: Option<Duration>) -> LoopExit {
        let deadline = run_time.map(|t| Instant::now() + t);
        loop {
            let event = match deadline {
                Some(deadline) => match timeout_at(deadline, self.receiver.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        info!("Event loop run time elapsed");
                        return LoopExit::Timeout;
                    },
                },
                None => self.receiver.recv().await,
            };
            let Some(event) = event else {
                return LoopExit::Disconnected;
            };
            if let Some(exit) = Self::dispatch(event, session, consumer) {
                return exit;
            }
        }
    }

    /// Dispatches whatever is already queued, without waiting.
    pub fn dispatch_pending(&mut self, session: &mut CameraSession,
                            consumer: &mut dyn FrameConsumer) -> Option<LoopExit> {
        while let Ok(event) = self.receiver.try_recv() {
            if let Some(exit) = Self::dispatch(event, session, consumer) {
                return Some(exit);
            }
        }
        None
    }

    fn dispatch(event: Event, session: &mut CameraSession,
                consumer: &mut dyn FrameConsumer) -> Option<LoopExit> {
        match event {
            Event::RequestCompleted(request) => {
                if let Err(e) = session.process_completed(request, consumer) {
                    error!("Session failed handling a completed request: {}", e);
                    return Some(LoopExit::Failed(e));
                }
            },
            Event::ShutterPressed => {
                if let Err(e) = session.request_still_frame() {
                    // A failed capture that could not fall back to the
                    // viewfinder leaves the session torn down.
                    let fatal = session.state() == SessionState::Stopped &&
                        !matches!(e, SessionError::InvalidState{..});
                    if fatal {
                        error!("Still capture failed and the session stopped: {}", e);
                        return Some(LoopExit::Failed(e));
                    }
                    warn!("Ignoring shutter press: {}", e);
                }
            },
            Event::Stop => {
                info!("Event loop stopped");
                return Some(LoopExit::Stopped);
            },
        }
        None
    }
}
