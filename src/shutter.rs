use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::event_loop::{Event, EventSender};

/// Turns shutter presses into still requests on the event loop. Presses may
/// come from any thread, including a GPIO interrupt thread; presses closer
/// together than the debounce interval count as one.
pub struct ShutterTrigger {
    sender: EventSender,
    debounce: Duration,
    last_accepted: Mutex<Option<Instant>>,
    accepted: AtomicU64,
}

impl ShutterTrigger {
    pub fn new(sender: EventSender, debounce: Duration) -> Self {
        ShutterTrigger{sender, debounce, last_accepted: Mutex::new(None),
                       accepted: AtomicU64::new(0)}
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Returns true if the press was passed on to the event loop.
    pub fn press(&self) -> bool {
        self.press_at(Instant::now())
    }

    pub fn press_at(&self, now: Instant) -> bool {
        {
            let mut last = self.last_accepted.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = *last {
                if now.saturating_duration_since(previous) < self.debounce {
                    debug!("Shutter bounce ignored");
                    return false;
                }
            }
            *last = Some(now);
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.sender.post(Event::ShutterPressed)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// Treats each line typed on stdin as a shutter press. Returns at end of
/// input.
pub async fn stdin_shutter(trigger: Arc<ShutterTrigger>) {
    info!("Press Enter to capture a still");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(_line)) = lines.next_line().await {
        trigger.press();
    }
    debug!("stdin closed, shutter input finished");
}

#[cfg(feature = "rpi")]
pub use button::ShutterButton;

#[cfg(feature = "rpi")]
mod button {
    use std::sync::Arc;

    use canonical_error::{CanonicalError, unavailable_error};
    use log::info;
    use rppal::gpio::{Event, Gpio, InputPin, Trigger};

    use super::ShutterTrigger;

    /// A push button between a GPIO pin and ground.
    pub struct ShutterButton {
        // Interrupts stop when the pin is dropped.
        _pin: InputPin,
    }

    impl ShutterButton {
        pub fn new(pin: u8, trigger: Arc<ShutterTrigger>) -> Result<Self, CanonicalError> {
            let gpio = Gpio::new().map_err(|e| unavailable_error(
                format!("GPIO unavailable: {}", e).as_str()))?;
            let mut input = gpio.get(pin).map_err(|e| unavailable_error(
                format!("GPIO pin {} unavailable: {}", pin, e).as_str()))?
                .into_input_pullup();
            let debounce = trigger.debounce();
            input.set_async_interrupt(Trigger::FallingEdge, Some(debounce),
                                      move |_event: Event| { trigger.press(); })
                .map_err(|e| unavailable_error(
                    format!("could not watch GPIO pin {}: {}", pin, e).as_str()))?;
            info!("Shutter button on GPIO {}", pin);
            Ok(ShutterButton{_pin: input})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::thread;

    #[test]
    fn test_debounce() {
        let (_event_loop, sender) = EventLoop::new();
        let trigger = ShutterTrigger::new(sender, Duration::from_millis(150));
        let t0 = Instant::now();
        assert!(trigger.press_at(t0));
        assert!(!trigger.press_at(t0 + Duration::from_millis(100)));
        assert!(trigger.press_at(t0 + Duration::from_millis(200)));
        assert_eq!(trigger.accepted(), 2);
    }

    #[test]
    fn test_presses_from_other_threads() {
        let (_event_loop, sender) = EventLoop::new();
        let trigger = Arc::new(ShutterTrigger::new(sender, Duration::from_secs(60)));
        let handles: Vec<_> = (0..4).map(|_| {
            let trigger = trigger.clone();
            thread::spawn(move || trigger.press())
        }).collect();
        let posted = handles.into_iter().map(|h| h.join().unwrap()).filter(|p| *p).count();
        // Only one press gets through a long debounce window.
        assert_eq!(posted, 1);
        assert_eq!(trigger.accepted(), 1);
    }
}
