use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaverEvent {
    /// Presence detected near the frame.
    Motion,
    /// Explicit request to switch the screen on.
    TurnOn,
    /// Explicit request to switch the screen off.
    TurnOff,
    /// The idle deadline may have passed.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
}

/// Tracks whether the screen should be lit.
///
/// The screen starts on with a running idle deadline. Motion keeps pushing the
/// deadline out; once it passes without motion the screen goes dark. A manual
/// "off" wins over motion until a manual "on" clears it.
#[derive(Debug, Clone)]
pub struct ScreenSaver {
    idle_timeout: Duration,
    screen_on: bool,
    manual_off: bool,
    deadline: Option<Instant>,
}

impl ScreenSaver {
    pub fn new(idle_timeout: Duration, now: Instant) -> Self {
        Self {
            idle_timeout,
            screen_on: true,
            manual_off: false,
            deadline: Some(now + idle_timeout),
        }
    }

    pub fn screen_on(&self) -> bool {
        self.screen_on
    }

    pub fn manual_off(&self) -> bool {
        self.manual_off
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn time_until_deadline(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Applies `event` and returns the power change it requires, if any.
    pub fn on_event(&mut self, event: SaverEvent, now: Instant) -> Option<PowerAction> {
        match event {
            SaverEvent::Motion => {
                self.deadline = Some(now + self.idle_timeout);
                if self.manual_off {
                    return None;
                }
                self.switch(true)
            }
            SaverEvent::TurnOn => {
                self.manual_off = false;
                self.deadline = Some(now + self.idle_timeout);
                self.switch(true)
            }
            SaverEvent::TurnOff => {
                self.manual_off = true;
                self.deadline = None;
                self.switch(false)
            }
            SaverEvent::Timeout => match self.deadline {
                Some(deadline) if now >= deadline => {
                    self.deadline = None;
                    self.switch(false)
                }
                _ => None,
            },
        }
    }

    fn switch(&mut self, on: bool) -> Option<PowerAction> {
        if self.screen_on == on {
            return None;
        }
        self.screen_on = on;
        Some(if on { PowerAction::On } else { PowerAction::Off })
    }
}
