//! App event loop: button handling, deferred-eviction delivery and the
//! factory-reset trigger.
//!
//! Events funnel through one bounded queue so handlers never run from
//! signal context. The reset flow mimics the physical button: hold for
//! three seconds to schedule the reset, then a three-second cancel window
//! in which releasing the button aborts it.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SoilError;
use crate::fabric::FabricRuntime;
use crate::fabric::services::KeyValueStore;
use crate::fabric::types::FabricIndex;

/// Bounded depth of the app event queue.
pub const EVENT_QUEUE_SIZE: usize = 10;

/// Hold time before a factory reset is scheduled.
pub const FACTORY_RESET_TRIGGER_TIMEOUT: Duration = Duration::from_secs(3);

/// Window in which releasing the button cancels the scheduled reset.
pub const FACTORY_RESET_CANCEL_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    ButtonPressed,
    ButtonReleased,
    ResetTimerExpired,
    EvictionDue(FabricIndex),
    FactoryResetRequested,
}

pub fn event_channel() -> (mpsc::Sender<AppEvent>, mpsc::Receiver<AppEvent>) {
    mpsc::channel(EVENT_QUEUE_SIZE)
}

/// Non-blocking enqueue used from timers and signal context. A full queue
/// drops the event with a warning; a closed queue means shutdown.
pub(crate) fn try_push(events: &mpsc::Sender<AppEvent>, event: AppEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        warn!("{}, dropping {event:?}", SoilError::EventQueueFull);
    }
}

/// What the event loop must do after a button state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetAction {
    None,
    ArmTimer(Duration),
    CancelTimer,
    Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetButtonState {
    Idle,
    /// Button held, trigger timer running.
    Armed,
    /// Reset scheduled, cancel window running.
    CancelWindow,
}

/// Hold-to-reset state machine. Pure transitions; timers live with the
/// caller so the machine is trivially testable.
pub struct ResetButton {
    state: ResetButtonState,
}

impl Default for ResetButton {
    fn default() -> Self {
        Self::new()
    }
}

impl ResetButton {
    pub fn new() -> Self {
        Self {
            state: ResetButtonState::Idle,
        }
    }

    pub fn on_pressed(&mut self) -> ResetAction {
        match self.state {
            ResetButtonState::Idle => {
                self.state = ResetButtonState::Armed;
                ResetAction::ArmTimer(FACTORY_RESET_TRIGGER_TIMEOUT)
            }
            // Duplicate press events (bounce) change nothing.
            ResetButtonState::Armed | ResetButtonState::CancelWindow => ResetAction::None,
        }
    }

    pub fn on_released(&mut self) -> ResetAction {
        match self.state {
            ResetButtonState::Idle => ResetAction::None,
            ResetButtonState::Armed => {
                self.state = ResetButtonState::Idle;
                ResetAction::CancelTimer
            }
            ResetButtonState::CancelWindow => {
                info!("Factory reset canceled");
                self.state = ResetButtonState::Idle;
                ResetAction::CancelTimer
            }
        }
    }

    pub fn on_timer_expired(&mut self) -> ResetAction {
        match self.state {
            // Stale fire after a cancel.
            ResetButtonState::Idle => ResetAction::None,
            ResetButtonState::Armed => {
                info!(
                    "Factory reset scheduled, release the button within {:?} to cancel",
                    FACTORY_RESET_CANCEL_WINDOW
                );
                self.state = ResetButtonState::CancelWindow;
                ResetAction::ArmTimer(FACTORY_RESET_CANCEL_WINDOW)
            }
            ResetButtonState::CancelWindow => {
                self.state = ResetButtonState::Idle;
                ResetAction::Trigger
            }
        }
    }
}

/// Single-shot timer feeding `ResetTimerExpired` back into the queue.
struct ResetTimer {
    events: mpsc::Sender<AppEvent>,
    pending: Option<CancellationToken>,
}

impl ResetTimer {
    fn new(events: mpsc::Sender<AppEvent>) -> Self {
        Self {
            events,
            pending: None,
        }
    }

    fn arm(&mut self, delay: Duration) {
        self.cancel();
        let token = CancellationToken::new();
        self.pending = Some(token.clone());
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    try_push(&events, AppEvent::ResetTimerExpired);
                }
            }
        });
    }

    fn cancel(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }
}

/// Forward SIGUSR1/SIGUSR2 as button press/release events.
///
/// Stands in for the board button on a headless host: `kill -USR1` holds
/// the button down, `kill -USR2` releases it.
pub fn spawn_signal_listener(events: mpsc::Sender<AppEvent>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let (Ok(mut pressed), Ok(mut released)) = (
            signal(SignalKind::user_defined1()),
            signal(SignalKind::user_defined2()),
        ) else {
            error!("Failed to install signal handlers, button input disabled");
            return;
        };

        loop {
            let event = tokio::select! {
                _ = pressed.recv() => AppEvent::ButtonPressed,
                _ = released.recv() => AppEvent::ButtonReleased,
            };
            try_push(&events, event);
        }
    });
}

/// Main event loop. Returns when a factory reset has run; the caller is
/// expected to exit the process afterwards.
pub async fn run_app_loop(
    mut events: mpsc::Receiver<AppEvent>,
    sender: mpsc::Sender<AppEvent>,
    runtime: Arc<FabricRuntime>,
    kv_store: Arc<dyn KeyValueStore>,
) {
    let mut button = ResetButton::new();
    let mut timer = ResetTimer::new(sender.clone());

    while let Some(event) = events.recv().await {
        let action = match event {
            AppEvent::ButtonPressed => button.on_pressed(),
            AppEvent::ButtonReleased => button.on_released(),
            AppEvent::ResetTimerExpired => button.on_timer_expired(),
            AppEvent::EvictionDue(victim) => {
                runtime.handle_eviction_due(victim);
                ResetAction::None
            }
            AppEvent::FactoryResetRequested => ResetAction::Trigger,
        };

        match action {
            ResetAction::None => {}
            ResetAction::ArmTimer(delay) => timer.arm(delay),
            ResetAction::CancelTimer => timer.cancel(),
            ResetAction::Trigger => {
                info!("Factory reset triggered");
                runtime.factory_reset();
                if let Err(err) = kv_store.flush() {
                    error!("Settings flush after wipe failed: {err}");
                }
                return;
            }
        }
    }
}
