// Start/stop state shared between the control surface and the stream

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Running/stopped flag for one streaming session.
///
/// Clones share the same flag: the UI keeps one to call `start`/`stop`, the
/// controller keeps another and reads it between frames. Starts stopped.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    running: Arc<AtomicBool>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("Emotion analysis started");
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Emotion analysis stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_stopped() {
        assert!(!SessionState::new().is_running());
    }

    #[test]
    fn clones_share_the_flag() {
        let ui = SessionState::new();
        let controller = ui.clone();
        ui.start();
        assert!(controller.is_running());
        ui.stop();
        assert!(!controller.is_running());
        // Repeated calls are harmless.
        ui.stop();
        assert!(!controller.is_running());
    }
}
