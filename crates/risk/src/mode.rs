use tokio::sync::{Mutex, RwLock};
use tracing::info;

use common::OperatingMode;

type ModeCallback = Box<dyn Fn(OperatingMode) + Send + Sync>;

/// Owner of the process-wide operating mode. Mode changes fire every
/// registered subscription callback, which the runner and command surface use
/// to react without polling.
pub struct ModeController {
    mode: RwLock<OperatingMode>,
    callbacks: Mutex<Vec<ModeCallback>>,
}

impl ModeController {
    pub fn new(initial: OperatingMode) -> Self {
        Self {
            mode: RwLock::new(initial),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub async fn current(&self) -> OperatingMode {
        *self.mode.read().await
    }

    pub async fn can_accept_new_signals(&self) -> bool {
        self.current().await.can_accept_new_signals()
    }

    pub async fn can_manage_positions(&self) -> bool {
        self.current().await.can_manage_positions()
    }

    pub async fn is_running(&self) -> bool {
        self.current().await.is_running()
    }

    /// Switch modes; no-op (and no callbacks) when already there.
    pub async fn set(&self, next: OperatingMode) {
        {
            let mut mode = self.mode.write().await;
            if *mode == next {
                return;
            }
            info!(from = %*mode, to = %next, "operating mode changed");
            *mode = next;
        }
        for callback in self.callbacks.lock().await.iter() {
            callback(next);
        }
    }

    pub async fn subscribe(&self, callback: impl Fn(OperatingMode) + Send + Sync + 'static) {
        self.callbacks.lock().await.push(Box::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn queries_follow_the_mode() {
        let controller = ModeController::new(OperatingMode::Automatic);
        assert!(controller.can_accept_new_signals().await);
        assert!(controller.can_manage_positions().await);

        controller.set(OperatingMode::MonitorOnly).await;
        assert!(!controller.can_accept_new_signals().await);
        assert!(controller.can_manage_positions().await);

        controller.set(OperatingMode::EmergencyStop).await;
        assert!(!controller.is_running().await);
    }

    #[tokio::test]
    async fn change_fires_subscribers_once_per_transition() {
        let controller = ModeController::new(OperatingMode::Automatic);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        controller
            .subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        controller.set(OperatingMode::Paused).await;
        controller.set(OperatingMode::Paused).await; // no-op
        controller.set(OperatingMode::Automatic).await;

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
