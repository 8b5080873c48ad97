use std::sync::Arc;
use std::thread;

use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::{error, warn};

use crate::lock::{CancelToken, LockCoordinator};

/// On SIGINT/SIGTERM: stop any waiting acquire, drop the markers this
/// process wrote, exit 130.
pub fn signal_handler(cancel: &CancelToken, coordinator: &Arc<LockCoordinator>) {
    let cancel = cancel.clone();
    let coordinator = coordinator.clone();
    thread::spawn(move || {
        let mut signals = match Signals::new([SIGINT, SIGTERM]) {
            Ok(signals) => signals,
            Err(err) => {
                error!("signal handler setup failed: {}", err);
                return;
            }
        };
        if let Some(signal) = signals.forever().next() {
            warn!("received signal {}, releasing locks", signal);
            cancel.cancel();
            if let Err(err) = coordinator.release_tracked() {
                error!("releasing locks failed: {}", err);
            }
            std::process::exit(130);
        }
    });
}
