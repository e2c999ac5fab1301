pub mod capture;
pub mod playback;

use std::any::Any;
use std::thread::{self, JoinHandle};

/// Join a dispatcher unless called from that dispatcher itself.
pub(crate) fn join_dispatcher(handle: JoinHandle<()>, name: &str) {
    if handle.thread().id() == thread::current().id() {
        log::warn!("{} dispatcher asked to join itself; detaching", name);
        return;
    }
    if handle.join().is_err() {
        log::error!("{} dispatcher panicked", name);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "consumer panicked".into()
    }
}

#[cfg(test)]
pub(crate) fn wait_for(mut condition: impl FnMut() -> bool) {
    use std::time::{Duration, Instant};

    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached within 5s");
        thread::sleep(Duration::from_millis(1));
    }
}
