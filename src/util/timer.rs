use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A thread calling a closure at a fixed interval until the handle is
/// dropped. The ARP and fragment caches tick at 1 Hz, the TCP timer
/// wheel at 5 Hz.
pub struct RepeatingTimer {
    stop: Arc<AtomicBool>,
}

impl RepeatingTimer {
    pub fn spawn<F>(interval: Duration, mut tick: F) -> RepeatingTimer
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        thread::spawn(move || loop {
            thread::sleep(interval);
            if thread_stop.load(Ordering::Relaxed) {
                break;
            }
            tick();
        });
        RepeatingTimer { stop }
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn ticks_until_dropped() {
        let count = Arc::new(AtomicUsize::new(0));
        let timer = {
            let count = count.clone();
            RepeatingTimer::spawn(Duration::from_millis(10), move || {
                count.fetch_add(1, Ordering::Relaxed);
            })
        };
        thread::sleep(Duration::from_millis(100));
        assert!(count.load(Ordering::Relaxed) >= 2);
        drop(timer);
        thread::sleep(Duration::from_millis(30));
        let after_drop = count.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        assert!(count.load(Ordering::Relaxed) <= after_drop + 1);
    }
}
