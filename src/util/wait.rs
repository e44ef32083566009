use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct State {
    notified: bool,
    dead: bool,
}

/// Blocking rendezvous between the socket API and the packet pipeline.
///
/// A `Wait` has three operations: `sleep_on` blocks the caller until
/// either `wake_up` (returns `true`, resume normally) or `exit`
/// (returns `false`, the peer or a close tore the wait down).
/// `wake_up` is idempotent; a notify issued before anyone sleeps is
/// consumed by the next `sleep_on`. `exit` is terminal: every
/// subsequent `sleep_on` returns `false` immediately.
pub struct Wait {
    state: Mutex<State>,
    cond: Condvar,
}

impl Wait {
    pub fn new() -> Wait {
        Wait {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    /// Release one sleeper, or leave a pending notify for the next one.
    /// Returns `false` if the wait has already been torn down.
    pub fn wake_up(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.dead {
            return false;
        }
        if !state.notified {
            state.notified = true;
            self.cond.notify_one();
        }
        true
    }

    /// Block until woken. `true` means a normal wake-up, `false` that
    /// the wait was exited.
    pub fn sleep_on(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while !state.notified && !state.dead {
            state = self.cond.wait(state).unwrap();
        }
        if state.dead {
            return false;
        }
        state.notified = false;
        true
    }

    /// Tear the wait down, releasing every sleeper with `false`.
    pub fn exit(&self) {
        let mut state = self.state.lock().unwrap();
        if state.dead {
            return;
        }
        state.dead = true;
        self.cond.notify_all();
    }
}

impl Default for Wait {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn pending_notify_consumed_by_next_sleep() {
        let wait = Wait::new();
        assert!(wait.wake_up());
        assert!(wait.wake_up());
        assert!(wait.sleep_on());
    }

    #[test]
    fn exit_releases_sleeper_with_false() {
        let wait = Arc::new(Wait::new());
        let sleeper = {
            let wait = wait.clone();
            thread::spawn(move || wait.sleep_on())
        };
        thread::sleep(Duration::from_millis(50));
        wait.exit();
        assert!(!sleeper.join().unwrap());
    }

    #[test]
    fn exit_is_terminal() {
        let wait = Wait::new();
        wait.exit();
        assert!(!wait.sleep_on());
        assert!(!wait.wake_up());
        assert!(!wait.sleep_on());
    }

    #[test]
    fn wake_releases_sleeper() {
        let wait = Arc::new(Wait::new());
        let sleeper = {
            let wait = wait.clone();
            thread::spawn(move || wait.sleep_on())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(wait.wake_up());
        assert!(sleeper.join().unwrap());
    }
}
