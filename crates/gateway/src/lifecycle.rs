//! One-shot `Running -> Stopping -> Stopped` state machine.

use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Stopping,
    Stopped,
}

/// Lifecycle of a gateway.
///
/// Exactly one caller wins [`Lifecycle::begin_stop`]; every other caller,
/// concurrent or later, gets [`Error::Stopped`] immediately. Winning the
/// transition cancels [`Lifecycle::token`], which every background loop and
/// in-flight dial selects on.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<State>,
    shutdown: CancellationToken,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Running),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Ok` while running, [`Error::Stopped`] once a stop has been claimed.
    pub fn ensure_running(&self) -> Result<()> {
        match self.state() {
            State::Running => Ok(()),
            State::Stopping | State::Stopped => Err(Error::Stopped),
        }
    }

    /// Claim the `Running -> Stopping` transition and broadcast cancellation.
    pub fn begin_stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != State::Running {
                return Err(Error::Stopped);
            }
            *state = State::Stopping;
        }
        self.shutdown.cancel();
        Ok(())
    }

    /// Mark teardown complete. Only meaningful after a successful `begin_stop`.
    pub fn finish_stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert_eq!(*state, State::Stopping);
        *state = State::Stopped;
    }

    /// Cancelled when the stop is claimed.
    pub fn token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;

    #[test]
    fn full_transition() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), State::Running);
        lifecycle.ensure_running().unwrap();

        lifecycle.begin_stop().unwrap();
        assert_eq!(lifecycle.state(), State::Stopping);
        assert!(lifecycle.token().is_cancelled());
        assert!(matches!(lifecycle.ensure_running(), Err(Error::Stopped)));

        lifecycle.finish_stop();
        assert_eq!(lifecycle.state(), State::Stopped);
    }

    #[test]
    fn second_stop_is_sentinel() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_stop().unwrap();
        assert!(matches!(lifecycle.begin_stop(), Err(Error::Stopped)));
        lifecycle.finish_stop();
        assert!(matches!(lifecycle.begin_stop(), Err(Error::Stopped)));
    }

    #[test]
    fn concurrent_stop_has_one_winner() {
        let lifecycle = Arc::new(Lifecycle::new());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    lifecycle.begin_stop().is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn token_wakes_waiters() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = {
            let token = lifecycle.token().clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        lifecycle.begin_stop().unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
