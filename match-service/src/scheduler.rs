// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{Instant, sleep_until},
};

/// A cancellable one-shot timer.
///
/// The callback fires at most once. Firing and cancellation both consume the
/// same one-shot token, so a cancel racing an in-flight expiry resolves to
/// whichever swaps the token first. Callbacks must only enqueue work (a match
/// command), never mutate match state inline.
pub struct Countdown {
    token: Arc<AtomicBool>,
    deadline: Instant,
    join: JoinHandle<()>,
}

impl Countdown {
    pub fn schedule<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + delay;
        let task_token = token.clone();
        let join = tokio::spawn(async move {
            sleep_until(deadline).await;
            if !task_token.swap(true, Ordering::SeqCst) {
                callback();
            }
        });
        Self {
            token,
            deadline,
            join,
        }
    }

    /// No-op if the timer already fired or was already cancelled.
    pub fn cancel(&self) {
        if !self.token.swap(true, Ordering::SeqCst) {
            self.join.abort();
        }
    }

    /// Time left before expiry; zero once the deadline has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// True once the timer has fired or been cancelled.
    pub fn spent(&self) -> bool {
        self.token.load(Ordering::SeqCst)
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.cancel();
    }
}
