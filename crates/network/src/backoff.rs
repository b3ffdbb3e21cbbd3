// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2025 Danmu Console Developers. All rights reserved.
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Exponential backoff with jitter for reconnect scheduling.
//!
//! Delays grow by a configurable factor up to a cap, with random jitter added
//! to avoid synchronized reconnection storms across clients. An
//! "immediate first" flag lets the very first reconnect attempt fire without
//! any delay, which suits dropped-connection recovery where the outage is
//! usually transient.

use std::time::Duration;

use rand::RngExt;

/// Computes successive delays for reconnect attempts.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// The delay used for the first (non-immediate) attempt.
    delay_initial: Duration,
    /// Upper bound applied to the growing delay.
    delay_max: Duration,
    /// The base delay for the next attempt.
    delay_current: Duration,
    /// Growth factor applied after each attempt.
    factor: f64,
    /// Maximum random jitter added to each delay (milliseconds).
    jitter_ms: u64,
    /// Whether the next call to `next_duration` returns zero delay.
    immediate_first: bool,
}

impl ExponentialBackoff {
    /// Creates a new [`ExponentialBackoff`] instance.
    #[must_use]
    pub const fn new(
        delay_initial: Duration,
        delay_max: Duration,
        factor: f64,
        jitter_ms: u64,
        immediate_first: bool,
    ) -> Self {
        Self {
            delay_initial,
            delay_max,
            delay_current: delay_initial,
            factor,
            jitter_ms,
            immediate_first,
        }
    }

    /// Returns the next backoff delay with jitter and advances the internal state.
    ///
    /// If `immediate_first` is set and the backoff has not been advanced yet,
    /// returns `Duration::ZERO` once and disables the immediate behavior.
    pub fn next_duration(&mut self) -> Duration {
        if self.immediate_first && self.delay_current == self.delay_initial {
            self.immediate_first = false;
            return Duration::ZERO;
        }

        let jitter = rand::rng().random_range(0..=self.jitter_ms);
        let delay_with_jitter = self.delay_current + Duration::from_millis(jitter);

        let current_nanos = self.delay_current.as_nanos();
        let max_nanos = self.delay_max.as_nanos() as u64;
        let next_nanos = (current_nanos as f64 * self.factor) as u64;
        self.delay_current = Duration::from_nanos(std::cmp::min(next_nanos, max_nanos));

        delay_with_jitter
    }

    /// Resets the backoff to its initial state, typically after a successful
    /// reconnect.
    pub const fn reset(&mut self) {
        self.delay_current = self.delay_initial;
    }

    /// Returns the base delay for the next attempt, before jitter.
    #[must_use]
    pub const fn current_delay(&self) -> Duration {
        self.delay_current
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_exponential_growth_and_cap() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            2.0,
            0,
            false,
        );

        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
        assert_eq!(backoff.next_duration(), Duration::from_millis(200));
        assert_eq!(backoff.next_duration(), Duration::from_millis(400));
        assert_eq!(backoff.next_duration(), Duration::from_millis(800));
        // Capped from here on
        assert_eq!(backoff.next_duration(), Duration::from_millis(800));
    }

    #[rstest]
    fn test_reset_restores_initial_delay() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(1600),
            2.0,
            0,
            false,
        );

        let _ = backoff.next_duration();
        let _ = backoff.next_duration();
        backoff.reset();

        assert_eq!(backoff.current_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
    }

    #[rstest]
    fn test_jitter_stays_within_bounds() {
        for _ in 0..10 {
            let mut backoff = ExponentialBackoff::new(
                Duration::from_millis(100),
                Duration::from_millis(1000),
                2.0,
                50,
                false,
            );
            let base = backoff.current_delay();
            let delay = backoff.next_duration();
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(50));
        }
    }

    #[rstest]
    fn test_immediate_first_returns_zero_once() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(1600),
            2.0,
            0,
            true,
        );

        assert_eq!(backoff.next_duration(), Duration::ZERO);
        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
        assert_eq!(backoff.next_duration(), Duration::from_millis(200));
    }

    #[rstest]
    fn test_fractional_factor() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(200),
            1.5,
            0,
            false,
        );

        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
        assert_eq!(backoff.next_duration(), Duration::from_millis(150));
        // 150 * 1.5 = 225 capped to 200
        assert_eq!(backoff.next_duration(), Duration::from_millis(200));
    }
}
