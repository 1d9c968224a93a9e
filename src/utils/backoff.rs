use std::time::{Duration, Instant};

/// Growing retry delay: starts at `initial`, multiplies by `factor`, capped at `max`
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            factor: 1.5,
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    pub fn delays(&self) -> Delays {
        Delays {
            next: self.initial,
            factor: self.factor,
            max: self.max,
        }
    }
}

pub struct Delays {
    next: Duration,
    factor: f64,
    max: Duration,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.min(self.max);
        self.next = self.next.mul_f64(self.factor).min(self.max);
        Some(current)
    }
}

/// Poll `check` until it yields a value or `timeout` elapses
pub fn retry_until<T, F>(timeout: Duration, backoff: Backoff, mut check: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline = Instant::now() + timeout;
    let mut delays = backoff.delays();
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let delay = delays.next().unwrap_or(backoff.max);
        std::thread::sleep(delay.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_grows_and_caps() {
        let delays: Vec<f64> = Backoff::default()
            .delays()
            .take(7)
            .map(|d| d.as_secs_f64())
            .collect();
        assert_eq!(delays[0], 2.0);
        assert_eq!(delays[1], 3.0);
        assert_eq!(delays[2], 4.5);
        assert_eq!(delays[3], 6.75);
        assert!((delays[4] - 10.0).abs() < 1e-9);
        assert!((delays[6] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_retry_until_returns_first_success() {
        let backoff = Backoff {
            initial: Duration::from_millis(1),
            factor: 1.0,
            max: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result = retry_until(Duration::from_secs(5), backoff, || {
            calls += 1;
            (calls == 3).then_some("10.8.0.6")
        });
        assert_eq!(result, Some("10.8.0.6"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_until_gives_up_after_timeout() {
        let backoff = Backoff {
            initial: Duration::from_millis(5),
            factor: 2.0,
            max: Duration::from_millis(20),
        };
        let started = Instant::now();
        let result: Option<()> = retry_until(Duration::from_millis(50), backoff, || None);
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
