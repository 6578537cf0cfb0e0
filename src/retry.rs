//! Bounded retries with truncated exponential backoff.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

/// Sleep observer injected by tests; receives the delay that would have
/// been slept and replaces the actual sleep.
pub type SleepFn = Arc<dyn Fn(Duration) + Send + Sync>;

/// Hard ceiling on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Tunables for a retry loop.
///
/// The model is "n tries, not n retries": a context created from these
/// settings allows `max_tries` failures before [`RetryContext::should_try`]
/// turns false.
#[derive(Clone)]
pub struct RetrySettings {
    pub max_tries: u32,
    /// Skip backoff sleeps entirely (tests).
    pub no_sleep: bool,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    /// Upper bound of the uniform jitter added to every sleep.
    pub jitter: Duration,
    pub sleep: Option<SleepFn>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_tries: 10,
            no_sleep: false,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: Duration::from_secs(1),
            sleep: None,
        }
    }
}

impl fmt::Debug for RetrySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrySettings")
            .field("max_tries", &self.max_tries)
            .field("no_sleep", &self.no_sleep)
            .field("initial_backoff", &self.initial_backoff)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("sleep", &self.sleep.as_ref().map(|_| "{ ... }"))
            .finish()
    }
}

impl RetrySettings {
    #[must_use]
    pub fn max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    #[must_use]
    pub fn no_sleep(mut self, no_sleep: bool) -> Self {
        self.no_sleep = no_sleep;
        self
    }

    #[must_use]
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Install a sleep injector. The injector is called with each computed
    /// delay instead of sleeping.
    #[must_use]
    pub fn sleep_injector(mut self, sleep: SleepFn) -> Self {
        self.sleep = Some(sleep);
        self
    }
}

/// One retry loop's state: an attempt counter and the last cause.
pub struct RetryContext {
    settings: RetrySettings,
    tries: u32,
    pub last_error: Option<Error>,
}

impl RetryContext {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            tries: 0,
            last_error: None,
        }
    }

    /// True until `max_tries` failures have been recorded.
    pub fn should_try(&self) -> bool {
        self.tries < self.settings.max_tries
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Record a failure and back off.
    ///
    /// The delay for the n-th failure is
    /// `initial_backoff * multiplier^(n-1) + uniform(0, jitter)`, truncated
    /// at a fixed ceiling.
    pub async fn retry(&mut self, cause: Error) {
        self.tries += 1;
        tracing::debug!(tries = self.tries, cause = %cause, "retrying");
        self.last_error = Some(cause);

        let delay = backoff_delay(&self.settings, self.tries);
        if let Some(sleep) = &self.settings.sleep {
            sleep(delay);
        } else if !self.settings.no_sleep {
            tokio::time::sleep(delay).await;
        }
    }

    /// Terminal error for an exhausted loop, wrapping the last cause.
    pub fn into_exhausted(self) -> Error {
        let last = self
            .last_error
            .unwrap_or_else(|| Error::Protocol("retry budget of zero tries".to_string()));
        Error::RetriesExhausted {
            tries: self.tries,
            last: Box::new(last),
        }
    }
}

fn backoff_delay(settings: &RetrySettings, tries: u32) -> Duration {
    let exponent = tries.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = settings.initial_backoff.as_secs_f64() * settings.multiplier.powi(exponent);
    let base = Duration::from_secs_f64(secs.min(MAX_BACKOFF.as_secs_f64()).max(0.0));
    base + settings.jitter.mul_f64(rand::random::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn quiet(max_tries: u32) -> RetrySettings {
        RetrySettings::default().max_tries(max_tries).no_sleep(true)
    }

    fn marker() -> Error {
        Error::Protocol("marker".to_string())
    }

    /// Runs a loop that fails `fail_count` times before succeeding and
    /// reports whether the budget covered it.
    async fn run(max_tries: u32, mut fail_count: u32) -> bool {
        let mut ctx = RetryContext::new(quiet(max_tries));
        while ctx.should_try() {
            if fail_count > 0 {
                fail_count -= 1;
                ctx.retry(marker()).await;
                continue;
            }
            return true;
        }
        false
    }

    #[tokio::test]
    async fn tries_not_retries() {
        assert!(run(3, 0).await);
        assert!(run(3, 1).await);
        assert!(run(3, 2).await);
        assert!(!run(3, 3).await);
        assert!(!run(3, 4).await);
    }

    #[tokio::test]
    async fn exhausted_carries_last_cause() {
        let mut ctx = RetryContext::new(quiet(2));
        while ctx.should_try() {
            ctx.retry(marker()).await;
        }
        assert_eq!(ctx.tries(), 2);
        let err = ctx.into_exhausted();
        match err {
            Error::RetriesExhausted { tries: 2, last } => {
                assert!(matches!(*last, Error::Protocol(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn injector_sees_exponential_delays() {
        let seen: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let settings = RetrySettings::default()
            .max_tries(4)
            .initial_backoff(Duration::from_millis(100))
            .multiplier(2.0)
            .jitter(Duration::ZERO)
            .sleep_injector(Arc::new(move |d| sink.lock().unwrap().push(d)));

        let mut ctx = RetryContext::new(settings);
        while ctx.should_try() {
            ctx.retry(marker()).await;
        }

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn backoff_is_truncated() {
        let settings = RetrySettings::default()
            .initial_backoff(Duration::from_secs(1))
            .multiplier(10.0)
            .jitter(Duration::ZERO);
        assert_eq!(backoff_delay(&settings, 40), MAX_BACKOFF);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let settings = RetrySettings::default()
            .initial_backoff(Duration::from_millis(10))
            .multiplier(1.0)
            .jitter(Duration::from_millis(50));
        for _ in 0..64 {
            let d = backoff_delay(&settings, 1);
            assert!(d >= Duration::from_millis(10));
            assert!(d < Duration::from_millis(61));
        }
    }
}
