use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use http::{Method, StatusCode};
use rand::Rng;

use crate::error::Error;
use crate::response::Response;

pub(crate) const DEFAULT_TOTAL_RETRIES: u32 = 10;
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(120);

/// Statuses eligible for `Retry-After`-driven retries even outside the
/// forcelist.
const fn is_retry_after_status(status: u16) -> bool {
    matches!(status, 413 | 429 | 503)
}

fn default_allowed_methods() -> Vec<Method> {
    vec![
        Method::GET,
        Method::HEAD,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
        Method::TRACE,
    ]
}

/// One recorded request attempt: what was tried, and how it ended.
#[derive(Clone, Debug)]
pub struct Attempt {
    pub method: Method,
    pub uri: String,
    pub error: Option<String>,
    pub status: Option<u16>,
    pub redirect_location: Option<String>,
}

/// Immutable retry state: remaining budgets plus the attempt history.
///
/// Every [`increment`] produces a new value; the policy threaded through a
/// request never mutates in place, so concurrent redirected requests cannot
/// share retry state by accident.
///
/// [`increment`]: RetryPolicy::increment
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    total: Option<i32>,
    connect: Option<i32>,
    read: Option<i32>,
    redirect: Option<i32>,
    status: Option<i32>,
    backoff_factor: f64,
    backoff_max: Duration,
    backoff_jitter: f64,
    retry_after_max: Option<Duration>,
    respect_retry_after_header: bool,
    raise_on_redirect: bool,
    raise_on_status: bool,
    allowed_methods: Option<Vec<Method>>,
    status_forcelist: BTreeSet<u16>,
    history: Vec<Attempt>,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            total: Some(DEFAULT_TOTAL_RETRIES as i32),
            connect: None,
            read: None,
            redirect: None,
            status: None,
            backoff_factor: 0.0,
            backoff_max: DEFAULT_BACKOFF_MAX,
            backoff_jitter: 0.0,
            retry_after_max: None,
            respect_retry_after_header: true,
            raise_on_redirect: true,
            raise_on_status: true,
            allowed_methods: Some(default_allowed_methods()),
            status_forcelist: BTreeSet::new(),
            history: Vec::new(),
        }
    }

    /// No retries and no followed redirects: the first failure or redirect is
    /// final.
    pub fn disabled() -> Self {
        Self::standard().total(Some(0))
    }

    pub fn total(mut self, total: Option<u32>) -> Self {
        self.total = total.map(clamp_budget);
        self
    }

    pub fn connect(mut self, connect: Option<u32>) -> Self {
        self.connect = connect.map(clamp_budget);
        self
    }

    pub fn read(mut self, read: Option<u32>) -> Self {
        self.read = read.map(clamp_budget);
        self
    }

    pub fn redirect(mut self, redirect: Option<u32>) -> Self {
        self.redirect = redirect.map(clamp_budget);
        self
    }

    pub fn status(mut self, status: Option<u32>) -> Self {
        self.status = status.map(clamp_budget);
        self
    }

    pub fn backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor.max(0.0);
        self
    }

    pub fn backoff_max(mut self, backoff_max: Duration) -> Self {
        self.backoff_max = backoff_max;
        self
    }

    /// Uniform random addition in `[0, backoff_jitter]` seconds on top of the
    /// computed backoff, still capped by `backoff_max`.
    pub fn backoff_jitter(mut self, backoff_jitter: f64) -> Self {
        self.backoff_jitter = backoff_jitter.max(0.0);
        self
    }

    pub fn retry_after_max(mut self, retry_after_max: Duration) -> Self {
        self.retry_after_max = Some(retry_after_max);
        self
    }

    pub fn respect_retry_after_header(mut self, respect: bool) -> Self {
        self.respect_retry_after_header = respect;
        self
    }

    pub fn raise_on_redirect(mut self, raise_on_redirect: bool) -> Self {
        self.raise_on_redirect = raise_on_redirect;
        self
    }

    pub fn raise_on_status(mut self, raise_on_status: bool) -> Self {
        self.raise_on_status = raise_on_status;
        self
    }

    pub fn allowed_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.allowed_methods = Some(methods.into_iter().collect());
        self
    }

    /// Removes the method gate entirely: every method becomes retryable.
    pub fn allow_all_methods(mut self) -> Self {
        self.allowed_methods = None;
        self
    }

    pub fn status_forcelist(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.status_forcelist = statuses.into_iter().collect();
        self
    }

    pub fn history(&self) -> &[Attempt] {
        &self.history
    }

    pub(crate) const fn configured_respect_retry_after_header(&self) -> bool {
        self.respect_retry_after_header
    }

    pub(crate) const fn configured_raise_on_redirect(&self) -> bool {
        self.raise_on_redirect
    }

    pub(crate) const fn configured_raise_on_status(&self) -> bool {
        self.raise_on_status
    }

    pub fn is_method_allowed(&self, method: &Method) -> bool {
        match &self.allowed_methods {
            None => true,
            Some(methods) => methods.contains(method),
        }
    }

    /// Whether a response with `status` warrants another attempt: the method
    /// must be allowed, and the status must either be in the forcelist or be
    /// Retry-After-eligible with the header present. The two status checks are
    /// independent, OR'd conditions.
    pub fn is_retry(&self, method: &Method, status: StatusCode, has_retry_after: bool) -> bool {
        if !self.is_method_allowed(method) {
            return false;
        }
        let status = status.as_u16();
        if self.status_forcelist.contains(&status) {
            return true;
        }
        self.respect_retry_after_header && has_retry_after && is_retry_after_status(status)
    }

    /// True once any defined budget has dropped below zero.
    pub fn is_exhausted(&self) -> bool {
        [self.total, self.connect, self.read, self.redirect, self.status]
            .into_iter()
            .flatten()
            .any(|budget| budget < 0)
    }

    /// Exponential backoff over the run of consecutive non-redirect attempts
    /// at the tail of the history: zero until there have been at least two,
    /// then `backoff_factor * 2^(n-1)` (jittered, capped). A redirect resets
    /// the run; a redirect is not a failure.
    pub fn get_backoff_time(&self) -> Duration {
        let consecutive_errors = self
            .history
            .iter()
            .rev()
            .take_while(|attempt| attempt.redirect_location.is_none())
            .count();
        if consecutive_errors <= 1 {
            return Duration::ZERO;
        }

        let exponent = (consecutive_errors - 1).min(62) as i32;
        let mut backoff = self.backoff_factor * (2_f64).powi(exponent);
        if self.backoff_jitter > 0.0 {
            backoff += rand::rng().random_range(0.0..=self.backoff_jitter);
        }
        Duration::from_secs_f64(backoff.clamp(0.0, self.backoff_max.as_secs_f64()))
    }

    /// Parses a `Retry-After` value (integer seconds or HTTP-date), clamped
    /// to `retry_after_max`. Negative or unparseable input yields `None`
    /// (fall back to computed backoff).
    pub fn parse_retry_after(&self, value: &str, now: SystemTime) -> Option<Duration> {
        let raw = value.trim();
        let wait = if let Ok(seconds) = raw.parse::<i64>() {
            if seconds < 0 {
                return None;
            }
            Duration::from_secs(seconds as u64)
        } else {
            let date = httpdate::parse_http_date(raw).ok()?;
            match date.duration_since(now) {
                Ok(duration) => duration,
                Err(_) => Duration::ZERO,
            }
        };
        Some(match self.retry_after_max {
            Some(max) => wait.min(max),
            None => wait,
        })
    }

    /// Classifies one finished attempt, consumes the matching budgets, and
    /// returns the successor policy value, or [`Error::MaxRetriesExceeded`]
    /// when the successor would already be exhausted. Exactly one of `error`
    /// and `response` should be provided.
    pub fn increment(
        &self,
        method: &Method,
        uri: &str,
        error: Option<&Error>,
        response: Option<&Response>,
    ) -> Result<RetryPolicy, Error> {
        let mut next = self.clone();
        if let Some(total) = next.total.as_mut() {
            *total -= 1;
        }

        let mut cause = "unclassified error".to_owned();
        let mut status = None;
        let mut redirect_location = None;
        let error_text = error.map(|error| error.to_string());

        if let Some(error) = error {
            if error.is_connect_class() {
                if let Some(connect) = next.connect.as_mut() {
                    *connect -= 1;
                }
                cause = format!("connect error ({})", error.code().as_str());
            } else if error.is_read_class() {
                if let Some(read) = next.read.as_mut() {
                    *read -= 1;
                }
                cause = format!("read error ({})", error.code().as_str());
            }
            // Other error classes only consume the total budget.
        } else if let Some(response) = response {
            status = Some(response.status().as_u16());
            if let Some(location) = response.redirect_location() {
                if let Some(redirect) = next.redirect.as_mut() {
                    *redirect -= 1;
                }
                cause = "too many redirects".to_owned();
                redirect_location = Some(location);
            } else {
                if let Some(budget) = next.status.as_mut() {
                    *budget -= 1;
                }
                cause = format!("response status {}", response.status().as_u16());
            }
        }

        next.history.push(Attempt {
            method: method.clone(),
            uri: uri.to_owned(),
            error: error_text,
            status,
            redirect_location,
        });

        if next.is_exhausted() {
            return Err(Error::MaxRetriesExceeded {
                method: method.clone(),
                uri: uri.to_owned(),
                cause,
                history: next.history,
            });
        }
        Ok(next)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Shorthand: a plain count caps the total budget.
impl From<u32> for RetryPolicy {
    fn from(total: u32) -> Self {
        Self::standard().total(Some(total))
    }
}

/// Shorthand: `true` means the standard policy, `false` disables retries.
impl From<bool> for RetryPolicy {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::standard()
        } else {
            Self::disabled()
        }
    }
}

fn clamp_budget(budget: u32) -> i32 {
    budget.min(i32::MAX as u32) as i32
}
