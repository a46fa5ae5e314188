//! Circuit breaker for repeated downstream failures
//!
//! Two consumers: the cached price source opens the circuit after
//! consecutive upstream failures so stop scans fail fast instead of
//! stacking timeouts, and the coordinator trips it when the same fill
//! keeps failing fatally, pausing fan-out for operator attention.
//!
//! States: Closed (normal), Open (reject immediately), HalfOpen
//! (probe after the cool-down).

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before it closes again.
    pub success_threshold: u32,
    /// Cool-down before a probe is allowed.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may go through right now. Transitions Open ->
    /// HalfOpen once the cool-down has elapsed.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.consecutive_successes = 0;
                }
                cooled
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        match self.state {
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.opened_at = None;
                }
            }
            CircuitState::Closed => {}
            // A success while Open means the caller bypassed can_attempt;
            // treat it as a probe.
            CircuitState::Open => {
                self.state = CircuitState::HalfOpen;
                self.consecutive_successes = 1;
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_successes = 0;
        match self.state {
            CircuitState::HalfOpen => self.open(),
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open();
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Force the circuit open, regardless of counts.
    pub fn trip(&mut self) {
        self.open();
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
