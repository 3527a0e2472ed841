//! Expiry sweeper
//!
//! A timer task that periodically removes expired sessions (running the
//! expiry hook for each), expired remember-me tokens, and stale limiter
//! buckets.
//!
//! At most one timer runs at a time. Stopping it only suppresses future
//! ticks: a sweep already in progress runs to completion.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::services::auth_token::{AuthTokenError, AuthTokenManager};
use crate::services::rate_limiter::AttemptLimiter;
use crate::services::session::{SessionError, SessionManager};

/// Work run on every tick
pub type SweepFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub auth_tokens: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    AuthToken(#[from] AuthTokenError),
}

struct Timer {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ExpirySweeper {
    sessions: Arc<SessionManager>,
    auth_tokens: Arc<AuthTokenManager>,
    limiters: Vec<Arc<dyn AttemptLimiter>>,
    timer: Mutex<Option<Timer>>,
}

impl ExpirySweeper {
    pub fn new(
        sessions: Arc<SessionManager>,
        auth_tokens: Arc<AuthTokenManager>,
        limiters: Vec<Arc<dyn AttemptLimiter>>,
    ) -> Self {
        Self {
            sessions,
            auth_tokens,
            limiters,
            timer: Mutex::new(None),
        }
    }

    /// Remove everything that has expired.
    ///
    /// Expired sessions are deleted in bulk, purged from the cache, then
    /// handed to the expiry hook one at a time.
    pub async fn clear_old_sessions(&self) -> Result<SweepReport, SweepError> {
        sweep(&self.sessions, &self.auth_tokens, &self.limiters).await
    }

    /// Start, restart or (with `None`) stop the sweep timer
    pub fn set_session_clear_interval(&self, period: Option<Duration>) {
        let sweep_fn = self.default_sweep_fn();
        self.set_session_clear_interval_with(period, sweep_fn);
    }

    /// Like [`set_session_clear_interval`](Self::set_session_clear_interval)
    /// with a custom tick body
    pub fn set_session_clear_interval_with(&self, period: Option<Duration>, sweep_fn: SweepFn) {
        let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = slot.take() {
            // The old task exits at its next tick boundary
            let _ = previous.stop.send(());
        }

        let Some(period) = period.filter(|p| !p.is_zero()) else {
            tracing::info!("Session sweeper stopped");
            return;
        };

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_timer(period, sweep_fn, stop_rx));
        *slot = Some(Timer { stop, task });

        tracing::info!(period_secs = period.as_secs_f64(), "Session sweeper started");
    }

    /// Stop the timer, returning its task so the caller can wait for an
    /// in-flight sweep to finish
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let _ = timer.stop.send(());
        Some(timer.task)
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|timer| !timer.task.is_finished())
    }

    fn default_sweep_fn(&self) -> SweepFn {
        let sessions = self.sessions.clone();
        let auth_tokens = self.auth_tokens.clone();
        let limiters = self.limiters.clone();

        Arc::new(move || {
            let sessions = sessions.clone();
            let auth_tokens = auth_tokens.clone();
            let limiters = limiters.clone();
            Box::pin(async move {
                match sweep(&sessions, &auth_tokens, &limiters).await {
                    Ok(report) if report != SweepReport::default() => {
                        tracing::info!(
                            sessions = report.sessions,
                            auth_tokens = report.auth_tokens,
                            "Expired credentials swept"
                        );
                    }
                    Ok(_) => tracing::debug!("Sweep found nothing to remove"),
                    Err(e) => tracing::warn!(error = %e, "Session sweep failed"),
                }
            })
        })
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = timer.stop.send(());
        }
    }
}

async fn sweep(
    sessions: &SessionManager,
    auth_tokens: &AuthTokenManager,
    limiters: &[Arc<dyn AttemptLimiter>],
) -> Result<SweepReport, SweepError> {
    let sessions = sessions.delete_expired_sessions().await?;
    let auth_tokens = auth_tokens.delete_expired_tokens().await?;
    for limiter in limiters {
        limiter.cleanup().await;
    }
    Ok(SweepReport {
        sessions,
        auth_tokens,
    })
}

async fn run_timer(period: Duration, sweep_fn: SweepFn, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }
        // Runs outside the select so a stop request never cancels it
        sweep_fn().await;
    }
}
