use tokio::time::{Duration, Instant};

/// Hub-side state of the call in progress. Created on `call_confirmed`, dropped on
/// `call_disconnected`.
#[derive(Debug, Clone)]
pub struct CallState {
    pub remote_uri: String,
    pub started_at: Instant,
    /// DM acts seen during the call; `None` once hard limits no longer apply.
    pub turns: Option<u32>,
    pub system_speaking: bool,
    /// `None` until the system has said anything.
    pub system_last_speech: Option<Instant>,
    pub user_speaking: bool,
    pub user_last_speech: Instant,
    pub user_last_timeout: Instant,
    pub hangup_pending: bool,
}

impl CallState {
    /// A fresh call that starts with a dialogue.
    pub fn accepted(remote_uri: String, now: Instant) -> Self {
        Self {
            remote_uri,
            started_at: now,
            turns: Some(0),
            system_speaking: false,
            system_last_speech: None,
            user_speaking: false,
            user_last_speech: now,
            user_last_timeout: now,
            hangup_pending: false,
        }
    }

    /// A call that only hears the limit message and is then hung up.
    pub fn over_limit(remote_uri: String, now: Instant) -> Self {
        Self {
            turns: None,
            system_speaking: true,
            system_last_speech: Some(now),
            hangup_pending: true,
            ..Self::accepted(remote_uri, now)
        }
    }

    pub fn since_system_speech(&self, now: Instant) -> Duration {
        self.system_last_speech
            .map_or(Duration::MAX, |t| now.saturating_duration_since(t))
    }

    pub fn count_turn(&mut self) {
        if let Some(turns) = self.turns.as_mut() {
            *turns += 1;
        }
    }

    /// Silence long enough on both sides, and since the previous timeout, to tell the DM.
    pub fn input_timeout(&self, now: Instant, limit: Duration) -> Option<Duration> {
        if self.system_speaking || self.user_speaking {
            return None;
        }
        let ds = self.since_system_speech(now);
        let du = now.saturating_duration_since(self.user_last_speech);
        let dt = now.saturating_duration_since(self.user_last_timeout);
        (ds > limit && du > limit && dt > limit).then(|| ds.min(du))
    }

    pub fn over_hard_limits(&self, now: Instant, max_time: Duration, max_turns: u32) -> bool {
        match self.turns {
            Some(turns) => {
                now.saturating_duration_since(self.started_at) > max_time || turns > max_turns
            }
            None => false,
        }
    }
}
