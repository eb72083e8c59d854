//! Per-connection stage deadline.

use std::time::Duration;

use tokio::time::Instant;

/// Identifies one arming of a [`StageTimer`].
///
/// Tokens are generation numbers: every [`arm`](StageTimer::arm) produces a
/// new one, so a firing that belongs to an earlier arming can be told apart
/// from the live deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

#[derive(Debug, Clone, Copy)]
struct Pending {
    token: TimerToken,
    deadline: Instant,
}

/// The single cancellable deadline of a connection.
///
/// At most one deadline is pending at any instant. Arming always cancels the
/// previous one first; completing an operation cancels it; and a firing is
/// only honoured if its token is still the pending one.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use httpconn::connection::StageTimer;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut timer = StageTimer::new();
/// let read = timer.arm(Duration::from_secs(30));
///
/// // The read completes first: its deadline is cleared...
/// timer.cancel();
/// // ...so the late firing is ignored.
/// assert!(!timer.fire(read));
/// # }
/// ```
#[derive(Debug, Default)]
pub struct StageTimer {
    generation: u64,
    pending: Option<Pending>,
}

impl StageTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels any pending deadline and arms a new one `timeout` from now.
    pub fn arm(&mut self, timeout: Duration) -> TimerToken {
        self.arm_at(Instant::now() + timeout)
    }

    /// Cancels any pending deadline and arms a new one at `deadline`.
    pub fn arm_at(&mut self, deadline: Instant) -> TimerToken {
        self.cancel();
        self.generation += 1;
        let token = TimerToken(self.generation);
        self.pending = Some(Pending { token, deadline });
        token
    }

    /// Clears the pending deadline, returning its token if there was one.
    pub fn cancel(&mut self) -> Option<TimerToken> {
        self.pending.take().map(|p| p.token)
    }

    /// Returns the pending token and its deadline.
    pub fn pending(&self) -> Option<(TimerToken, Instant)> {
        self.pending.map(|p| (p.token, p.deadline))
    }

    pub fn is_pending(&self, token: TimerToken) -> bool {
        self.pending.is_some_and(|p| p.token == token)
    }

    /// Delivers an expiry for `token`.
    ///
    /// Returns `true` and clears the deadline only if `token` is the pending
    /// one; a stale or repeated firing returns `false` and changes nothing.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        if self.is_pending(token) {
            self.pending = None;
            true
        } else {
            false
        }
    }
}
