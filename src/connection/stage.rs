//! The connection state machine as a pure transition function.
//!
//! [`step`] maps `(current stage, completion)` to the next stage and the side
//! effect the driver must perform next. It knows nothing about sockets,
//! timers or tasks, which keeps the ordering rules testable on their own:
//!
//! ```text
//! Idle ─Start─▶ ReadingRequest ─HeadComplete{0}─▶ Dispatching ─Dispatched─▶ WritingResponse
//!                    │   ▲                            ▲                        │      │
//!                    │   └─NeedMore                   │                 reuse  │      │ no reuse
//!          HeadComplete{n}                            │                        ▼      ▼
//!                    ▼                                │                      Idle   Closing
//!               ReadingBody ─────BodyComplete─────────┘
//! ```
//!
//! `Stop`, `Failed` and `TimedOut` lead to `Closing` from any live stage, and
//! every completion delivered to `Closing` is absorbed without effect.

use std::fmt;

/// One phase of a connection's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Idle,
    ReadingRequest,
    ReadingBody,
    Dispatching,
    WritingResponse,
    Closing,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ReadingRequest => "reading-request",
            Self::ReadingBody => "reading-body",
            Self::Dispatching => "dispatching",
            Self::WritingResponse => "writing-response",
            Self::Closing => "closing",
        }
    }

    pub fn is_closing(self) -> bool {
        self == Self::Closing
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of whatever the connection did last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The connection is ready to read a request.
    Start,
    /// A request head was parsed; `body` is its declared body length.
    HeadComplete { body: usize },
    /// A read succeeded but the head or body is still short.
    NeedMore,
    /// The declared body is fully buffered.
    BodyComplete,
    /// The request was refused before dispatch; an error response is queued.
    Rejected,
    /// The handler produced a response.
    Dispatched,
    /// The whole response was written.
    Written { reuse: bool },
    /// End of stream, transport error or handler panic.
    Failed,
    /// The stage deadline elapsed.
    TimedOut,
    /// A stop was requested.
    Stop,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Arm the request timeout and read a request head.
    ReadRequest,
    /// Arm the body timeout and read body bytes.
    ReadBody,
    /// Read again under the deadline already armed for this stage.
    ContinueRead,
    /// Hand the buffered request to the handler.
    Dispatch,
    /// Arm the write timeout and write the queued response.
    WriteResponse,
    /// Reset per-request state, then start over.
    Recycle,
    /// Tear the connection down.
    Close,
    /// Nothing left to do.
    None,
}

/// A stage change paired with the effect that enters it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: Stage,
    pub effect: Effect,
}

impl Transition {
    const fn to(next: Stage, effect: Effect) -> Self {
        Self { next, effect }
    }
}

/// Computes the transition for `completion` observed in `stage`.
///
/// A completion that makes no sense for `stage` closes the connection rather
/// than being ignored, so a driver bug can never leave a socket half-served.
pub fn step(stage: Stage, completion: Completion) -> Transition {
    use Completion as C;
    use Effect as E;
    use Stage as S;

    match (stage, completion) {
        (S::Closing, _) => Transition::to(S::Closing, E::None),
        (_, C::Stop | C::Failed | C::TimedOut) => Transition::to(S::Closing, E::Close),

        (S::Idle, C::Start) => Transition::to(S::ReadingRequest, E::ReadRequest),

        (S::ReadingRequest, C::NeedMore) => Transition::to(S::ReadingRequest, E::ContinueRead),
        (S::ReadingRequest, C::HeadComplete { body: 0 }) => {
            Transition::to(S::Dispatching, E::Dispatch)
        }
        (S::ReadingRequest, C::HeadComplete { .. }) => Transition::to(S::ReadingBody, E::ReadBody),

        (S::ReadingBody, C::NeedMore) => Transition::to(S::ReadingBody, E::ContinueRead),
        (S::ReadingBody, C::BodyComplete) => Transition::to(S::Dispatching, E::Dispatch),

        (S::ReadingRequest | S::ReadingBody, C::Rejected) => {
            Transition::to(S::WritingResponse, E::WriteResponse)
        }

        (S::Dispatching, C::Dispatched) => Transition::to(S::WritingResponse, E::WriteResponse),

        (S::WritingResponse, C::Written { reuse: true }) => Transition::to(S::Idle, E::Recycle),
        (S::WritingResponse, C::Written { reuse: false }) => Transition::to(S::Closing, E::Close),

        _ => Transition::to(S::Closing, E::Close),
    }
}
