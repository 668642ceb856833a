use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

// ----- Phase model -----------------------------------------------------------

/// Where a unit currently sits in its lifecycle.
///
/// `Unloaded -> Loaded -> Initialized -> Started <-> Stopped -> Uninitialized -> Unloaded`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Unloaded,
    Loaded,
    Initialized,
    Started,
    Stopped,
    Uninitialized,
}

impl Phase {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        match self {
            Phase::Unloaded => 0,
            Phase::Loaded => 1,
            Phase::Initialized => 2,
            Phase::Started => 3,
            Phase::Stopped => 4,
            Phase::Uninitialized => 5,
        }
    }

    #[inline]
    pub const fn from_u8(x: u8) -> Self {
        match x {
            1 => Phase::Loaded,
            2 => Phase::Initialized,
            3 => Phase::Started,
            4 => Phase::Stopped,
            5 => Phase::Uninitialized,
            _ => Phase::Unloaded,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Unloaded => "unloaded",
            Phase::Loaded => "loaded",
            Phase::Initialized => "initialized",
            Phase::Started => "started",
            Phase::Stopped => "stopped",
            Phase::Uninitialized => "uninitialized",
        };
        f.write_str(s)
    }
}

/// The six lifecycle verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Load,
    Initialize,
    Start,
    Stop,
    Uninitialize,
    Unload,
}

impl Verb {
    /// Phases from which the verb may run.
    const fn allowed_from(self) -> &'static [Phase] {
        match self {
            Verb::Load => &[Phase::Unloaded],
            Verb::Initialize => &[Phase::Loaded],
            Verb::Start => &[Phase::Initialized, Phase::Stopped],
            Verb::Stop => &[Phase::Started],
            Verb::Uninitialize => &[Phase::Initialized, Phase::Stopped],
            Verb::Unload => &[Phase::Loaded, Phase::Uninitialized],
        }
    }

    /// Phases in which the verb is a successful no-op.
    const fn satisfied_in(self) -> &'static [Phase] {
        match self {
            Verb::Start => &[Phase::Started],
            Verb::Stop => &[Phase::Stopped, Phase::Initialized],
            _ => &[],
        }
    }

    pub const fn target(self) -> Phase {
        match self {
            Verb::Load => Phase::Loaded,
            Verb::Initialize => Phase::Initialized,
            Verb::Start => Phase::Started,
            Verb::Stop => Phase::Stopped,
            Verb::Uninitialize => Phase::Uninitialized,
            Verb::Unload => Phase::Unloaded,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Verb::Load => "load",
            Verb::Initialize => "initialize",
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Uninitialize => "uninitialize",
            Verb::Unload => "unload",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----- Guarded transitions ---------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionDenied {
    /// Another verb is running on the same unit.
    InFlight,
    /// The verb is not valid from the current phase.
    NotAllowed(Phase),
    /// The unit is already where the verb would take it.
    Satisfied,
}

/// Phase register of a single unit. At most one verb may be in flight.
#[derive(Debug)]
pub(crate) struct PhaseState {
    phase: AtomicU8,
    busy: AtomicBool,
}

impl PhaseState {
    pub(crate) fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Unloaded.as_u8()),
            busy: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn current(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Claim the unit for `verb`. The returned guard releases the claim on drop and
    /// moves the phase forward only when committed.
    pub(crate) fn begin(&self, verb: Verb) -> Result<Transition<'_>, TransitionDenied> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransitionDenied::InFlight);
        }

        let current = self.current();
        let denied = if verb.satisfied_in().contains(&current) {
            Some(TransitionDenied::Satisfied)
        } else if !verb.allowed_from().contains(&current) {
            Some(TransitionDenied::NotAllowed(current))
        } else {
            None
        };

        if let Some(d) = denied {
            self.busy.store(false, Ordering::Release);
            return Err(d);
        }

        Ok(Transition {
            state: self,
            target: verb.target(),
        })
    }
}

pub(crate) struct Transition<'a> {
    state: &'a PhaseState,
    target: Phase,
}

impl Transition<'_> {
    pub(crate) fn commit(self) {
        self.state
            .phase
            .store(self.target.as_u8(), Ordering::Release);
        tracing::trace!(phase = %self.target, "phase committed");
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        self.state.busy.store(false, Ordering::Release);
    }
}
