use std::fmt;

const CLOSED: u8 = 1 << 0;
const STARTING: u8 = 1 << 1;
const RUNNING: u8 = 1 << 2;
const CLOSING: u8 = 1 << 3;
const RESTARTING: u8 = 1 << 4;
const DESTROYING: u8 = 1 << 5;
const DESTROYED: u8 = 1 << 6;

const LABELS: [(u8, &str); 7] = [
    (CLOSED, "closed"),
    (STARTING, "starting"),
    (RUNNING, "running"),
    (CLOSING, "closing"),
    (RESTARTING, "restarting"),
    (DESTROYING, "destroying"),
    (DESTROYED, "destroyed"),
];

/// The state of a `Lifecycle`.
///
/// Exactly one of `closed`, `starting` or `running` is set at any time. The
/// remaining flags are overlays: `closing` marks a close request that has
/// not finished yet (it may arrive while still starting), `restarting`
/// spans a whole close-then-start sequence, and `destroying`/`destroyed`
/// mark the terminal teardown of a destructible component.
///
/// Transitions are only performed by the lifecycle engine while it holds its
/// state lock. An illegal transition panics, as it can only be the result of
/// a coordination bug inside the engine.
///
/// Since: 0.0.0
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct State(u8);

impl Default for State {
    fn default() -> Self {
        State(CLOSED)
    }
}

impl State {
    /// Returns true when no start or run phase is in progress.
    pub fn is_closed(self) -> bool {
        self.has(CLOSED)
    }

    /// Returns true while the start phase executes.
    pub fn is_starting(self) -> bool {
        self.has(STARTING)
    }

    /// Returns true while the run phase executes.
    pub fn is_running(self) -> bool {
        self.has(RUNNING)
    }

    /// Returns true when a close has been requested and not yet finished.
    pub fn is_closing(self) -> bool {
        self.has(CLOSING)
    }

    /// Returns true while a restart sequence is in progress.
    pub fn is_restarting(self) -> bool {
        self.has(RESTARTING)
    }

    /// Returns true when a destroy has been requested and not yet finished.
    pub fn is_destroying(self) -> bool {
        self.has(DESTROYING)
    }

    /// Returns true once the component has been destroyed.
    pub fn is_destroyed(self) -> bool {
        self.has(DESTROYED)
    }

    fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Validates the invariants that hold between the state flags, panics if
    /// any of them is violated.
    pub(crate) fn check(self) {
        let primary = [CLOSED, STARTING, RUNNING]
            .iter()
            .filter(|flag| self.has(**flag))
            .count();
        if primary != 1 {
            panic!("invalid lifecycle state `{}`: one of closed, starting or running must be set", self);
        }
        if self.has(CLOSING) && !(self.has(RUNNING) || self.has(STARTING)) {
            panic!("invalid lifecycle state `{}`: closing requires running or starting", self);
        }
        if self.has(DESTROYING) && !self.has(CLOSING) {
            panic!("invalid lifecycle state `{}`: destroying requires closing", self);
        }
        if self.has(DESTROYED) && !self.has(CLOSED) {
            panic!("invalid lifecycle state `{}`: destroyed requires closed", self);
        }
        if self.has(RESTARTING) && (self.has(DESTROYING) || self.has(DESTROYED)) {
            panic!("invalid lifecycle state `{}`: restarting conflicts with destroy", self);
        }
    }

    fn transition(&mut self, to: &str, allowed: bool, next: u8) {
        self.check();
        if !allowed {
            panic!("illegal lifecycle transition from `{}` to {}", self, to);
        }
        let next = State(next);
        next.check();
        *self = next;
    }

    pub(crate) fn to_starting(&mut self) {
        let allowed = self.is_closed() && !self.is_destroyed();
        self.transition("starting", allowed, (self.0 & !CLOSED) | STARTING)
    }

    /// Keeps a close request that arrived during the start phase.
    pub(crate) fn to_running(&mut self) {
        let allowed = self.is_starting();
        self.transition("running", allowed, (self.0 & !STARTING) | RUNNING)
    }

    pub(crate) fn to_closing(&mut self) {
        let allowed = !self.is_closed();
        self.transition("closing", allowed, self.0 | CLOSING)
    }

    pub(crate) fn to_closed(&mut self) {
        let allowed = !self.is_destroyed();
        let next = (self.0 & !(STARTING | RUNNING | CLOSING | DESTROYING)) | CLOSED;
        self.transition("closed", allowed, next)
    }

    pub(crate) fn to_restarting(&mut self) {
        let allowed = !(self.is_restarting() || self.is_destroying() || self.is_destroyed());
        self.transition("restarting", allowed, self.0 | RESTARTING)
    }

    pub(crate) fn to_restarted(&mut self) {
        let allowed = self.is_restarting();
        self.transition("restarted", allowed, self.0 & !RESTARTING)
    }

    pub(crate) fn to_destroying(&mut self) {
        let allowed = !(self.is_closed() || self.is_restarting());
        self.transition("destroying", allowed, self.0 | CLOSING | DESTROYING)
    }

    /// Valid from `closed` (direct destroy) and at the end of a run phase
    /// that was closed by a destroy request.
    pub(crate) fn to_destroyed(&mut self) {
        let allowed = !(self.is_destroyed() || self.is_restarting())
            && (self.is_closed() || self.is_destroying());
        self.transition("destroyed", allowed, CLOSED | DESTROYED)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, label) in LABELS.iter() {
            if self.has(*flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(label)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State({})", self)
    }
}
