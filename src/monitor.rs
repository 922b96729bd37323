//! Progress and cancellation hooks for long-running stages.
//!
//! Generators and trainers poll [`RunMonitor::is_canceled`] at coarse
//! boundaries (per condition, per epoch) and report progress as a fraction
//! in `[0, 1]`. A canceled run returns what it has produced so far.

pub trait RunMonitor {
    fn set_progress(&mut self, fraction: f64);

    fn is_canceled(&self) -> bool;
}

/// Monitor that ignores progress and never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unmonitored;

impl RunMonitor for Unmonitored {
    fn set_progress(&mut self, _fraction: f64) {}

    fn is_canceled(&self) -> bool {
        false
    }
}

/// Monitor built from a progress callback and a cancellation predicate.
pub struct Hooks<P, C>
where
    P: FnMut(f64),
    C: Fn() -> bool,
{
    progress: P,
    canceled: C,
}

impl<P, C> Hooks<P, C>
where
    P: FnMut(f64),
    C: Fn() -> bool,
{
    pub fn new(progress: P, canceled: C) -> Self {
        Self { progress, canceled }
    }
}

impl<P, C> RunMonitor for Hooks<P, C>
where
    P: FnMut(f64),
    C: Fn() -> bool,
{
    fn set_progress(&mut self, fraction: f64) {
        (self.progress)(fraction.clamp(0.0, 1.0));
    }

    fn is_canceled(&self) -> bool {
        (self.canceled)()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn hooks_forward_and_clamp_progress() {
        let mut seen = Vec::new();
        {
            let mut hooks = Hooks::new(|p| seen.push(p), || false);
            hooks.set_progress(0.5);
            hooks.set_progress(1.5);
            assert!(!hooks.is_canceled());
        }
        assert_eq!(seen, vec![0.5, 1.0]);
    }

    #[test]
    fn hooks_observe_external_cancel_flag() {
        let flag = Cell::new(false);
        let hooks = Hooks::new(|_| {}, || flag.get());
        assert!(!hooks.is_canceled());
        flag.set(true);
        assert!(hooks.is_canceled());
    }
}
