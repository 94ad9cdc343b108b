//! Progress update callbacks the `Flasher` reports to as it writes each
//! segment. Implementations decide how to relate per-segment progress
//! to a run-wide total.

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Called once per segment, with its flash address and total size.
    fn init(&mut self, addr: u32, total: usize);
    /// Called as bytes are written to the current segment.
    fn update(&mut self, current: usize);
    /// Called once the current segment has been verified.
    fn finish(&mut self);
}

/// A [`ProgressCallbacks`] that does nothing, for callers that don't
/// care about progress reporting.
#[derive(Default)]
pub struct NoProgress;

impl ProgressCallbacks for NoProgress {
    fn init(&mut self, _addr: u32, _total: usize) {}
    fn update(&mut self, _current: usize) {}
    fn finish(&mut self) {}
}
