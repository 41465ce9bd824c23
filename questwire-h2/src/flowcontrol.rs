//! Flow control windows (RFC 7540 Section 6.9).

use crate::error::Error;
use crate::settings::MAX_WINDOW_SIZE;

/// Initial window size every stream and connection starts with.
pub const DEFAULT_WINDOW_SIZE: i64 = 65_535;

/// One send or receive window. Signed because a SETTINGS change may drive a
/// send window negative (RFC 7540 Section 6.9.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window(i64);

impl Window {
    pub fn new(initial: i64) -> Self {
        Self(initial)
    }

    pub fn size(&self) -> i64 {
        self.0
    }

    /// Bytes that may be sent right now (zero when the window is negative).
    pub fn available(&self) -> usize {
        usize::try_from(self.0.max(0)).unwrap_or(usize::MAX)
    }

    /// Take `amount` bytes out of the window.
    pub fn consume(&mut self, amount: usize) -> Result<(), Error> {
        let amount = i64::try_from(amount).map_err(|_| Error::FlowControl)?;
        if amount > self.0 {
            return Err(Error::FlowControl);
        }
        self.0 -= amount;
        Ok(())
    }

    /// Credit the window from a WINDOW_UPDATE.
    pub fn increase(&mut self, increment: u32) -> Result<(), Error> {
        self.shift(i64::from(increment))
    }

    /// Move the window by the change in SETTINGS_INITIAL_WINDOW_SIZE.
    pub fn shift(&mut self, delta: i64) -> Result<(), Error> {
        let next = self.0 + delta;
        if next > i64::from(MAX_WINDOW_SIZE) {
            return Err(Error::FlowControl);
        }
        self.0 = next;
        Ok(())
    }

    /// Increment that restores a receive window to `target`, or `None` while
    /// more than half of `target` is still open.
    pub fn replenish(&self, target: i64) -> Option<u32> {
        if self.0 >= target / 2 {
            return None;
        }
        u32::try_from(target - self.0).ok().filter(|inc| *inc > 0)
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}
