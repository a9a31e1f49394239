//! Replay protection
//!
//! Sliding window over inbound sequence numbers for one key set.

/// Number of sequence numbers tracked behind the highest accepted one
pub const REPLAY_WINDOW_SIZE: u32 = 128;

/// Sliding window for replay attack protection
///
/// Bit `i` of the bitmap records whether `highest - i` has been accepted.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: Option<u32>,
    bitmap: u128,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `sequence` would be accepted, without recording it
    #[inline]
    pub fn check(&self, sequence: u32) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if sequence > highest {
            return true;
        }
        let diff = highest - sequence;
        if diff >= REPLAY_WINDOW_SIZE {
            return false;
        }
        self.bitmap & (1u128 << diff) == 0
    }

    /// Record an accepted sequence number
    ///
    /// Callers must only mark sequences that passed [`check`](Self::check)
    /// and authentication.
    #[inline]
    pub fn mark(&mut self, sequence: u32) {
        match self.highest {
            None => {
                self.highest = Some(sequence);
                self.bitmap = 1;
            }
            Some(highest) if sequence > highest => {
                let shift = sequence - highest;
                self.bitmap = if shift >= REPLAY_WINDOW_SIZE {
                    1
                } else {
                    (self.bitmap << shift) | 1
                };
                self.highest = Some(sequence);
            }
            Some(highest) => {
                let diff = highest - sequence;
                if diff < REPLAY_WINDOW_SIZE {
                    self.bitmap |= 1u128 << diff;
                }
            }
        }
    }

    /// Check and record in one step; returns true if accepted
    pub fn check_and_update(&mut self, sequence: u32) -> bool {
        if !self.check(sequence) {
            return false;
        }
        self.mark(sequence);
        true
    }

    /// Highest sequence accepted so far
    pub fn highest(&self) -> Option<u32> {
        self.highest
    }

    /// Reset window
    pub fn reset(&mut self) {
        self.highest = None;
        self.bitmap = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_window() {
        let mut window = ReplayWindow::new();

        // Sequential packets, starting at zero
        assert!(window.check_and_update(0));
        assert!(window.check_and_update(1));
        assert!(window.check_and_update(2));

        // Replay should fail
        assert!(!window.check_and_update(1));

        // Out of order but within window
        assert!(window.check_and_update(5));
        assert!(window.check_and_update(4));

        // Replay again
        assert!(!window.check_and_update(4));
    }

    #[test]
    fn test_zero_after_one() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(0));
        assert!(window.check_and_update(1));
        assert!(!window.check_and_update(0));
    }

    #[test]
    fn test_replay_window_jump() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(1));
        assert!(window.check_and_update(300)); // Big jump
        assert!(!window.check_and_update(1)); // Old packet
        assert!(window.check_and_update(300 - REPLAY_WINDOW_SIZE + 1)); // Oldest still inside
        assert!(!window.check_and_update(300 - REPLAY_WINDOW_SIZE)); // Just outside
    }

    #[test]
    fn test_check_does_not_record() {
        let mut window = ReplayWindow::new();
        assert!(window.check(7));
        assert!(window.check(7));
        window.mark(7);
        assert!(!window.check(7));
        assert_eq!(window.highest(), Some(7));

        window.reset();
        assert!(window.check(7));
    }
}
