//! Per-view scroll coordination.
//!
//! A renderer owns one [`ScrollCoordinator`] per transcript it shows. Loading
//! history moves the viewport programmatically; the scroll events that causes
//! must not be mistaken for the user scrolling away from the bottom.

/// Rows from the bottom that still count as "at the bottom".
pub const DEFAULT_BOTTOM_SLACK: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollCoordinator {
    loading: bool,
    /// The next scroll event was caused by us and is swallowed.
    skip_next: bool,
    pinned_to_bottom: bool,
    bottom_slack: usize,
}

impl Default for ScrollCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_BOTTOM_SLACK)
    }
}

impl ScrollCoordinator {
    pub fn new(bottom_slack: usize) -> Self {
        Self {
            loading: false,
            skip_next: false,
            pinned_to_bottom: true,
            bottom_slack,
        }
    }

    pub fn begin_programmatic_load(&mut self) {
        self.loading = true;
    }

    /// The viewport jump that follows a load will emit one scroll event.
    pub fn finish_programmatic_load(&mut self) {
        self.loading = false;
        self.skip_next = true;
        self.pinned_to_bottom = true;
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Record a scroll event. Returns `true` if it was treated as user input.
    pub fn on_scroll_event(&mut self, rows_from_bottom: usize) -> bool {
        if self.loading {
            return false;
        }
        if self.skip_next {
            self.skip_next = false;
            return false;
        }
        self.pinned_to_bottom = rows_from_bottom <= self.bottom_slack;
        true
    }

    pub fn should_autoscroll(&self) -> bool {
        !self.loading && self.pinned_to_bottom
    }
}
