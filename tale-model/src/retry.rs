use std::time::Duration;

/// Exponential backoff schedule shared by the generation adapters.
///
/// Yields the delay to sleep before each retry, and `None` once the attempt
/// budget is spent. The first attempt itself is not counted, so a budget of 5
/// allows 4 delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
    remaining: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self { next: base, cap, remaining: max_attempts.saturating_sub(1) }
    }

    /// Schedule for text generation: 500 ms base, factor 2, 5 attempts.
    pub fn for_text() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 5)
    }

    /// Schedule for image generation: 1 s base, 30 s cap, 5 attempts.
    pub fn for_image() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 5)
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        Some(delay)
    }
}
