//! Adaptive send concurrency for the streaming upload pipeline.
//!
//! The pipeline keeps a buffer of encrypted chunks waiting to be sent. Once
//! per scheduling tick it reports how many chunks are buffered. A buffer
//! that keeps hitting its target means encryption outpaces upload, so
//! another send slot opens. A buffer that keeps running dry means upload
//! outpaces encryption, so a send slot closes and encryption may run
//! further ahead. Senders plus buffer never exceed the memory ceiling.

/// Consecutive ticks of the same signal needed before adjusting.
pub const STREAK_THRESHOLD: u32 = 3;

/// What a tick changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    None,
    ScaledUp,
    ScaledDown,
}

#[derive(Debug, Clone)]
pub struct AdaptiveController {
    concurrency: usize,
    buffer_target: usize,
    max_concurrency: usize,
    ceiling: usize,
    full_streak: u32,
    drained_streak: u32,
}

impl AdaptiveController {
    /// `ceiling` bounds `concurrency + buffer_target`; `max_concurrency`
    /// bounds the number of send slots.
    pub fn new(concurrency: usize, buffer_target: usize, max_concurrency: usize, ceiling: usize) -> Self {
        let ceiling = ceiling.max(2);
        let max_concurrency = max_concurrency.clamp(1, ceiling - 1);
        let concurrency = concurrency.clamp(1, max_concurrency);
        let buffer_target = buffer_target.clamp(1, ceiling - concurrency);
        Self {
            concurrency,
            buffer_target,
            max_concurrency,
            ceiling,
            full_streak: 0,
            drained_streak: 0,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn buffer_target(&self) -> usize {
        self.buffer_target
    }

    /// Feed one observation of buffer occupancy.
    pub fn tick(&mut self, buffered: usize) -> Adjustment {
        if buffered >= self.buffer_target {
            self.full_streak += 1;
            self.drained_streak = 0;
        } else if buffered == 0 {
            self.drained_streak += 1;
            self.full_streak = 0;
        } else {
            self.full_streak = 0;
            self.drained_streak = 0;
        }

        if self.full_streak >= STREAK_THRESHOLD {
            self.full_streak = 0;
            if self.concurrency < self.max_concurrency
                && self.concurrency + self.buffer_target < self.ceiling
            {
                self.concurrency += 1;
                return Adjustment::ScaledUp;
            }
        } else if self.drained_streak >= STREAK_THRESHOLD {
            self.drained_streak = 0;
            if self.concurrency > 1 {
                self.concurrency -= 1;
                if self.concurrency + self.buffer_target < self.ceiling {
                    self.buffer_target += 1;
                }
                return Adjustment::ScaledDown;
            }
        }
        Adjustment::None
    }
}
