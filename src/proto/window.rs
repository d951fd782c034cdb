use crate::config::WINDOW_SIZE;

/*
    Measured loss rate      Tolerated losses in window
    ------------------      --------------------------
    x < 2%                  0 out of 10
    2% <= x < 5%            1 out of 10
    5% <= x < 12%           2 out of 10
    12% <= x <= 20%         3 out of 10
    x > 20%                 connection rejected
*/
pub fn tolerance_for(loss_rate: f32) -> Option<u32> {
    if loss_rate < 2.0 {
        Some(0)
    } else if loss_rate < 5.0 {
        Some(1)
    } else if loss_rate < 12.0 {
        Some(2)
    } else if loss_rate <= 20.0 {
        Some(3)
    } else {
        None
    }
}

/// Fixed-width bitmap of recent send outcomes, most recent in bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossWindow {
    bits: u32,
    width: u32,
    tolerated: u32,
}

impl LossWindow {
    pub fn new() -> Self {
        LossWindow {
            bits: 0,
            width: WINDOW_SIZE,
            tolerated: 0,
        }
    }

    /// Sets how many of the last `width` sends may go unacknowledged.
    pub fn set_tolerated(&mut self, tolerated: u32) {
        self.tolerated = tolerated;
    }

    /// Shifts the outcome of the latest send into the window.
    pub fn record(&mut self, received: bool) {
        self.bits <<= 1;
        if received {
            self.bits |= 1;
        }
        self.bits &= (1 << self.width) - 1;
    }

    /// True iff strictly more than `width - tolerated` of the last `width`
    /// sends were acknowledged.
    pub fn acceptable(&self) -> bool {
        self.bits.count_ones() > self.width - self.tolerated
    }
}

impl Default for LossWindow {
    fn default() -> Self {
        Self::new()
    }
}
