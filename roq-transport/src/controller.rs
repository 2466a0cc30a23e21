//! Rate control driven by resolved feedback batches.

use std::time::Duration;

use log::{debug, trace};

use crate::events::PacketEvent;

pub const DEFAULT_INITIAL_RATE: u64 = 1_000_000;
pub const DEFAULT_MIN_RATE: u64 = 150_000;
pub const DEFAULT_MAX_RATE: u64 = 20_000_000;
pub const DEFAULT_DELAY_THRESHOLD: Duration = Duration::from_millis(25);
pub const DEFAULT_ADDITIVE_INCREASE: u64 = 40_000;
pub const DEFAULT_DECREASE_FACTOR: f64 = 0.85;

/// Congestion controller fed with acknowledgments and losses.
pub trait CongestionController: Send {
    /// Consumes one resolved feedback batch and returns the new target rate
    /// in bits per second.
    fn on_acknowledgments(&mut self, rtt: Duration, events: &[PacketEvent]) -> u64;

    /// Rate to use before the first feedback arrives.
    fn target_rate(&self) -> u64;
}

/// Builder for [`AimdController`].
#[derive(Debug, Clone)]
pub struct AimdControllerBuilder {
    initial_rate: u64,
    min_rate: u64,
    max_rate: u64,
    delay_threshold: Duration,
    additive_increase: u64,
    decrease_factor: f64,
}

impl Default for AimdControllerBuilder {
    fn default() -> Self {
        Self {
            initial_rate: DEFAULT_INITIAL_RATE,
            min_rate: DEFAULT_MIN_RATE,
            max_rate: DEFAULT_MAX_RATE,
            delay_threshold: DEFAULT_DELAY_THRESHOLD,
            additive_increase: DEFAULT_ADDITIVE_INCREASE,
            decrease_factor: DEFAULT_DECREASE_FACTOR,
        }
    }
}

impl AimdControllerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_rate(mut self, bps: u64) -> Self {
        self.initial_rate = bps;
        self
    }

    pub fn with_min_rate(mut self, bps: u64) -> Self {
        self.min_rate = bps;
        self
    }

    pub fn with_max_rate(mut self, bps: u64) -> Self {
        self.max_rate = bps;
        self
    }

    /// Queuing delay above the lowest one-way delay seen so far that counts
    /// as congestion.
    pub fn with_delay_threshold(mut self, threshold: Duration) -> Self {
        self.delay_threshold = threshold;
        self
    }

    /// Increase per feedback batch without congestion.
    pub fn with_additive_increase(mut self, bps: u64) -> Self {
        self.additive_increase = bps;
        self
    }

    /// Multiplier applied on congestion, clamped to `(0, 1)`.
    pub fn with_decrease_factor(mut self, factor: f64) -> Self {
        self.decrease_factor = factor.clamp(0.01, 0.99);
        self
    }

    pub fn build(self) -> AimdController {
        let max_rate = self.max_rate.max(self.min_rate);
        AimdController {
            rate: self.initial_rate.clamp(self.min_rate, max_rate),
            min_rate: self.min_rate,
            max_rate,
            delay_threshold_us: self.delay_threshold.as_micros() as i64,
            additive_increase: self.additive_increase,
            decrease_factor: self.decrease_factor,
            base_owd_us: None,
        }
    }
}

/// Additive-increase/multiplicative-decrease controller.
///
/// A batch signals congestion when it contains a loss, an ECN mark, or a
/// one-way delay more than the delay threshold above the lowest one seen.
/// Congestion multiplies the rate by the decrease factor once per batch;
/// a clean batch adds the additive increase.
#[derive(Debug, Clone)]
pub struct AimdController {
    rate: u64,
    min_rate: u64,
    max_rate: u64,
    delay_threshold_us: i64,
    additive_increase: u64,
    decrease_factor: f64,
    base_owd_us: Option<i64>,
}

impl Default for AimdController {
    fn default() -> Self {
        AimdControllerBuilder::default().build()
    }
}

impl AimdController {
    fn congested(&mut self, events: &[PacketEvent]) -> bool {
        let mut congested = false;
        for event in events {
            if !event.arrived || event.marked {
                congested = true;
                continue;
            }
            let owd = event.one_way_delay_us();
            let base = *self.base_owd_us.get_or_insert(owd);
            if owd < base {
                self.base_owd_us = Some(owd);
            } else if owd - base > self.delay_threshold_us {
                congested = true;
            }
        }
        congested
    }
}

impl CongestionController for AimdController {
    fn on_acknowledgments(&mut self, rtt: Duration, events: &[PacketEvent]) -> u64 {
        if events.is_empty() {
            return self.rate;
        }

        let previous = self.rate;
        if self.congested(events) {
            self.rate = (self.rate as f64 * self.decrease_factor) as u64;
        } else {
            self.rate = self.rate.saturating_add(self.additive_increase);
        }
        self.rate = self.rate.clamp(self.min_rate, self.max_rate);

        if self.rate < previous {
            debug!(
                "aimd: congestion in {} events, rate {} -> {} bps (rtt {:?})",
                events.len(),
                previous,
                self.rate,
                rtt
            );
        } else {
            trace!("aimd: rate {} -> {} bps (rtt {:?})", previous, self.rate, rtt);
        }
        self.rate
    }

    fn target_rate(&self) -> u64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTT: Duration = Duration::from_millis(40);

    fn arrived(seq: u64, owd_ms: u64) -> PacketEvent {
        let departure = Duration::from_secs(1_000) + Duration::from_millis(seq);
        PacketEvent::received(seq, departure, departure + Duration::from_millis(owd_ms), 9600)
    }

    #[test]
    fn test_aimd_increases_without_congestion() {
        let mut cc = AimdControllerBuilder::new()
            .with_initial_rate(500_000)
            .with_additive_increase(10_000)
            .build();
        assert_eq!(cc.target_rate(), 500_000);

        assert_eq!(cc.on_acknowledgments(RTT, &[arrived(1, 20), arrived(2, 21)]), 510_000);
        assert_eq!(cc.on_acknowledgments(RTT, &[arrived(3, 22)]), 520_000);
        // nothing to learn from an empty batch
        assert_eq!(cc.on_acknowledgments(RTT, &[]), 520_000);
    }

    #[test]
    fn test_aimd_decreases_on_loss_and_mark() {
        let mut cc = AimdControllerBuilder::new()
            .with_initial_rate(1_000_000)
            .with_decrease_factor(0.5)
            .build();

        let lost = PacketEvent::lost(2, Duration::from_secs(1_000), 9600);
        assert_eq!(cc.on_acknowledgments(RTT, &[arrived(1, 20), lost]), 500_000);

        let marked = arrived(3, 20).with_marked(true);
        assert_eq!(cc.on_acknowledgments(RTT, &[marked]), 250_000);
    }

    #[test]
    fn test_aimd_decreases_on_queuing_delay() {
        let mut cc = AimdControllerBuilder::new()
            .with_initial_rate(1_000_000)
            .with_delay_threshold(Duration::from_millis(10))
            .with_decrease_factor(0.5)
            .build();

        cc.on_acknowledgments(RTT, &[arrived(1, 20)]);
        let rate = cc.target_rate();
        assert_eq!(cc.on_acknowledgments(RTT, &[arrived(2, 29)]), rate + DEFAULT_ADDITIVE_INCREASE);
        assert_eq!(
            cc.on_acknowledgments(RTT, &[arrived(3, 35)]),
            (rate + DEFAULT_ADDITIVE_INCREASE) / 2
        );
    }

    #[test]
    fn test_aimd_clamps() {
        let mut cc = AimdControllerBuilder::new()
            .with_initial_rate(10)
            .with_min_rate(100_000)
            .with_max_rate(120_000)
            .with_additive_increase(50_000)
            .build();
        assert_eq!(cc.target_rate(), 100_000);
        assert_eq!(cc.on_acknowledgments(RTT, &[arrived(1, 5)]), 120_000);

        let lost = PacketEvent::lost(2, Duration::ZERO, 8);
        for _ in 0..10 {
            cc.on_acknowledgments(RTT, &[lost]);
        }
        assert_eq!(cc.target_rate(), 100_000);
    }
}
