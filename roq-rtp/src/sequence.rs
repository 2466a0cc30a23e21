use std::fmt;

/// Sequencer generates sequential sequence numbers for building RTP packets
pub trait Sequencer: fmt::Debug {
    fn next_sequence_number(&mut self) -> u16;
    fn roll_over_count(&self) -> u64;
}

/// NewRandomSequencer returns a new sequencer starting from a random sequence
/// number
pub fn new_random_sequencer() -> impl Sequencer {
    SequencerImpl {
        sequence_number: rand::random::<u16>(),
        roll_over_count: 0,
    }
}

/// NewFixedSequencer returns a new sequencer starting from a specific
/// sequence number
pub fn new_fixed_sequencer(s: u16) -> impl Sequencer {
    // the first call to next_sequence_number returns `s`
    SequencerImpl {
        sequence_number: s.wrapping_sub(1),
        roll_over_count: 0,
    }
}

#[derive(Debug, Clone)]
struct SequencerImpl {
    sequence_number: u16,
    roll_over_count: u64,
}

impl Sequencer for SequencerImpl {
    /// NextSequenceNumber increment and returns a new sequence number for
    /// building RTP packets
    fn next_sequence_number(&mut self) -> u16 {
        self.sequence_number = self.sequence_number.wrapping_add(1);
        if self.sequence_number == 0 {
            self.roll_over_count += 1;
        }
        self.sequence_number
    }

    /// RollOverCount returns the amount of times the 16bit sequence number
    /// has wrapped
    fn roll_over_count(&self) -> u64 {
        self.roll_over_count
    }
}

fn unwrap_with(last_unwrapped: &mut Option<i64>, value: i64, modulus: i64) -> i64 {
    match *last_unwrapped {
        None => {
            *last_unwrapped = Some(value);
            value
        }
        Some(last) => {
            let half = modulus / 2;
            let mut diff = value - last.rem_euclid(modulus);

            // Handle wraparound
            if diff > half {
                diff -= modulus;
            } else if diff < -half {
                diff += modulus;
            }

            let unwrapped = last + diff;
            *last_unwrapped = Some(unwrapped);
            unwrapped
        }
    }
}

/// Extends 16-bit RTP sequence numbers to a monotonic 64-bit space.
///
/// Each value is placed at the position closest to the previously unwrapped
/// one, so reordering of up to half the sequence space is tolerated.
#[derive(Debug, Default, Clone)]
pub struct SequenceUnwrapper {
    last_unwrapped: Option<i64>,
}

impl SequenceUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwrap(&mut self, seq: u16) -> i64 {
        unwrap_with(&mut self.last_unwrapped, seq as i64, 1 << 16)
    }
}

/// Extends 32-bit RTP timestamps to 64 bits.
#[derive(Debug, Default, Clone)]
pub struct TimestampUnwrapper {
    last_unwrapped: Option<i64>,
}

impl TimestampUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwrap(&mut self, timestamp: u32) -> i64 {
        unwrap_with(&mut self.last_unwrapped, timestamp as i64, 1 << 32)
    }
}
