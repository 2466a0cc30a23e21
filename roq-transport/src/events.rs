use std::fmt;
use std::time::Duration;

/// One packet as seen by the network layer.
///
/// `departure` and `arrival` are durations since the UNIX epoch. A packet
/// that was sent but never acknowledged is reported with `arrived == false`
/// and a zero arrival time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketEvent {
    pub seq_nr: u64,
    pub departure: Duration,
    pub arrival: Duration,
    pub size_bits: u64,
    pub marked: bool,
    pub arrived: bool,
}

impl PacketEvent {
    /// An arrival recorded at the receiving end.
    pub fn received(seq_nr: u64, departure: Duration, arrival: Duration, size_bits: u64) -> Self {
        Self {
            seq_nr,
            departure,
            arrival,
            size_bits,
            marked: false,
            arrived: true,
        }
    }

    /// A packet the network layer declared lost.
    pub fn lost(seq_nr: u64, departure: Duration, size_bits: u64) -> Self {
        Self {
            seq_nr,
            departure,
            arrival: Duration::ZERO,
            size_bits,
            marked: false,
            arrived: false,
        }
    }

    pub fn with_marked(mut self, marked: bool) -> Self {
        self.marked = marked;
        self
    }

    /// Arrival minus departure in microseconds. Negative when the two clocks
    /// disagree.
    pub fn one_way_delay_us(&self) -> i64 {
        self.arrival.as_micros() as i64 - self.departure.as_micros() as i64
    }
}

impl fmt::Display for PacketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.arrived {
            write!(
                f,
                "#{} {}bit owd {}us{}",
                self.seq_nr,
                self.size_bits,
                self.one_way_delay_us(),
                if self.marked { " CE" } else { "" }
            )
        } else {
            write!(f, "#{} {}bit lost", self.seq_nr, self.size_bits)
        }
    }
}
