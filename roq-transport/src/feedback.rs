//! Compact wire format for packet event feedback.
//!
//! A message is a sequence of QUIC varints:
//!
//! ```text
//! count
//! repeated count times:
//!     seq_delta        sequence number minus the first one (absolute for the first)
//!     departure_delta  zigzag, departure µs minus the first one (absolute for the first)
//!     owd              zigzag, arrival µs minus departure µs
//!     size_bits
//!     marked           0 or 1
//! ```
//!
//! Events are sorted by sequence number before encoding, so every
//! `seq_delta` is non-negative.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};
use shared::varint::{get_varint, put_varint, varint_len, zigzag_decode, zigzag_encode};

use crate::events::PacketEvent;

pub const DEFAULT_MAX_EVENTS_PER_MESSAGE: usize = 100;

/// Smallest encoding of one event: five one-byte varints.
const MIN_EVENT_SIZE: usize = 5;

/// Events serialized into one feedback message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeedbackBatch {
    pub events: Vec<PacketEvent>,
}

impl FeedbackBatch {
    /// Builds a batch in wire order.
    pub fn new(mut events: Vec<PacketEvent>) -> Self {
        events.sort_by_key(|e| e.seq_nr);
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Per-event wire fields relative to the first event.
    fn fields(&self) -> impl Iterator<Item = [u64; 5]> + '_ {
        let first_seq = self.events.first().map(|e| e.seq_nr).unwrap_or(0);
        let first_departure = self
            .events
            .first()
            .map(|e| e.departure.as_micros() as i64)
            .unwrap_or(0);
        self.events.iter().enumerate().map(move |(i, e)| {
            let departure = e.departure.as_micros() as i64;
            let (seq, departure) = if i == 0 {
                (e.seq_nr, departure)
            } else {
                (
                    e.seq_nr.wrapping_sub(first_seq),
                    departure - first_departure,
                )
            };
            [
                seq,
                zigzag_encode(departure),
                zigzag_encode(e.one_way_delay_us()),
                e.size_bits,
                u64::from(e.marked),
            ]
        })
    }
}

impl MarshalSize for FeedbackBatch {
    fn marshal_size(&self) -> usize {
        varint_len(self.events.len() as u64)
            + self
                .fields()
                .map(|f| f.iter().map(|v| varint_len(*v)).sum::<usize>())
                .sum::<usize>()
    }
}

impl Marshal for FeedbackBatch {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferTooSmall);
        }

        put_varint(&mut buf, self.events.len() as u64)?;
        for fields in self.fields() {
            for v in fields {
                put_varint(&mut buf, v)?;
            }
        }
        Ok(size)
    }
}

impl Unmarshal for FeedbackBatch {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let count = get_varint(raw_packet)?;
        let remaining = raw_packet.remaining();
        if count > (remaining / MIN_EVENT_SIZE) as u64 {
            return Err(Error::ErrFeedbackCountExceedsInput { count, remaining });
        }

        let mut events = Vec::with_capacity(count as usize);
        let mut first_seq = 0u64;
        let mut first_departure = 0i64;
        for i in 0..count {
            let seq = get_varint(raw_packet)?;
            let departure = zigzag_decode(get_varint(raw_packet)?);
            let owd = zigzag_decode(get_varint(raw_packet)?);
            let size_bits = get_varint(raw_packet)?;
            let marked = get_varint(raw_packet)? != 0;

            let (seq_nr, departure) = if i == 0 {
                first_seq = seq;
                first_departure = departure;
                (seq, departure)
            } else {
                (
                    first_seq.wrapping_add(seq),
                    first_departure.saturating_add(departure),
                )
            };
            let arrival = departure.saturating_add(owd);

            events.push(PacketEvent {
                seq_nr,
                departure: micros(departure),
                arrival: micros(arrival),
                size_bits,
                marked,
                arrived: true,
            });
        }

        if raw_packet.has_remaining() {
            return Err(Error::ErrFeedbackTrailingBytes(raw_packet.remaining()));
        }

        Ok(Self { events })
    }
}

fn micros(us: i64) -> Duration {
    Duration::from_micros(us.max(0) as u64)
}

/// Splits `events` into messages of at most `max_events_per_message` events
/// each. No events produce no messages.
pub fn marshal_batches(
    mut events: Vec<PacketEvent>,
    max_events_per_message: usize,
) -> Result<Vec<Bytes>> {
    events.sort_by_key(|e| e.seq_nr);
    events
        .chunks(max_events_per_message.max(1))
        .map(|chunk| {
            let batch = FeedbackBatch {
                events: chunk.to_vec(),
            };
            Ok(batch.marshal()?.freeze())
        })
        .collect()
}
