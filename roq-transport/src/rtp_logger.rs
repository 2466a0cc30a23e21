use log::info;
use rtp::Header;
use rtp::sequence::SequenceUnwrapper;
use shared::error::Result;
use shared::marshal::Unmarshal;

/// Logs the header of every RTP packet crossing a flow, together with its
/// unwrapped sequence number.
#[derive(Debug, Clone)]
pub struct RtpLogger {
    vantage_point: String,
    unwrapper: SequenceUnwrapper,
}

impl RtpLogger {
    pub fn new(vantage_point: impl Into<String>) -> Self {
        Self {
            vantage_point: vantage_point.into(),
            unwrapper: SequenceUnwrapper::new(),
        }
    }

    /// Parses and logs one packet. Returns the unwrapped sequence number.
    pub fn log_packet(&mut self, buf: &[u8]) -> Result<i64> {
        let mut raw = buf;
        let header = Header::unmarshal(&mut raw)?;
        let unwrapped = self.unwrapper.unwrap(header.sequence_number);

        info!(
            "{}: rtp version={} padding={} marker={} pt={} seq={} unwrapped-seq={} ts={} ssrc={} len={}",
            self.vantage_point,
            header.version,
            header.padding,
            header.marker,
            header.payload_type,
            header.sequence_number,
            unwrapped,
            header.timestamp,
            header.ssrc,
            buf.len()
        );
        Ok(unwrapped)
    }
}
