use std::time::SystemTime;

use crate::{
    config::IntervalConfig,
    error::IngestError,
    sinks::{InsertOutcome, IntervalWriter, StoreConnector},
    sources::payload::{parse_payload, ParsedPayload},
    transform::{IntervalMath, LocalZone, PulseTracker},
};

/// Longest raw-payload excerpt written to the log for a failed message.
const PREVIEW_CHARS: usize = 300;

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

/// Per-message dispatch: interpreter, then boundary derivation for pulse
/// payloads, then the store writer.
///
/// Messages are handled one at a time; the pulse look-back relies on it.
pub struct IngestPipeline<C: StoreConnector> {
    interval: IntervalConfig,
    zone: LocalZone,
    tracker: PulseTracker,
    writer: IntervalWriter<C>,
}

impl<C: StoreConnector> IngestPipeline<C> {
    pub fn new(interval: IntervalConfig, zone: LocalZone, writer: IntervalWriter<C>) -> Self {
        Self {
            interval,
            zone,
            tracker: PulseTracker::default(),
            writer,
        }
    }

    pub async fn process(&mut self, msg: &Envelope<Vec<u8>>) -> Result<InsertOutcome, IngestError> {
        let (format, parsed) = parse_payload(&msg.payload)?;

        let reading = match parsed {
            ParsedPayload::Interval(reading) => reading,
            ParsedPayload::Pulses(sample) => {
                let math = IntervalMath::from_config(&self.interval)?;
                let pulse_count = self.tracker.effective_delta(&sample);
                let sampled_at = self.zone.wall_clock(msg.received_at);
                math.build_reading(&sample, pulse_count, sampled_at)
            }
        };

        tracing::debug!(
            format = format.as_str(),
            interval_end = %reading.interval_end,
            pulse_count = reading.pulse_count,
            "interpreted payload"
        );

        Ok(self.writer.insert_received(&reading, msg.received_at).await?)
    }

    /// Process one message and log any failure. Never propagates, so a bad
    /// message cannot end the session.
    pub async fn handle(&mut self, msg: &Envelope<Vec<u8>>) -> Option<InsertOutcome> {
        metrics::counter!("kyz_messages_received_total").increment(1);

        match self.process(msg).await {
            Ok(outcome) => Some(outcome),
            Err(IngestError::Payload(e)) => {
                tracing::warn!(error = %e, raw = %preview(&msg.payload), "dropping malformed payload");
                metrics::counter!("kyz_payload_rejected_total").increment(1);
                None
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    kind = e.kind(),
                    raw = %preview(&msg.payload),
                    "failed to ingest message"
                );
                None
            }
        }
    }

    pub async fn shutdown(&self) {
        self.writer.close().await;
    }
}

fn preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}
