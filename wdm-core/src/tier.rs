//! Importance tier buffers.
//!
//! A tier stores encoded events of one importance band in a [`ByteRing`].
//! Every stored frame carries a sequence number vended by the tier's
//! [`EventCounter`]: for events logged directly into the tier it is the event
//! id, while events promoted from a less important tier keep their original
//! id and get a fresh sequence number here. Sequence numbers are what fetch
//! cursors walk over, so every tier can be scanned in append order without
//! gaps or repeats.
//!
//! Frame body layout: `[u16 header_len][header][payload]`. Timestamps are
//! stored as signed deltas from the previously appended frame; the tier keeps
//! the absolute time of its oldest frame to rebuild them.

use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use tracing::trace;
use wdm_types::{EventId, EventRecord, Importance, RelatedEvent, WdmError};

use crate::counter::EventCounter;
use crate::log::LogError;
use crate::ring::{ByteRing, FrameWriter, Frames};

/// Per-frame header, stored MessagePack-encoded ahead of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FrameHeader {
    seq: u64,
    importance: Importance,
    event_id: EventId,
    delta_ms: i64,
    utc_time_ms: Option<u64>,
    source_id: u64,
    resource_id: u64,
    related: Option<RelatedEvent>,
    urgent: bool,
    profile_id: u32,
    structure_type: u32,
    data_schema_version: u16,
}

/// Everything about an event except its payload and storage position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EventMeta {
    pub importance: Importance,
    /// `None` means the event takes the sequence number as its id.
    pub event_id: Option<EventId>,
    pub system_time_ms: u64,
    pub utc_time_ms: Option<u64>,
    pub source_id: u64,
    pub resource_id: u64,
    pub related: Option<RelatedEvent>,
    pub urgent: bool,
    pub profile_id: u32,
    pub structure_type: u32,
    pub data_schema_version: u16,
}

impl EventMeta {
    /// Metadata for re-appending `record` in a more important tier.
    pub fn promoted(record: &EventRecord) -> Self {
        Self {
            importance: record.importance,
            event_id: Some(record.event_id),
            system_time_ms: record.system_time_ms,
            utc_time_ms: record.utc_time_ms,
            source_id: record.source_id,
            resource_id: record.resource_id,
            related: record.related,
            urgent: record.urgent,
            profile_id: record.profile_id,
            structure_type: record.structure_type,
            data_schema_version: record.data_schema_version,
        }
    }
}

/// A decoded frame: the event plus its sequence number in this tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    /// Position of the frame in the tier's sequence.
    pub seq: EventId,
    /// The event, with its absolute timestamp restored.
    pub record: EventRecord,
}

/// Why an append did not go through.
#[derive(Debug)]
pub(crate) enum AppendFailure {
    /// Not enough free space; evict and retry.
    Full,
    /// Retrying cannot help.
    Fatal(LogError),
}

/// Wrap-around store for the events of one importance band.
#[derive(Debug)]
pub struct TierBuffer {
    importance: Importance,
    ring: ByteRing,
    counter: EventCounter,
    first_seq: u64,
    first_timestamp: u64,
    last_timestamp: u64,
    dropped_events: u64,
    next: Option<usize>,
}

impl TierBuffer {
    /// Create an empty tier.
    pub fn new(importance: Importance, capacity: usize, counter: EventCounter) -> Self {
        let first_seq = counter.peek_next();
        Self {
            importance,
            ring: ByteRing::new(capacity),
            counter,
            first_seq,
            first_timestamp: 0,
            last_timestamp: 0,
            dropped_events: 0,
            next: None,
        }
    }

    /// Importance band of this tier.
    pub fn importance(&self) -> Importance {
        self.importance
    }

    /// Sequence number of the oldest retained frame, or of the next frame
    /// to be appended when the tier is empty.
    pub fn first_event_id(&self) -> EventId {
        EventId::new(self.first_seq)
    }

    /// Last sequence number vended (0 if none).
    pub fn last_event_id(&self) -> EventId {
        EventId::new(self.counter.last())
    }

    /// Absolute timestamp of the oldest retained frame.
    pub fn first_timestamp(&self) -> u64 {
        self.first_timestamp
    }

    /// Absolute timestamp of the most recently appended frame.
    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    /// Events lost from this tier: evicted with no more important tier to
    /// take them, or too large for the tier they would be promoted into.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    /// Bytes in use, framing included.
    pub fn bytes_used(&self) -> usize {
        self.ring.used()
    }

    /// Storage capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of retained frames.
    pub fn event_count(&self) -> usize {
        self.ring.len()
    }

    /// Index of the next more important tier in the log's arena.
    pub fn next(&self) -> Option<usize> {
        self.next
    }

    pub(crate) fn set_next(&mut self, next: Option<usize>) {
        self.next = next;
    }

    /// Append an event, streaming its payload through `payload`.
    ///
    /// The sequence number is made durable before the frame is committed;
    /// on any failure nothing is stored and no id is consumed.
    pub(crate) fn try_append<F>(
        &mut self,
        meta: &EventMeta,
        payload: &mut F,
    ) -> Result<EventId, AppendFailure>
    where
        F: FnMut(&mut FrameWriter<'_>) -> io::Result<()>,
    {
        let seq = self.counter.peek_next();
        let was_empty = self.ring.is_empty();
        let delta_ms = if was_empty {
            0
        } else {
            meta.system_time_ms as i64 - self.last_timestamp as i64
        };

        let encoded = encode_header(meta, seq, delta_ms).map_err(AppendFailure::Fatal)?;

        let capacity = self.ring.capacity();
        let full = |err: io::Error| {
            if err.kind() != io::ErrorKind::WriteZero {
                AppendFailure::Fatal(LogError::Payload(err))
            } else if was_empty {
                AppendFailure::Fatal(LogError::BufferTooSmall { capacity })
            } else {
                AppendFailure::Full
            }
        };

        let mut writer = self.ring.begin_frame();
        writer.write_all(&encoded).map_err(full)?;
        payload(&mut writer).map_err(full)?;

        // The id is durable before the frame becomes visible.
        let vended = self
            .counter
            .advance()
            .map_err(|e| AppendFailure::Fatal(LogError::Counter(e)))?;
        let stored = writer.commit().map_err(full)?;
        debug_assert_eq!(vended, seq);

        if was_empty {
            self.first_seq = seq;
            self.first_timestamp = meta.system_time_ms;
        }
        self.last_timestamp = meta.system_time_ms;
        trace!(tier = %self.importance, seq, bytes = stored, "appended frame");
        Ok(EventId::new(seq))
    }

    /// Check that the event would fit in this tier once it is empty.
    ///
    /// Runs `payload` against a measuring writer; nothing is stored and no
    /// id is consumed. Fails with `BufferTooSmall` when no amount of
    /// eviction could make room.
    pub(crate) fn ensure_fits<F>(&mut self, meta: &EventMeta, payload: &mut F) -> Result<(), LogError>
    where
        F: FnMut(&mut FrameWriter<'_>) -> io::Result<()>,
    {
        // An empty tier stores the frame with a zero delta.
        let encoded = encode_header(meta, self.counter.peek_next(), 0)?;
        let capacity = self.ring.capacity();
        let too_small = |err: io::Error| {
            if err.kind() == io::ErrorKind::WriteZero {
                LogError::BufferTooSmall { capacity }
            } else {
                LogError::Payload(err)
            }
        };

        let mut writer = self.ring.measure_frame();
        writer.write_all(&encoded).map_err(too_small)?;
        payload(&mut writer).map_err(too_small)
    }

    /// Decode the oldest retained frame without removing it.
    pub fn oldest(&self) -> Result<Option<StoredEvent>, LogError> {
        match self.ring.front() {
            Some(body) => {
                let (header, payload) = decode_frame(&body)?;
                Ok(Some(into_stored(header, self.first_timestamp, payload)))
            }
            None => Ok(None),
        }
    }

    /// Remove the oldest frame, moving `first_event_id` past it.
    pub(crate) fn discard_oldest(&mut self) -> Result<Option<EventId>, LogError> {
        let Some(body) = self.ring.pop_front() else {
            return Ok(None);
        };
        let (removed, _) = decode_frame(&body)?;

        match self.ring.front() {
            Some(next_body) => {
                let (next, _) = decode_frame(&next_body)?;
                self.first_seq = next.seq;
                self.first_timestamp = offset(self.first_timestamp, next.delta_ms);
            }
            None => {
                self.first_seq = self.counter.peek_next();
                self.first_timestamp = self.last_timestamp;
            }
        }
        Ok(Some(removed.event_id))
    }

    /// Drop the oldest frame and count the loss.
    pub(crate) fn drop_oldest(&mut self) -> Result<Option<EventId>, LogError> {
        let dropped = self.discard_oldest()?;
        if dropped.is_some() {
            self.dropped_events += 1;
        }
        Ok(dropped)
    }

    /// Lazily scan retained frames with sequence number `>= from`.
    pub fn scan_from(&self, from: EventId) -> Scan<'_> {
        Scan {
            frames: self.ring.iter(),
            timestamp: None,
            first_timestamp: self.first_timestamp,
            from: from.value(),
        }
    }

    /// Check if any retained frame has a sequence number `>= from`.
    pub fn has_events_from(&self, from: EventId) -> bool {
        !self.ring.is_empty() && self.counter.last() >= from.value()
    }
}

/// Iterator returned by [`TierBuffer::scan_from`].
pub struct Scan<'a> {
    frames: Frames<'a>,
    timestamp: Option<u64>,
    first_timestamp: u64,
    from: u64,
}

impl Iterator for Scan<'_> {
    type Item = Result<StoredEvent, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let body = self.frames.next()?;
            let (header, payload) = match decode_frame(&body) {
                Ok(decoded) => decoded,
                Err(e) => return Some(Err(e)),
            };
            let timestamp = match self.timestamp {
                None => self.first_timestamp,
                Some(previous) => offset(previous, header.delta_ms),
            };
            self.timestamp = Some(timestamp);
            if header.seq >= self.from {
                return Some(Ok(into_stored(header, timestamp, payload)));
            }
        }
    }
}

/// Length-prefixed, MessagePack-encoded frame header.
fn encode_header(meta: &EventMeta, seq: u64, delta_ms: i64) -> Result<Vec<u8>, LogError> {
    let header = FrameHeader {
        seq,
        importance: meta.importance,
        event_id: meta.event_id.unwrap_or(EventId::new(seq)),
        delta_ms,
        utc_time_ms: meta.utc_time_ms,
        source_id: meta.source_id,
        resource_id: meta.resource_id,
        related: meta.related,
        urgent: meta.urgent,
        profile_id: meta.profile_id,
        structure_type: meta.structure_type,
        data_schema_version: meta.data_schema_version,
    };
    let encoded =
        rmp_serde::to_vec(&header).map_err(|e| LogError::Wire(WdmError::Serialization(e)))?;
    let header_len = u16::try_from(encoded.len())
        .map_err(|_| LogError::Corrupt(format!("frame header of {} bytes", encoded.len())))?;

    let mut framed = Vec::with_capacity(2 + encoded.len());
    framed.extend_from_slice(&header_len.to_le_bytes());
    framed.extend_from_slice(&encoded);
    Ok(framed)
}

fn offset(base: u64, delta_ms: i64) -> u64 {
    base.saturating_add_signed(delta_ms)
}

fn decode_frame(body: &[u8]) -> Result<(FrameHeader, Vec<u8>), LogError> {
    if body.len() < 2 {
        return Err(LogError::Corrupt(format!("frame of {} bytes", body.len())));
    }
    let header_len = u16::from_le_bytes([body[0], body[1]]) as usize;
    let header_end = 2 + header_len;
    if body.len() < header_end {
        return Err(LogError::Corrupt(format!(
            "header length {} exceeds frame of {} bytes",
            header_len,
            body.len()
        )));
    }
    let header: FrameHeader = rmp_serde::from_slice(&body[2..header_end])
        .map_err(|e| LogError::Wire(WdmError::Deserialization(e)))?;
    Ok((header, body[header_end..].to_vec()))
}

fn into_stored(header: FrameHeader, system_time_ms: u64, payload: Vec<u8>) -> StoredEvent {
    StoredEvent {
        seq: EventId::new(header.seq),
        record: EventRecord {
            importance: header.importance,
            event_id: header.event_id,
            system_time_ms,
            utc_time_ms: header.utc_time_ms,
            source_id: header.source_id,
            resource_id: header.resource_id,
            related: header.related,
            urgent: header.urgent,
            profile_id: header.profile_id,
            structure_type: header.structure_type,
            data_schema_version: header.data_schema_version,
            payload,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(at: u64) -> EventMeta {
        EventMeta {
            importance: Importance::Info,
            event_id: None,
            system_time_ms: at,
            utc_time_ms: None,
            source_id: 1,
            resource_id: 1,
            related: None,
            urgent: false,
            profile_id: 0x0A01,
            structure_type: 1,
            data_schema_version: 1,
        }
    }

    fn append(tier: &mut TierBuffer, at: u64, payload: &[u8]) -> Result<EventId, AppendFailure> {
        tier.try_append(&meta(at), &mut |w: &mut FrameWriter<'_>| w.write_all(payload))
    }

    #[test]
    fn append_vends_increasing_ids() {
        let mut tier = TierBuffer::new(Importance::Info, 256, EventCounter::volatile(0));
        let a = append(&mut tier, 100, b"a").unwrap();
        let b = append(&mut tier, 110, b"b").unwrap();
        assert_eq!(a, EventId::new(1));
        assert_eq!(b, EventId::new(2));
        assert_eq!(tier.first_event_id(), EventId::new(1));
        assert_eq!(tier.last_event_id(), EventId::new(2));
    }

    #[test]
    fn scan_restores_timestamps() {
        let mut tier = TierBuffer::new(Importance::Info, 256, EventCounter::volatile(0));
        append(&mut tier, 1_000, b"a").unwrap();
        append(&mut tier, 1_250, b"b").unwrap();
        append(&mut tier, 1_240, b"c").unwrap();

        let times: Vec<u64> = tier
            .scan_from(EventId::zero())
            .map(|e| e.unwrap().record.system_time_ms)
            .collect();
        assert_eq!(times, vec![1_000, 1_250, 1_240]);
    }

    #[test]
    fn scan_from_skips_earlier_frames() {
        let mut tier = TierBuffer::new(Importance::Info, 256, EventCounter::volatile(0));
        for i in 0..4 {
            append(&mut tier, 10 * i, &[i as u8]).unwrap();
        }
        let seqs: Vec<u64> = tier
            .scan_from(EventId::new(3))
            .map(|e| e.unwrap().seq.value())
            .collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn full_tier_reports_full_and_keeps_counter() {
        let mut tier = TierBuffer::new(Importance::Info, 64, EventCounter::volatile(0));
        while append(&mut tier, 5, &[0u8; 8]).is_ok() {}
        let last = tier.last_event_id();

        assert!(matches!(
            append(&mut tier, 5, &[0u8; 8]),
            Err(AppendFailure::Full)
        ));
        assert_eq!(tier.last_event_id(), last);
    }

    #[test]
    fn oversized_event_is_buffer_too_small() {
        let mut tier = TierBuffer::new(Importance::Info, 32, EventCounter::volatile(0));
        let result = append(&mut tier, 5, &[0u8; 64]);
        assert!(matches!(
            result,
            Err(AppendFailure::Fatal(LogError::BufferTooSmall { capacity: 32 }))
        ));
        assert_eq!(tier.event_count(), 0);
        assert_eq!(tier.last_event_id(), EventId::zero());
    }

    #[test]
    fn ensure_fits_judges_against_an_empty_tier() {
        let mut tier = TierBuffer::new(Importance::Info, 64, EventCounter::volatile(0));
        while append(&mut tier, 5, &[0u8; 8]).is_ok() {}
        let count = tier.event_count();

        let mut small = |w: &mut FrameWriter<'_>| w.write_all(&[0u8; 8]);
        assert!(tier.ensure_fits(&meta(5), &mut small).is_ok());
        let mut huge = |w: &mut FrameWriter<'_>| w.write_all(&[0u8; 64]);
        assert!(matches!(
            tier.ensure_fits(&meta(5), &mut huge),
            Err(LogError::BufferTooSmall { capacity: 64 })
        ));
        assert_eq!(tier.event_count(), count);
    }

    #[test]
    fn discard_advances_first_event_and_timestamp() {
        let mut tier = TierBuffer::new(Importance::Info, 256, EventCounter::volatile(0));
        append(&mut tier, 100, b"a").unwrap();
        append(&mut tier, 180, b"b").unwrap();

        assert_eq!(tier.discard_oldest().unwrap(), Some(EventId::new(1)));
        assert_eq!(tier.first_event_id(), EventId::new(2));
        assert_eq!(tier.first_timestamp(), 180);

        tier.discard_oldest().unwrap();
        assert_eq!(tier.event_count(), 0);
        assert_eq!(tier.first_event_id(), EventId::new(3));
        assert_eq!(tier.dropped_events(), 0);
    }

    #[test]
    fn drop_oldest_counts_losses() {
        let mut tier = TierBuffer::new(Importance::Info, 256, EventCounter::volatile(0));
        append(&mut tier, 1, b"a").unwrap();
        tier.drop_oldest().unwrap();
        tier.drop_oldest().unwrap();
        assert_eq!(tier.dropped_events(), 1);
    }

    #[test]
    fn promoted_meta_keeps_identity() {
        let mut tier = TierBuffer::new(Importance::Production, 256, EventCounter::volatile(40));
        let record = EventRecord {
            importance: Importance::Info,
            event_id: EventId::new(7),
            system_time_ms: 900,
            utc_time_ms: Some(5),
            source_id: 2,
            resource_id: 3,
            related: None,
            urgent: true,
            profile_id: 9,
            structure_type: 4,
            data_schema_version: 2,
            payload: b"xyz".to_vec(),
        };
        let seq = tier
            .try_append(
                &EventMeta::promoted(&record),
                &mut |w: &mut FrameWriter<'_>| w.write_all(&record.payload),
            )
            .unwrap();
        assert_eq!(seq, EventId::new(41));

        let stored = tier.oldest().unwrap().unwrap();
        assert_eq!(stored.seq, EventId::new(41));
        assert_eq!(stored.record, record);
    }
}
