//! Fixed-capacity byte ring holding length-framed records.
//!
//! Frames are appended at the tail and removed from the head, oldest first.
//! Each frame is stored as a little-endian `u32` body length followed by the
//! body, and may wrap around the end of the backing storage.
//!
//! Writing is two-phase: [`ByteRing::begin_frame`] hands out a
//! [`FrameWriter`] that streams the body straight into free space, and
//! nothing becomes visible until [`FrameWriter::commit`] is called. A writer
//! that runs out of space fails with [`io::ErrorKind::WriteZero`] and leaves
//! the ring untouched when dropped. [`ByteRing::measure_frame`] hands out a
//! writer that only counts, against the space of an empty ring.

use std::io;

/// Size of the length prefix in front of every frame.
pub const FRAME_PREFIX: usize = 4;

/// Fixed-capacity ring of length-framed byte records.
#[derive(Debug, Clone)]
pub struct ByteRing {
    buf: Vec<u8>,
    head: usize,
    used: usize,
    frames: usize,
}

impl ByteRing {
    /// Create a ring with `capacity` bytes of storage.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            head: 0,
            used: 0,
            frames: 0,
        }
    }

    /// Total storage in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes currently occupied, prefixes included.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still free.
    pub fn free(&self) -> usize {
        self.capacity() - self.used
    }

    /// Number of stored frames.
    pub fn len(&self) -> usize {
        self.frames
    }

    /// Check if the ring holds no frames.
    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Largest frame body an empty ring can hold.
    pub fn max_body(&self) -> usize {
        self.capacity().saturating_sub(FRAME_PREFIX)
    }

    /// Start writing a new frame at the tail.
    pub fn begin_frame(&mut self) -> FrameWriter<'_> {
        let limit = self.free().saturating_sub(FRAME_PREFIX);
        let start = self.offset(self.used);
        FrameWriter {
            ring: self,
            start,
            written: 0,
            limit,
            measuring: false,
        }
    }

    /// Start a frame that stores nothing and fails only if the body would
    /// not fit in the ring when empty. It can never be committed.
    pub fn measure_frame(&mut self) -> FrameWriter<'_> {
        let limit = self.max_body();
        FrameWriter {
            ring: self,
            start: 0,
            written: 0,
            limit,
            measuring: true,
        }
    }

    /// Copy of the oldest frame body.
    pub fn front(&self) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        let len = self.read_len(self.head);
        Some(self.copy_out(self.offset(FRAME_PREFIX), len))
    }

    /// Remove the oldest frame and return its body.
    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        let body = self.front()?;
        let total = FRAME_PREFIX + body.len();
        self.head = self.offset(total);
        self.used -= total;
        self.frames -= 1;
        if self.frames == 0 {
            self.head = 0;
        }
        Some(body)
    }

    /// Iterate over frame bodies, oldest first.
    pub fn iter(&self) -> Frames<'_> {
        Frames {
            ring: self,
            pos: 0,
            remaining: self.frames,
        }
    }

    /// Drop every frame.
    pub fn clear(&mut self) {
        self.head = 0;
        self.used = 0;
        self.frames = 0;
    }

    /// Physical index of the byte `delta` past the head.
    fn offset(&self, delta: usize) -> usize {
        if self.buf.is_empty() {
            return 0;
        }
        (self.head + delta) % self.buf.len()
    }

    fn read_len(&self, at: usize) -> usize {
        let mut raw = [0u8; FRAME_PREFIX];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = self.buf[(at + i) % self.buf.len()];
        }
        u32::from_le_bytes(raw) as usize
    }

    fn copy_out(&self, at: usize, len: usize) -> Vec<u8> {
        let cap = self.buf.len();
        let first = len.min(cap - at);
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&self.buf[at..at + first]);
        out.extend_from_slice(&self.buf[..len - first]);
        out
    }

    fn copy_in(&mut self, at: usize, data: &[u8]) {
        let cap = self.buf.len();
        let first = data.len().min(cap - at);
        self.buf[at..at + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
    }
}

/// Streams one frame body into a [`ByteRing`].
///
/// Dropping the writer without calling [`commit`](FrameWriter::commit)
/// discards everything written.
#[derive(Debug)]
pub struct FrameWriter<'a> {
    ring: &'a mut ByteRing,
    start: usize,
    written: usize,
    limit: usize,
    measuring: bool,
}

impl FrameWriter<'_> {
    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Bytes that can still be written.
    pub fn remaining(&self) -> usize {
        self.limit - self.written
    }

    /// Make the frame visible. Returns the stored size including the prefix.
    ///
    /// Fails if the ring has no room left for the length prefix.
    pub fn commit(self) -> io::Result<usize> {
        if self.measuring {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "measured frames cannot be committed",
            ));
        }
        let ring = self.ring;
        if ring.free() < FRAME_PREFIX + self.written {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "ring full"));
        }
        let prefix = (self.written as u32).to_le_bytes();
        ring.copy_in(self.start, &prefix);
        let total = FRAME_PREFIX + self.written;
        ring.used += total;
        ring.frames += 1;
        Ok(total)
    }
}

impl io::Write for FrameWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if data.len() > self.remaining() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "ring full"));
        }
        if !self.measuring {
            let cap = self.ring.buf.len();
            let at = (self.start + FRAME_PREFIX + self.written) % cap;
            self.ring.copy_in(at, data);
        }
        self.written += data.len();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Iterator over frame bodies, oldest first.
#[derive(Debug)]
pub struct Frames<'a> {
    ring: &'a ByteRing,
    pos: usize,
    remaining: usize,
}

impl Iterator for Frames<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let at = self.ring.offset(self.pos);
        let len = self.ring.read_len(at);
        let body = self
            .ring
            .copy_out(self.ring.offset(self.pos + FRAME_PREFIX), len);
        self.pos += FRAME_PREFIX + len;
        self.remaining -= 1;
        Some(body)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
