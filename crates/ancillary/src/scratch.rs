//! Circular scratch area the capture hardware writes VBI packets into

/// Captured header bytes that precede the packet payload
const HEADER_BYTES: usize = 6;

/// Length a header-described packet occupies in the scratch ring.
///
/// The payload length sits in the low six bits of the fourth captured byte,
/// counted in 32-bit words; the hardware writes whole chunks.
pub fn packet_len(length_byte: u8, chunk_size: usize) -> usize {
    let bytes = usize::from(length_byte & 0x3f) * 4 + HEADER_BYTES;
    round_up(bytes, chunk_size)
}

fn round_up(value: usize, chunk: usize) -> usize {
    let chunk = chunk.max(1);
    value.div_ceil(chunk) * chunk
}

/// Span of captured bytes, split where the ring wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CapturedSpan {
    pub start: usize,
    /// Bytes from `start` to the end of the ring
    pub first: usize,
    /// Bytes from the start of the ring after wrapping
    pub second: usize,
}

impl CapturedSpan {
    pub fn len(&self) -> usize {
        self.first + self.second
    }
}

/// Zero-initialised circular byte area with separate hardware write and
/// software read positions
#[derive(Debug, Clone)]
pub struct ScratchRing {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    chunk_size: usize,
}

impl ScratchRing {
    pub fn new(size: usize, chunk_size: usize) -> Self {
        let size = round_up(size.max(chunk_size), chunk_size);
        Self {
            data: vec![0; size],
            read_pos: 0,
            write_pos: 0,
            chunk_size,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Zero the whole area and rewind both positions
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Write a packet the way the capture hardware does: at the hardware
    /// position, wrapping, padded to whole chunks
    pub fn hardware_write(&mut self, packet: &[u8]) {
        let len = self.data.len();
        for (offset, byte) in packet.iter().enumerate() {
            self.data[(self.write_pos + offset) % len] = *byte;
        }
        self.write_pos = (self.write_pos + round_up(packet.len().max(1), self.chunk_size)) % len;
    }

    /// Step over every packet present at the read position.
    ///
    /// A packet is present while its first byte is non-zero. Steps are a
    /// fixed page when one is configured, otherwise the header-encoded
    /// length. The walk never covers more than the whole ring.
    pub(crate) fn walk(&mut self, page_size: Option<usize>) -> CapturedSpan {
        let len = self.data.len();
        let start = self.read_pos;
        let mut pos = start;
        let mut covered = 0;

        while self.data[pos] != 0 && covered < len {
            let step = match page_size {
                Some(page) => page.max(1),
                None => packet_len(self.data[(pos + 3) % len], self.chunk_size),
            };
            covered += step;
            pos = (pos + step) % len;
        }
        self.read_pos = pos;

        if covered >= len {
            return CapturedSpan {
                start,
                first: len - start,
                second: start,
            };
        }
        if pos < start {
            CapturedSpan {
                start,
                first: len - start,
                second: pos,
            }
        } else {
            CapturedSpan {
                start,
                first: pos - start,
                second: 0,
            }
        }
    }

    /// Copy a captured span into `dest`, which must hold `span.len()` bytes
    pub(crate) fn copy_span(&self, span: CapturedSpan, dest: &mut [u8]) {
        dest[..span.first].copy_from_slice(&self.data[span.start..span.start + span.first]);
        dest[span.first..span.len()].copy_from_slice(&self.data[..span.second]);
    }

    /// Zero a captured span so the next walk stops at its end
    pub(crate) fn clear_span(&mut self, span: CapturedSpan) {
        self.data[span.start..span.start + span.first].fill(0);
        self.data[..span.second].fill(0);
    }
}
