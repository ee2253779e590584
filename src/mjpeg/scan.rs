//! Marker-scanning payload extraction.
//!
//! MJPEG-over-HTTP bodies are treated as an unbounded, un-chunk-aligned
//! byte stream. Instead of trusting multipart boundary headers (best-effort
//! at most, and absent on many cameras), the scanner locates JPEG start
//! (`FF D8`) and end (`FF D9`) markers directly. Everything before a
//! decoded start marker is dropped with the extracted payload; with no end
//! marker yet, the buffer is left intact and more bytes are awaited.
//!
//! The accumulator is owned exclusively by the multipart engine's worker
//! and is recreated on every reconnect, so no payload is ever assembled
//! across reconnect epochs.

use log::warn;

const START_MARKER: [u8; 2] = [0xFF, 0xD8];
const END_MARKER: [u8; 2] = [0xFF, 0xD9];

/// Accumulates raw stream bytes and yields complete image payloads.
pub(crate) struct MarkerScanner {
    buffer: Vec<u8>,
    max_payload_bytes: usize,
}

impl MarkerScanner {
    pub(crate) fn new(max_payload_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            max_payload_bytes,
        }
    }

    /// Append a chunk of stream bytes to the accumulator tail.
    ///
    /// The accumulator has no terminating marker to bound it on hostile or
    /// malformed input, so growth past twice the payload cap is truncated
    /// from the head, keeping one byte of a potential split marker.
    pub(crate) fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() > self.max_payload_bytes * 2 {
            let keep = 1.min(self.buffer.len());
            let dropped = self.buffer.len() - keep;
            self.buffer.drain(..dropped);
            warn!(
                "marker scanner discarded {} unframed bytes (payload cap {})",
                dropped, self.max_payload_bytes
            );
        }
    }

    /// Extract the next complete payload, consuming it (and any noise
    /// before its start marker) from the head of the accumulator.
    pub(crate) fn next_payload(&mut self) -> Option<Vec<u8>> {
        let start = find_marker(&self.buffer, &START_MARKER, 0)?;
        let end = find_marker(&self.buffer, &END_MARKER, start)? + END_MARKER.len();
        let payload = self.buffer[start..end].to_vec();
        self.buffer.drain(..end);
        Some(payload)
    }

    #[cfg(test)]
    pub(crate) fn residual(&self) -> &[u8] {
        &self.buffer
    }
}

fn find_marker(buffer: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    if buffer.len() < from + marker.len() {
        return None;
    }
    buffer[from..]
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|pos| from + pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(body: &[u8]) -> Vec<u8> {
        let mut bytes = START_MARKER.to_vec();
        bytes.extend_from_slice(body);
        bytes.extend_from_slice(&END_MARKER);
        bytes
    }

    #[test]
    fn extracts_payloads_in_order_with_leading_noise() {
        let mut scanner = MarkerScanner::new(1024);
        let first = payload(b"one");
        let second = payload(b"two");

        scanner.extend(b"noise before the first marker");
        scanner.extend(&first);
        scanner.extend(&second);
        scanner.extend(b"tail");

        assert_eq!(scanner.next_payload().as_deref(), Some(&first[..]));
        assert_eq!(scanner.next_payload().as_deref(), Some(&second[..]));
        assert!(scanner.next_payload().is_none());
        // Residue is exactly the bytes after the last end marker.
        assert_eq!(scanner.residual(), b"tail");
    }

    #[test]
    fn split_across_chunks_is_reassembled() {
        let mut scanner = MarkerScanner::new(1024);
        let whole = payload(b"split payload body");
        let (head, tail) = whole.split_at(5);

        scanner.extend(head);
        assert!(scanner.next_payload().is_none());

        scanner.extend(tail);
        assert_eq!(scanner.next_payload().as_deref(), Some(&whole[..]));
    }

    #[test]
    fn start_without_end_keeps_buffer_intact() {
        let mut scanner = MarkerScanner::new(1024);
        let mut partial = START_MARKER.to_vec();
        partial.extend_from_slice(b"no end marker yet");
        scanner.extend(&partial);

        assert!(scanner.next_payload().is_none());
        assert_eq!(scanner.residual(), &partial[..]);
    }

    #[test]
    fn end_marker_before_start_is_ignored() {
        let mut scanner = MarkerScanner::new(1024);
        let whole = payload(b"real");
        scanner.extend(&END_MARKER);
        scanner.extend(&whole);

        // The end-marker search begins at the start marker's position.
        assert_eq!(scanner.next_payload().as_deref(), Some(&whole[..]));
    }

    #[test]
    fn unframed_growth_is_truncated() {
        let mut scanner = MarkerScanner::new(16);
        scanner.extend(&[0u8; 64]);
        assert!(scanner.residual().len() <= 33);
        assert!(scanner.next_payload().is_none());
    }
}
