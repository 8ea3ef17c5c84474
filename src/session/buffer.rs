use std::collections::VecDeque;

/// Bounded byte buffer addressed by absolute cursors.
///
/// Cursors count every byte ever appended, so a reader holding a cursor can
/// tell whether data it never saw was evicted. The renderer cursor tracks how
/// far output has been handed to the attached sink.
#[derive(Debug)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    start_cursor: u64,
    rendered_cursor: u64,
    max_bytes: usize,
    max_lines: usize,
    line_count: usize,
}

#[derive(Debug, Clone)]
pub struct BufferSlice {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub dropped_bytes: u64,
    pub start_cursor: u64,
    pub end_cursor: u64,
    pub buffered_bytes: usize,
    pub buffer_limit_bytes: usize,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize, max_lines: usize) -> Self {
        Self {
            data: VecDeque::new(),
            start_cursor: 0,
            rendered_cursor: 0,
            max_bytes: max_bytes.max(1),
            max_lines: max_lines.max(1),
            line_count: 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        self.line_count += bytes.iter().filter(|&&byte| byte == b'\n').count();
        self.data.extend(bytes.iter().copied());
        self.enforce_limits()
    }

    pub fn buffer_start(&self) -> u64 {
        self.start_cursor
    }

    pub fn buffer_end(&self) -> u64 {
        self.start_cursor + self.data.len() as u64
    }

    pub fn buffered_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn slice_from(&self, cursor: u64, max_bytes: usize) -> BufferSlice {
        let end_cursor = self.buffer_end();
        let truncated = cursor < self.start_cursor;
        let dropped_bytes = self.start_cursor.saturating_sub(cursor);
        let effective = cursor.clamp(self.start_cursor, end_cursor);
        let start_index = (effective - self.start_cursor) as usize;
        let read_len = self.data.len().saturating_sub(start_index).min(max_bytes);
        let bytes = self
            .data
            .range(start_index..start_index + read_len)
            .copied()
            .collect();

        BufferSlice {
            bytes,
            truncated,
            dropped_bytes,
            start_cursor: self.start_cursor,
            end_cursor,
            buffered_bytes: self.data.len(),
            buffer_limit_bytes: self.max_bytes,
        }
    }

    pub fn tail(&self, max_bytes: usize) -> BufferSlice {
        let from = self.buffer_end().saturating_sub(max_bytes as u64);
        self.slice_from(from.max(self.start_cursor), max_bytes)
    }

    pub fn take_unrendered(&mut self) -> Vec<u8> {
        let slice = self.slice_from(self.rendered_cursor, self.data.len());
        self.rendered_cursor = slice.end_cursor;
        slice.bytes
    }

    pub fn rewind_renderer(&mut self) {
        self.rendered_cursor = self.start_cursor;
    }

    fn enforce_limits(&mut self) -> u64 {
        let mut dropped = 0u64;
        while self.data.len() > self.max_bytes || self.line_count > self.max_lines {
            let Some(byte) = self.data.pop_front() else {
                break;
            };
            dropped += 1;
            self.start_cursor += 1;
            if byte == b'\n' {
                self.line_count = self.line_count.saturating_sub(1);
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_drops_oldest_on_max_bytes() {
        let mut buffer = OutputBuffer::new(5, 10);
        buffer.append(b"hello");
        let dropped = buffer.append(b"world");

        assert_eq!(dropped, 5);
        assert_eq!(buffer.buffer_start(), 5);
        assert_eq!(buffer.buffer_end(), 10);
        let slice = buffer.slice_from(0, 10);
        assert!(slice.truncated);
        assert_eq!(slice.dropped_bytes, 5);
        assert_eq!(slice.bytes, b"world");
    }

    #[test]
    fn buffer_limits_lines() {
        let mut buffer = OutputBuffer::new(100, 2);
        buffer.append(b"a\nb\nc\n");
        let slice = buffer.slice_from(buffer.buffer_start(), 100);
        assert_eq!(slice.bytes, b"b\nc\n");
    }

    #[test]
    fn renderer_sees_each_byte_once() {
        let mut buffer = OutputBuffer::new(100, 100);
        buffer.append(b"abc");
        assert_eq!(buffer.take_unrendered(), b"abc");
        assert!(buffer.take_unrendered().is_empty());
        buffer.append(b"de");
        assert_eq!(buffer.take_unrendered(), b"de");
        buffer.rewind_renderer();
        assert_eq!(buffer.take_unrendered(), b"abcde");
    }

    #[test]
    fn tail_returns_trailing_bytes() {
        let mut buffer = OutputBuffer::new(100, 10);
        buffer.append(b"line1\nline2\n");
        let tail = buffer.tail(6);
        assert_eq!(tail.bytes, b"line2\n");
        assert!(!tail.truncated);
    }
}
