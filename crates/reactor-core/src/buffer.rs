use std::io::{self, IoSliceMut, Read, Write};

/// Reserved headroom at the front of the backing array, big enough to
/// prepend a 4-byte length header twice over without reallocating.
const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;
/// Size of the stack-allocated scatter-read extension (§4.1). A single
/// `read_from` absorbs up to this many bytes beyond current capacity
/// without growing the backing array first.
const EXTRA_BUF_SIZE: usize = 65536;

/// An expandable byte sequence split into three contiguous regions:
/// `prependable`, `readable`, and `writable` (§3). Used for both a
/// connection's input and output buffers.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_initial_size(INITIAL_SIZE)
    }

    pub fn with_initial_size(size: usize) -> Self {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + size],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Drops `n` bytes from the front of the readable region. `n >=
    /// readable_bytes()` resets both indices back to the headroom offset,
    /// matching the original's `retrieveAll` behavior exactly (this is the
    /// "prependable >= 8 after any retrieveAll" invariant from §3).
    pub fn retrieve(&mut self, n: usize) {
        if n >= self.readable_bytes() {
            self.retrieve_all();
        } else {
            self.read_index += n;
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consumes and returns up to `n` readable bytes (clamped to what's
    /// actually available).
    pub fn retrieve_as_bytes(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.readable_bytes());
        let out = self.peek()[..n].to_vec();
        self.retrieve(n);
        out
    }

    /// Same as [`retrieve_as_bytes`](Self::retrieve_as_bytes) but lossily
    /// decoded as UTF-8 -- the original treats buffer contents as an opaque
    /// byte string; we surface both views and let callers pick.
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(n)).into_owned()
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Appends `data` to the writable region, growing the backing array if
    /// needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Guarantees at least `n` writable bytes, per §3's `makeSpace`
    /// semantics: slide the readable bytes left to the headroom offset if
    /// that alone frees enough room, otherwise grow the array to fit.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
    }

    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            self.buf.resize(self.write_index + n, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = self.read_index + readable;
        }
    }

    /// Scatter read (§4.1): reads directly into the writable tail, spilling
    /// into a 64 KiB stack extension if the kernel hands back more than fits.
    /// Returns `0` on a clean EOF, same as a plain `read`.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let writable = self.writable_bytes();
        let mut extra = [0u8; EXTRA_BUF_SIZE];

        let n = if writable >= EXTRA_BUF_SIZE {
            reader.read(&mut self.buf[self.write_index..])?
        } else {
            let mut slices = [
                IoSliceMut::new(&mut self.buf[self.write_index..]),
                IoSliceMut::new(&mut extra),
            ];
            reader.read_vectored(&mut slices)?
        };

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }

        Ok(n)
    }

    /// A single `write` of the full readable region; the caller decides
    /// whether to `retrieve` the bytes actually written (§4.1's write never
    /// mutates the buffer itself).
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<usize> {
        writer.write(self.peek())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.retrieve_as_string(11), "hello world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn invariants_hold_after_retrieve_all() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.retrieve_all();
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn make_space_grows_when_sliding_is_not_enough() {
        let mut buf = Buffer::with_initial_size(16);
        buf.append(&[0u8; 16]);
        buf.retrieve(8);
        buf.ensure_writable(100);
        assert!(buf.writable_bytes() >= 100);
        assert_eq!(buf.readable_bytes(), 8);
    }

    #[test]
    fn make_space_slides_when_enough_room_is_freed() {
        let mut buf = Buffer::with_initial_size(64);
        buf.append(&[1u8; 60]);
        buf.retrieve(60);
        buf.append(&[2u8; 4]);
        let cap_before = buf.buf.len();
        buf.ensure_writable(50);
        assert_eq!(buf.buf.len(), cap_before, "slide should avoid growing");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn read_from_absorbs_more_than_writable_via_extension() {
        let writable_target = 10usize;
        let mut buf = Buffer::with_initial_size(writable_target);
        // Drain buf down to exactly `writable_target` writable bytes.
        while buf.writable_bytes() > writable_target {
            buf.append(&[0]);
        }
        buf.retrieve_all();
        let payload = vec![7u8; writable_target + 1000];
        let mut cursor = Cursor::new(payload.clone());
        let n = buf.read_from(&mut cursor).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.readable_bytes(), payload.len());
        assert_eq!(buf.retrieve_as_bytes(payload.len()), payload);
    }

    #[test]
    fn write_to_does_not_advance_read_index() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        let mut sink = Vec::new();
        let n = buf.write_to(&mut sink).unwrap();
        assert_eq!(n, 7);
        assert_eq!(sink, b"payload");
        assert_eq!(buf.readable_bytes(), 7, "write_to must not retrieve");
    }
}
