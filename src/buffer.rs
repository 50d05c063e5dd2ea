use std::io;
use std::os::fd::RawFd;

use crate::sys;

/// Size of the fixed head slack kept in front of the readable region, so
/// that a length or type prefix can be prepended without moving data.
const CHEAP_PREPEND: usize = 8;

/// Initial size of the region behind the head slack.
const INITIAL_SIZE: usize = 1024;

/// Stack extension handed to `readv` so one syscall can absorb a large burst
/// even when the in-heap writable region is small.
const EXTENSION_SIZE: usize = 65536;

/// A growable FIFO byte queue with separate read and write indices.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (CONTENT)    |                  |
/// +-------------------+------------------+------------------+
/// 0      <=      reader_index  <=  writer_index    <=     len
/// ```
///
/// Appends write at `writer_index`, reads consume from `reader_index`, and
/// the slack in front of `reader_index` allows cheap in-place prepending of
/// small headers. Integer helpers use network byte order.
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// A buffer with `initial` writable bytes behind the head slack.
    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Offset into the readable region of the first `\r\n`, if any.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|pos| start + pos)
    }

    /// Offset into the readable region of the first `\n`, if any.
    pub fn find_eol(&self) -> Option<usize> {
        self.find_eol_from(0)
    }

    pub fn find_eol_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| start + pos)
    }

    /// Mark `len` readable bytes as consumed. Consuming everything resets
    /// both indices so the head slack is restored for free.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consume up to (exclusive) an offset previously obtained from one of
    /// the `find_*` helpers.
    pub fn retrieve_until(&mut self, offset: usize) {
        self.retrieve(offset);
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Copy out and consume `len` bytes.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Copy out and consume `len` bytes as UTF-8, replacing invalid
    /// sequences.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(len)).into_owned()
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn append_str(&mut self, data: &str) {
        self.append(data.as_bytes());
    }

    /// Grow (or shift readable data down) until at least `len` bytes are
    /// writable.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    /// Advance the write index after external code filled the writable
    /// region directly.
    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer_index += len;
    }

    /// Give back the last `len` appended bytes.
    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.writer_index -= len;
    }

    /// Write into the slack in front of the readable region. Requires that
    /// enough prependable bytes exist, which the initial head slack
    /// guarantees for up to 8 bytes on an otherwise untouched region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    pub fn append_u8(&mut self, x: u8) {
        self.append(&[x]);
    }

    pub fn append_u16(&mut self, x: u16) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_u32(&mut self, x: u32) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_u64(&mut self, x: u64) {
        self.append(&x.to_be_bytes());
    }

    pub fn peek_u8(&self) -> u8 {
        assert!(self.readable_bytes() >= 1);
        self.peek()[0]
    }

    pub fn peek_u16(&self) -> u16 {
        assert!(self.readable_bytes() >= 2);
        u16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_u64(&self) -> u64 {
        assert!(self.readable_bytes() >= 8);
        u64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    pub fn read_u8(&mut self) -> u8 {
        let x = self.peek_u8();
        self.retrieve(1);
        x
    }

    pub fn read_u16(&mut self) -> u16 {
        let x = self.peek_u16();
        self.retrieve(2);
        x
    }

    pub fn read_u32(&mut self) -> u32 {
        let x = self.peek_u32();
        self.retrieve(4);
        x
    }

    pub fn read_u64(&mut self) -> u64 {
        let x = self.peek_u64();
        self.retrieve(8);
        x
    }

    pub fn prepend_u8(&mut self, x: u8) {
        self.prepend(&[x]);
    }

    pub fn prepend_u16(&mut self, x: u16) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_u32(&mut self, x: u32) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_u64(&mut self, x: u64) {
        self.prepend(&x.to_be_bytes());
    }

    /// Reallocate down to the readable content plus `reserve` writable
    /// bytes.
    pub fn shrink(&mut self, reserve: usize) {
        let mut other = Buffer::with_capacity(self.readable_bytes() + reserve);
        other.append(self.peek());
        *self = other;
    }

    /// Total size of the backing region.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Read from `fd` directly into the buffer with one scatter syscall,
    /// using a 64 KiB stack extension; bytes landing in the extension are
    /// appended afterwards. Returns the byte count from `read(2)`.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extension = [0u8; EXTENSION_SIZE];
        let writable = self.writable_bytes();
        let start = self.writer_index;
        let n = sys::read_fd_with_extension(fd, &mut self.buf[start..], &mut extension)?;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extension[..n - writable]);
        }
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Enough dead slack in front; shift readable data down instead
            // of growing.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
            assert_eq!(readable, self.readable_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};

    #[test]
    fn append_retrieve_round_trip() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        let s = b"hello, buffer";
        buf.append(s);
        assert_eq!(buf.readable_bytes(), s.len());
        assert_eq!(buf.retrieve_as_bytes(s.len()), s);

        // Consuming everything resets both indices.
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn partial_retrieve_keeps_rest() {
        let mut buf = Buffer::new();
        buf.append_str("abcdefgh");
        buf.retrieve(3);
        assert_eq!(buf.peek(), b"defgh");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 3);
        assert_eq!(buf.retrieve_all_as_string(), "defgh");
    }

    #[test]
    fn grows_when_needed() {
        let mut buf = Buffer::new();
        let big = vec![b'x'; INITIAL_SIZE * 2];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), big.len());
        assert_eq!(buf.peek(), &big[..]);
    }

    #[test]
    fn shifts_instead_of_growing() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(700);
        let cap = buf.capacity();
        // 100 readable left, plenty of dead prependable slack: appending 400
        // must reuse it rather than reallocating.
        buf.append(&vec![b'b'; 400]);
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.readable_bytes(), 500);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn integer_round_trips_are_big_endian() {
        let mut buf = Buffer::new();
        buf.append_u64(0x0102_0304_0506_0708);
        buf.append_u32(0xdead_beef);
        buf.append_u16(0xcafe);
        buf.append_u8(0x7f);

        assert_eq!(
            buf.peek()[..8],
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
        assert_eq!(buf.read_u64(), 0x0102_0304_0506_0708);
        assert_eq!(buf.peek(), [0xde, 0xad, 0xbe, 0xef, 0xca, 0xfe, 0x7f]);
        assert_eq!(buf.read_u32(), 0xdead_beef);
        assert_eq!(buf.read_u16(), 0xcafe);
        assert_eq!(buf.read_u8(), 0x7f);
        assert!(buf.is_empty());
    }

    #[test]
    fn prepend_uses_head_slack() {
        let mut buf = Buffer::new();
        buf.append_str("payload");
        buf.prepend_u32(7);
        assert_eq!(buf.readable_bytes(), 4 + 7);
        assert_eq!(buf.read_u32(), 7);
        assert_eq!(buf.retrieve_all_as_string(), "payload");
    }

    #[test]
    fn search_helpers() {
        let mut buf = Buffer::new();
        buf.append_str("GET / HTTP/1.1\r\nHost: x\r\n");
        let crlf = buf.find_crlf().unwrap();
        assert_eq!(&buf.peek()[..crlf], b"GET / HTTP/1.1");
        assert!(buf.find_crlf_from(crlf + 2).is_some());

        let mut buf = Buffer::new();
        buf.append_str("line one\nline two");
        assert_eq!(buf.find_eol(), Some(8));
        assert_eq!(buf.find_eol_from(9), None);
    }

    #[test]
    fn unwrite_and_shrink() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'z'; 2000]);
        buf.unwrite(1500);
        assert_eq!(buf.readable_bytes(), 500);
        buf.shrink(0);
        assert_eq!(buf.readable_bytes(), 500);
        assert!(buf.capacity() <= CHEAP_PREPEND + 500 + CHEAP_PREPEND);
    }

    #[test]
    fn read_fd_absorbs_burst_through_extension() {
        use std::io::Write;
        use std::os::fd::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (reader, mut writer) = UnixStream::pair().unwrap();
        let payload = vec![b'p'; 4000];
        writer.write_all(&payload).unwrap();

        // A deliberately tiny buffer: most of the burst must arrive via the
        // stack extension.
        let mut buf = Buffer::with_capacity(16);
        let n = buf.read_fd(reader.as_raw_fd()).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);
    }
}
