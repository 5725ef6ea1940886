//! Git pkt-line format implementation.
//!
//! The pkt-line format is used for all git protocol communication.
//! Each line is prefixed with a 4-character hex length, or "0000" for flush.
//! The side-band variant prefixes the payload with a single stream code so
//! progress and error text can travel alongside protocol data.

use crate::service::ServiceType;
use crate::{GitError, Result};
use std::io::{ErrorKind, Read, Write};

/// The flush packet.
pub const FLUSH_PKT: &[u8; 4] = b"0000";

/// Largest value the 4-digit length header can carry.
const MAX_PKT_LEN: usize = 0xffff;

/// Largest payload of a single pkt-line.
pub const MAX_PKT_DATA: usize = MAX_PKT_LEN - 4;

/// Largest payload a single side-band frame carries (side-band-64k).
const MAX_SIDEBAND_DATA: usize = 65515;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Encodes the packet to bytes.
    ///
    /// An empty data packet is indistinguishable from a flush on the wire and
    /// is encoded as one. Payloads over [`MAX_PKT_DATA`] bytes are refused.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Data(data) if data.len() > MAX_PKT_DATA => {
                Err(GitError::PayloadTooLarge(data.len()))
            }
            Self::Data(data) => Ok(frame(data)),
            Self::Flush => Ok(FLUSH_PKT.to_vec()),
        }
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for a flush.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            Self::Flush => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// Encodes a payload as a single pkt-line. Empty payloads become a flush.
///
/// Fails with [`GitError::PayloadTooLarge`] when the payload does not fit in
/// one packet.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PKT_DATA {
        return Err(GitError::PayloadTooLarge(payload.len()));
    }
    Ok(frame(payload))
}

/// Frames a payload already known to fit in one packet.
fn frame(payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return FLUSH_PKT.to_vec();
    }
    let len = payload.len() + 4;
    let mut result = Vec::with_capacity(len);
    result.extend_from_slice(format!("{:04x}", len).as_bytes());
    result.extend_from_slice(payload);
    result
}

/// Parses a 4-byte length header.
///
/// Returns 0 for a flush, otherwise the total packet length including the
/// header itself.
fn parse_len(header: &[u8; 4]) -> Result<usize> {
    if !header.iter().all(u8::is_ascii_hexdigit) {
        return Err(GitError::InvalidPktLine(format!(
            "invalid length prefix {:?}",
            String::from_utf8_lossy(header)
        )));
    }

    // Only ASCII hex digits reach this point, so both conversions succeed.
    let len = std::str::from_utf8(header)
        .ok()
        .and_then(|s| u16::from_str_radix(s, 16).ok())
        .ok_or_else(|| GitError::InvalidPktLine("invalid length".to_string()))?
        as usize;

    match len {
        0 => Ok(0),
        1..=3 => Err(GitError::InvalidPktLine(format!("length too small: {len}"))),
        _ => Ok(len),
    }
}

/// Decodes exactly one pkt-line from the front of `input`.
///
/// Returns the packet and the bytes following it, which callers treat as
/// opaque (for a push, the pack data after the negotiation line).
pub fn decode(input: &[u8]) -> Result<(PktLine, &[u8])> {
    let Some(header) = input.get(..4) else {
        return Err(GitError::TruncatedPacket {
            expected: 4,
            actual: input.len(),
        });
    };
    let mut len_buf = [0u8; 4];
    len_buf.copy_from_slice(header);

    let len = parse_len(&len_buf)?;
    if len == 0 {
        return Ok((PktLine::Flush, &input[4..]));
    }

    let body = &input[4..];
    let data_len = len - 4;
    if body.len() < data_len {
        return Err(GitError::TruncatedPacket {
            expected: data_len,
            actual: body.len(),
        });
    }

    let (data, rest) = body.split_at(data_len);
    Ok((PktLine::Data(data.to_vec()), rest))
}

/// Side-band stream codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamCode {
    /// Pack data.
    PackData = 1,
    /// Human-readable progress text.
    Progress = 2,
    /// Fatal error text; the client aborts after printing it.
    Fatal = 3,
}

impl StreamCode {
    /// The byte that prefixes a frame on this stream.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Encodes side-band frames carrying `message` on stream `code`.
///
/// Messages longer than one side-band-64k frame are split across frames, so
/// this never fails.
pub fn encode_sideband(code: StreamCode, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 5);
    for chunk in message.chunks(MAX_SIDEBAND_DATA) {
        let mut data = Vec::with_capacity(chunk.len() + 1);
        data.push(code.as_byte());
        data.extend_from_slice(chunk);
        out.extend_from_slice(&frame(&data));
    }
    out
}

/// Encodes the `# service=...` preamble of a GET ref discovery response,
/// followed by a flush.
pub fn encode_ref_advertisement(service: ServiceType) -> Vec<u8> {
    let mut out = frame(format!("# service={}\n", service).as_bytes());
    out.extend_from_slice(FLUSH_PKT);
    out
}

/// Reader for pkt-line format.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet, or `None` on a clean end of stream.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        match read_full(&mut self.reader, &mut len_buf)? {
            0 => return Ok(None),
            4 => {}
            n => {
                return Err(GitError::TruncatedPacket {
                    expected: 4,
                    actual: n,
                })
            }
        }

        let len = parse_len(&len_buf)?;
        if len == 0 {
            return Ok(Some(PktLine::Flush));
        }

        let data_len = len - 4;
        let mut data = vec![0u8; data_len];
        let read = read_full(&mut self.reader, &mut data)?;
        if read < data_len {
            return Err(GitError::TruncatedPacket {
                expected: data_len,
                actual: read,
            });
        }

        Ok(Some(PktLine::Data(data)))
    }

    /// Returns a mutable reference to the inner reader, positioned right
    /// after the last packet read.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}

/// Fills `buf` as far as the stream allows. Returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Follows pkt-line framing across the chunks of a byte stream and holds
/// back a flush packet that ends the stream so far.
///
/// Used to pass through the output of an external process while keeping its
/// closing flush for later, so more frames can still go in front of it.
/// Framing that stops parsing switches to plain pass-through.
#[derive(Debug, Default)]
pub struct TrailingFlush {
    header: Vec<u8>,
    remaining: usize,
    held: bool,
    passthrough: bool,
}

impl TrailingFlush {
    /// Creates a tracker at the start of a stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the next chunk of the stream and returns the bytes that can
    /// be forwarded now.
    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 4);
        if std::mem::take(&mut self.held) {
            out.extend_from_slice(FLUSH_PKT);
        }

        let mut rest = data;
        while !rest.is_empty() {
            if self.passthrough {
                out.extend_from_slice(rest);
                break;
            }

            if self.remaining > 0 {
                let n = self.remaining.min(rest.len());
                out.extend_from_slice(&rest[..n]);
                self.remaining -= n;
                rest = &rest[n..];
                continue;
            }

            let n = (4 - self.header.len()).min(rest.len());
            self.header.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if self.header.len() < 4 {
                break;
            }

            let mut header = [0u8; 4];
            header.copy_from_slice(&self.header);
            self.header.clear();

            match parse_len(&header) {
                Ok(0) if rest.is_empty() => self.held = true,
                Ok(len) => {
                    out.extend_from_slice(&header);
                    self.remaining = len.saturating_sub(4);
                }
                // Delimiter packets ("0001", "0002") carry no payload.
                Err(_) if matches!(&header, b"0001" | b"0002" | b"0003") => {
                    out.extend_from_slice(&header)
                }
                Err(_) => {
                    out.extend_from_slice(&header);
                    self.passthrough = true;
                }
            }
        }
        out
    }

    /// Returns true if the stream so far ends with a held back flush packet.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Ends the stream. Returns the bytes of an incomplete trailing header
    /// and whether a flush packet is still held back.
    pub fn finish(self) -> (Vec<u8>, bool) {
        (self.header, self.held)
    }
}

/// Whether the transport behind a [`SidebandWriter`] delivers bytes to the
/// peer when flushed, or only accumulates them until the response completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Every frame is followed by a flush of the transport.
    Incremental,
    /// Frames are written but the transport is never flushed here.
    Buffered,
}

/// Writes side-band frames in issue order.
///
/// Messages longer than one side-band-64k frame are split across frames.
pub struct SidebandWriter<W> {
    writer: W,
    mode: FlushMode,
}

impl<W: Write> SidebandWriter<W> {
    /// Creates a side-band writer over `writer`.
    pub fn new(writer: W, mode: FlushMode) -> Self {
        Self { writer, mode }
    }

    /// Writes `data` on the given stream.
    pub fn write_band(&mut self, code: StreamCode, data: &[u8]) -> Result<()> {
        self.writer.write_all(&encode_sideband(code, data))?;
        self.flush_transport()
    }

    /// Writes progress text.
    pub fn progress(&mut self, data: &[u8]) -> Result<()> {
        self.write_band(StreamCode::Progress, data)
    }

    /// Writes a fatal error, formatted as `error: <msg>\n`.
    pub fn fatal(&mut self, msg: &str) -> Result<()> {
        self.write_band(StreamCode::Fatal, format!("error: {msg}\n").as_bytes())
    }

    fn flush_transport(&mut self) -> Result<()> {
        if self.mode == FlushMode::Incremental {
            self.writer.flush()?;
        }
        Ok(())
    }

    /// Returns the flush mode this writer was created with.
    pub fn mode(&self) -> FlushMode {
        self.mode
    }

    /// Returns a mutable reference to the transport.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Returns the transport.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Records bytes and how many times it was flushed.
    #[derive(Default)]
    struct CountingWriter {
        bytes: Vec<u8>,
        flushes: usize,
    }

    impl Write for CountingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_pktline_encode() {
        assert_eq!(
            PktLine::from_string("hello\n").encode().unwrap(),
            b"000ahello\n"
        );
        assert_eq!(PktLine::Flush.encode().unwrap(), b"0000");
        assert_eq!(encode(b"Hello world").unwrap(), b"000fHello world");
        assert_eq!(
            encode("☃woooo☃☃woooo".as_bytes()).unwrap(),
            "0017☃woooo☃☃woooo".as_bytes()
        );
    }

    #[test]
    fn test_encode_empty_is_flush() {
        assert_eq!(encode(b"").unwrap(), b"0000");
        assert_eq!(PktLine::from_bytes(Vec::new()).encode().unwrap(), b"0000");
    }

    #[test]
    fn test_encode_largest_payload() {
        let data = vec![b'a'; MAX_PKT_DATA];
        let encoded = encode(&data).unwrap();
        assert_eq!(&encoded[..4], b"ffff");

        let (pkt, rest) = decode(&encoded).unwrap();
        assert_eq!(pkt.data(), Some(data.as_slice()));
        assert!(rest.is_empty());
    }

    #[test]
    fn test_encode_refuses_oversized_payload() {
        assert!(matches!(
            encode(&vec![b'a'; 70000]),
            Err(GitError::PayloadTooLarge(70000))
        ));
        assert!(matches!(
            PktLine::from_bytes(vec![b'a'; MAX_PKT_DATA + 1]).encode(),
            Err(GitError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_encode_sideband() {
        assert_eq!(
            encode_sideband(StreamCode::Progress, b"Hello world"),
            b"0010\x02Hello world"
        );
        assert_eq!(
            encode_sideband(StreamCode::Progress, "☃woooo☃☃woooo".as_bytes()),
            "0018\u{2}☃woooo☃☃woooo".as_bytes()
        );
        assert_eq!(encode_sideband(StreamCode::Fatal, b"x"), b"0006\x03x");
    }

    #[test]
    fn test_encode_sideband_splits_large_messages() {
        let message = vec![b'x'; 70000];
        let encoded = encode_sideband(StreamCode::Progress, &message);

        let (first, rest) = decode(&encoded).unwrap();
        let (second, rest) = decode(rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(first.data().unwrap().len(), MAX_SIDEBAND_DATA + 1);
        assert_eq!(second.data().unwrap().len(), 70000 - MAX_SIDEBAND_DATA + 1);
        assert_eq!(second.data().unwrap()[0], 2);
    }

    #[test]
    fn test_encode_ref_advertisement() {
        assert_eq!(
            encode_ref_advertisement(ServiceType::ReceivePack),
            b"001f# service=git-receive-pack\n0000"
        );
    }

    #[test]
    fn test_decode_returns_remainder() {
        let (pkt, rest) = decode(b"0009test\nPACKxyz").unwrap();
        assert_eq!(pkt, PktLine::from_string("test\n"));
        assert_eq!(rest, b"PACKxyz");
    }

    #[test]
    fn test_decode_flush() {
        let (pkt, rest) = decode(b"0000rest").unwrap();
        assert!(pkt.is_flush());
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn test_decode_uppercase_length() {
        let (pkt, _) = decode(b"000Fhello world").unwrap();
        assert_eq!(pkt.data(), Some(b"hello world".as_slice()));
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            decode(b"000ahi"),
            Err(GitError::TruncatedPacket {
                expected: 6,
                actual: 2
            })
        ));
        assert!(matches!(
            decode(b"00"),
            Err(GitError::TruncatedPacket { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_non_hex() {
        assert!(matches!(
            decode(b"zz10hello"),
            Err(GitError::InvalidPktLine(_))
        ));
        // from_str_radix would accept a sign; the header must not.
        assert!(matches!(
            decode(b"+00ahello!"),
            Err(GitError::InvalidPktLine(_))
        ));
    }

    #[test]
    fn test_reader_reads_encoded_packets() {
        let mut buf = encode(b"hello\n").unwrap();
        buf.extend_from_slice(&encode(b"world\n").unwrap());
        buf.extend_from_slice(FLUSH_PKT);

        let mut reader = PktLineReader::new(Cursor::new(buf));
        assert_eq!(reader.read().unwrap(), Some(PktLine::from_string("hello\n")));
        assert_eq!(reader.read().unwrap(), Some(PktLine::from_string("world\n")));
        assert_eq!(reader.read().unwrap(), Some(PktLine::Flush));
        assert_eq!(reader.read().unwrap(), None);
    }

    #[test]
    fn test_pktline_as_str() {
        let pkt = PktLine::from_string("hello\n");
        assert_eq!(pkt.as_str(), Some("hello"));
        assert!(PktLine::from_bytes(vec![0xff, 0xfe]).as_str().is_none());
        assert!(PktLine::Flush.as_str().is_none());
    }

    #[test]
    fn test_reader_truncated_payload() {
        let mut reader = PktLineReader::new(Cursor::new(b"0010short".to_vec()));
        assert!(matches!(
            reader.read(),
            Err(GitError::TruncatedPacket {
                expected: 12,
                actual: 5
            })
        ));
    }

    #[test]
    fn test_reader_truncated_header() {
        let mut reader = PktLineReader::new(Cursor::new(b"00".to_vec()));
        assert!(matches!(
            reader.read(),
            Err(GitError::TruncatedPacket { expected: 4, .. })
        ));
    }

    #[test]
    fn test_reader_invalid_length() {
        let mut reader = PktLineReader::new(Cursor::new(b"0003".to_vec()));
        assert!(reader.read().is_err());
    }

    #[test]
    fn test_reader_leaves_remainder_untouched() {
        let mut reader = PktLineReader::new(Cursor::new(b"0008abcdPACK\x00\x01".to_vec()));
        assert_eq!(reader.read().unwrap(), Some(PktLine::from_string("abcd")));

        let mut rest = Vec::new();
        reader.inner_mut().read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"PACK\x00\x01");
    }

    #[test]
    fn test_trailing_flush_is_held() {
        let mut framing = TrailingFlush::new();
        assert_eq!(framing.feed(b"0009\x02one\n0000"), b"0009\x02one\n");
        assert!(framing.is_held());
        assert_eq!(framing.finish(), (Vec::new(), true));
    }

    #[test]
    fn test_held_flush_is_released_by_more_data() {
        let mut framing = TrailingFlush::new();
        assert_eq!(framing.feed(b"0000"), b"");
        assert_eq!(framing.feed(b"0009\x02two\n"), b"00000009\x02two\n");
        assert!(!framing.is_held());
    }

    #[test]
    fn test_trailing_flush_split_across_chunks() {
        let mut framing = TrailingFlush::new();
        assert_eq!(framing.feed(b"0008ab"), b"0008ab");
        assert_eq!(framing.feed(b"cd00"), b"cd");
        assert_eq!(framing.feed(b"00"), b"");
        assert_eq!(framing.finish(), (Vec::new(), true));
    }

    #[test]
    fn test_flush_inside_payload_is_not_held() {
        let mut framing = TrailingFlush::new();
        assert_eq!(framing.feed(b"000cabcd0000"), b"000cabcd0000");
        assert!(!framing.is_held());
    }

    #[test]
    fn test_trailing_flush_passes_through_garbage() {
        let mut framing = TrailingFlush::new();
        assert_eq!(framing.feed(b"PACK0000"), b"PACK0000");
        assert!(!framing.is_held());
    }

    #[test]
    fn test_trailing_flush_keeps_incomplete_header() {
        let mut framing = TrailingFlush::new();
        assert_eq!(framing.feed(b"0005x00"), b"0005x");
        assert_eq!(framing.finish(), (b"00".to_vec(), false));
    }

    #[test]
    fn test_sideband_writer_flushes_each_frame() {
        let mut writer = SidebandWriter::new(CountingWriter::default(), FlushMode::Incremental);
        writer.progress(b"one\n").unwrap();
        writer.progress(b"two\n").unwrap();

        let inner = writer.into_inner();
        assert_eq!(inner.flushes, 2);
        assert_eq!(inner.bytes, b"0009\x02one\n0009\x02two\n");
    }

    #[test]
    fn test_sideband_writer_buffered_never_flushes() {
        let mut writer = SidebandWriter::new(CountingWriter::default(), FlushMode::Buffered);
        writer.progress(b"one\n").unwrap();
        writer.fatal("boom").unwrap();

        let inner = writer.into_inner();
        assert_eq!(inner.flushes, 0);
        assert!(inner.bytes.ends_with(b"0011\x03error: boom\n"));
    }

    #[test]
    fn test_sideband_writer_splits_large_messages() {
        let mut writer = SidebandWriter::new(Vec::new(), FlushMode::Buffered);
        let message = vec![b'x'; MAX_SIDEBAND_DATA + 10];
        writer.progress(&message).unwrap();

        let bytes = writer.into_inner();
        let (first, rest) = decode(&bytes).unwrap();
        let (second, rest) = decode(rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(first.data().unwrap().len(), MAX_SIDEBAND_DATA + 1);
        assert_eq!(second.data().unwrap(), [&[2u8][..], &[b'x'; 10][..]].concat());
    }
}
