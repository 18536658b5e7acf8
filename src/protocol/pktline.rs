//! Git packet-line framing.
//!
//! Every line on the wire opens with four ASCII hex digits holding the
//! line's total length, the digits themselves included.  Lengths below the
//! four-byte minimum are reserved as control packets: `0000` flushes a
//! message, `0001` delimits sections inside one message, `0002` closes a
//! response.  `0003` can never occur.
//!
//! Malformed framing is a hard error here; a request we cannot frame must
//! never reach the cache, so the decoder rejects instead of salvaging.

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One decoded packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Payload of a data packet, length prefix already stripped.
    Data(Vec<u8>),
    /// `0000`, the end of a message or section.
    Flush,
    /// `0001`, the split between a command's capabilities and arguments.
    Delimiter,
    /// `0002`, the end of a server response.
    ResponseEnd,
}

/// Malformed packet-line framing or command encoding.  Surfaces as 400.
#[derive(Debug, thiserror::Error)]
#[error("protocol error: {0}")]
pub struct ProtocolError(pub String);

impl ProtocolError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Frame `payload` as a single data packet.
///
/// The length prefix counts its own four digits, which caps a payload at
/// `0xffff - 4` bytes.  Trailing newlines are the caller's business.
pub fn encode_pkt_line(payload: &[u8]) -> Vec<u8> {
    let framed_len = payload.len() + 4;
    assert!(
        framed_len <= 0xffff,
        "payload of {} bytes does not fit one packet-line",
        payload.len(),
    );
    let mut line = format!("{framed_len:04x}").into_bytes();
    line.extend_from_slice(payload);
    line
}

/// Encode an `ERR <msg>` data packet for delivery to a Git client.
pub fn encode_err_pkt(msg: &str) -> Vec<u8> {
    let mut line = Vec::with_capacity(msg.len() + 5);
    line.extend_from_slice(b"ERR ");
    line.extend_from_slice(msg.as_bytes());
    line.push(b'\n');
    encode_pkt_line(&line)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a complete buffer of packet lines.
///
/// The whole input must be consumed; trailing garbage, a truncated payload,
/// a non-hex length prefix, or the invalid length `0003` are all rejected.
pub fn decode_pkt_lines(data: &[u8]) -> Result<Vec<PktLine>, ProtocolError> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        if pos + 4 > data.len() {
            return Err(ProtocolError::new(format!(
                "truncated packet-line header at offset {pos}"
            )));
        }

        let len_hex = std::str::from_utf8(&data[pos..pos + 4])
            .map_err(|_| ProtocolError::new(format!("non-UTF-8 length prefix at offset {pos}")))?;
        let pkt_len = usize::from_str_radix(len_hex, 16).map_err(|_| {
            ProtocolError::new(format!("invalid length prefix {len_hex:?} at offset {pos}"))
        })?;

        match pkt_len {
            0 => {
                packets.push(PktLine::Flush);
                pos += 4;
            }
            1 => {
                packets.push(PktLine::Delimiter);
                pos += 4;
            }
            2 => {
                packets.push(PktLine::ResponseEnd);
                pos += 4;
            }
            3 => {
                // Would mean 3 total bytes, but the prefix alone is 4.
                return Err(ProtocolError::new(format!(
                    "invalid packet-line length 0003 at offset {pos}"
                )));
            }
            n => {
                if pos + n > data.len() {
                    return Err(ProtocolError::new(format!(
                        "packet-line at offset {pos} declares {n} bytes but only {} remain",
                        data.len() - pos
                    )));
                }
                packets.push(PktLine::Data(data[pos + 4..pos + n].to_vec()));
                pos += n;
            }
        }
    }

    Ok(packets)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
