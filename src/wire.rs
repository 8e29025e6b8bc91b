//! Wire codec for probe traffic.
//!
//! Every datagram is a sequence of variable-length integers packed
//! contiguously into a fixed-capacity buffer, followed by a zero
//! terminator byte. Unsigned values use little-endian base-128 encoding
//! (seven payload bits per byte, high bit set on continuation); signed
//! values are zigzag-mapped onto the unsigned encoding first.
//!
//! # Packet layouts
//!
//! ```text
//! handshake request:  [varint 1][uvarint session_id][varint count][0]
//! handshake ack:      [varint 1][uvarint session_id][0]
//! probe:              [uvarint packet_id][filler 'a' ...][0]
//! probe echo:         [uvarint packet_id][varint received_at_ns][0]
//! final report:       [uvarint session_id][varint avg_interval_ns][0]
//! ```
//!
//! Decoding returns the value together with the number of bytes
//! consumed so callers can walk multiple fields in one buffer.

use crate::{Error, Result};

/// Marker value that opens both handshake packets.
pub const HANDSHAKE_MARKER: i64 = 1;

/// Longest possible encoding of a 64-bit value.
pub const MAX_VARINT_LEN: usize = 10;

/// Filler byte used to pad probe packets to the configured size.
pub const PROBE_FILL: u8 = b'a';

/// Largest probe count either side accepts for one session. A
/// handshake asking for more is discarded like any other malformed
/// packet, since the count sizes per-session state.
pub const MAX_EXPECTED_COUNT: u64 = 1 << 16;

/// Encodes `x` as an unsigned varint, returning the bytes written.
///
/// The caller must provide at least [`MAX_VARINT_LEN`] bytes of space.
pub fn put_uvarint(buf: &mut [u8], mut x: u64) -> usize {
    let mut i = 0;
    while x >= 0x80 {
        buf[i] = (x as u8) | 0x80;
        x >>= 7;
        i += 1;
    }
    buf[i] = x as u8;
    i + 1
}

/// Decodes an unsigned varint, returning `(value, bytes_consumed)`.
pub fn uvarint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut x: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN - 1 && b > 1 {
            return Err(Error::MalformedPacket("uvarint overflows 64 bits".into()));
        }
        if b < 0x80 {
            x |= (b as u64) << shift;
            return Ok((x, i + 1));
        }
        x |= ((b & 0x7f) as u64) << shift;
        shift += 7;
        if i + 1 == MAX_VARINT_LEN {
            return Err(Error::MalformedPacket("uvarint overflows 64 bits".into()));
        }
    }
    Err(Error::MalformedPacket("truncated uvarint".into()))
}

/// Encodes `x` as a zigzag signed varint, returning the bytes written.
pub fn put_varint(buf: &mut [u8], x: i64) -> usize {
    let mut ux = (x as u64) << 1;
    if x < 0 {
        ux = !ux;
    }
    put_uvarint(buf, ux)
}

/// Decodes a zigzag signed varint, returning `(value, bytes_consumed)`.
pub fn varint(buf: &[u8]) -> Result<(i64, usize)> {
    let (ux, n) = uvarint(buf)?;
    let mut x = (ux >> 1) as i64;
    if ux & 1 != 0 {
        x = !x;
    }
    Ok((x, n))
}

/// Writes a handshake request `[1][session_id][expected_count][0]`.
pub fn encode_handshake_request(buf: &mut [u8], session_id: u64, expected_count: u64) -> usize {
    let mut n = put_varint(buf, HANDSHAKE_MARKER);
    n += put_uvarint(&mut buf[n..], session_id);
    n += put_varint(&mut buf[n..], expected_count as i64);
    buf[n] = 0;
    n + 1
}

/// Writes a handshake ack `[1][session_id][0]`.
pub fn encode_handshake_ack(buf: &mut [u8], session_id: u64) -> usize {
    let mut n = put_varint(buf, HANDSHAKE_MARKER);
    n += put_uvarint(&mut buf[n..], session_id);
    buf[n] = 0;
    n + 1
}

/// A decoded handshake packet. `expected_count` is present on requests
/// and absent on acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub session_id: u64,
    pub expected_count: Option<u64>,
}

/// Decodes a handshake request or ack.
///
/// Fails with `MalformedPacket` when the marker is not 1 or the count
/// field is out of range.
pub fn decode_handshake(buf: &[u8]) -> Result<Handshake> {
    let (marker, n) = varint(buf)?;
    if marker != HANDSHAKE_MARKER {
        return Err(Error::MalformedPacket(format!(
            "unexpected handshake marker {marker}"
        )));
    }
    let (session_id, m) = uvarint(&buf[n..])?;
    // An ack carries nothing after the id but the terminator.
    match varint(&buf[n + m..]) {
        Ok((count, _)) if count > 0 => Ok(Handshake {
            session_id,
            expected_count: Some(count as u64),
        }),
        _ => Ok(Handshake {
            session_id,
            expected_count: None,
        }),
    }
}

/// Writes a probe packet: packet id, then filler up to `packet_size`
/// bytes, then the terminator. Returns the datagram length
/// (`packet_size + 1`).
pub fn encode_probe(buf: &mut [u8], packet_id: u64, packet_size: usize) -> usize {
    let n = put_uvarint(buf, packet_id);
    for b in &mut buf[n..packet_size] {
        *b = PROBE_FILL;
    }
    buf[packet_size] = 0;
    packet_size + 1
}

/// Decodes the leading packet id of any non-handshake packet.
pub fn decode_packet_id(buf: &[u8]) -> Result<(u64, usize)> {
    uvarint(buf)
}

/// Writes an echo or report packet `[id][ns][0]`. The two formats are
/// identical on the wire; the id distinguishes them at the receiver
/// (packet id vs. session id).
pub fn encode_id_time(buf: &mut [u8], id: u64, ns: i64) -> usize {
    let mut n = put_uvarint(buf, id);
    n += put_varint(&mut buf[n..], ns);
    buf[n] = 0;
    n + 1
}

/// Decodes an `[id][ns]` packet (probe echo or final report).
pub fn decode_id_time(buf: &[u8]) -> Result<(u64, i64)> {
    let (id, n) = uvarint(buf)?;
    let (ns, _) = varint(&buf[n..])?;
    Ok((id, ns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uvarint_roundtrip() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        for x in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let n = put_uvarint(&mut buf, x);
            let (y, m) = uvarint(&buf).expect("decode failed");
            assert_eq!(x, y);
            assert_eq!(n, m);
        }
    }

    #[test]
    fn test_varint_roundtrip() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        for x in [0i64, 1, -1, 63, -64, 64, i64::MAX, i64::MIN] {
            let n = put_varint(&mut buf, x);
            let (y, m) = varint(&buf).expect("decode failed");
            assert_eq!(x, y);
            assert_eq!(n, m);
        }
    }

    #[test]
    fn test_uvarint_small_values_are_single_byte() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        assert_eq!(put_uvarint(&mut buf, 0), 1);
        assert_eq!(put_uvarint(&mut buf, 127), 1);
        assert_eq!(put_uvarint(&mut buf, 128), 2);
    }

    #[test]
    fn test_decode_empty_buffer_fails() {
        assert!(uvarint(&[]).is_err());
        assert!(varint(&[]).is_err());
    }

    #[test]
    fn test_decode_truncated_fails() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let n = put_uvarint(&mut buf, u64::MAX);
        assert!(uvarint(&buf[..n - 1]).is_err());
    }

    #[test]
    fn test_uvarint_overflow_fails() {
        // Eleven continuation bytes can never be a valid 64-bit value.
        let buf = [0x80u8; 11];
        assert!(uvarint(&buf).is_err());
    }

    #[test]
    fn test_handshake_request_roundtrip() {
        let mut buf = [0u8; 64];
        let n = encode_handshake_request(&mut buf, 0xdead_beef_cafe, 10);
        assert_eq!(buf[n - 1], 0);
        let hs = decode_handshake(&buf[..n]).expect("decode failed");
        assert_eq!(hs.session_id, 0xdead_beef_cafe);
        assert_eq!(hs.expected_count, Some(10));
    }

    #[test]
    fn test_handshake_ack_roundtrip() {
        let mut buf = [0u8; 64];
        let n = encode_handshake_ack(&mut buf, 42);
        let hs = decode_handshake(&buf[..n]).expect("decode failed");
        assert_eq!(hs.session_id, 42);
        assert_eq!(hs.expected_count, None);
    }

    #[test]
    fn test_handshake_bad_marker_fails() {
        let mut buf = [0u8; 64];
        let mut n = put_varint(&mut buf, 7);
        n += put_uvarint(&mut buf[n..], 42);
        buf[n] = 0;
        assert!(decode_handshake(&buf[..n + 1]).is_err());
    }

    #[test]
    fn test_probe_layout() {
        let mut buf = vec![0u8; 4001];
        let len = encode_probe(&mut buf, 99, 4000);
        assert_eq!(len, 4001);
        assert_eq!(buf[4000], 0);
        let (id, n) = decode_packet_id(&buf).expect("decode failed");
        assert_eq!(id, 99);
        assert!(buf[n..4000].iter().all(|&b| b == PROBE_FILL));
    }

    #[test]
    fn test_id_time_roundtrip() {
        let mut buf = [0u8; 64];
        let n = encode_id_time(&mut buf, u64::MAX, -1_234_567_890);
        let (id, ns) = decode_id_time(&buf[..n]).expect("decode failed");
        assert_eq!(id, u64::MAX);
        assert_eq!(ns, -1_234_567_890);
    }

    // ============================================================
    // Property-Based Tests
    // ============================================================

    #[cfg(test)]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: every u64 round-trips with a consistent length.
            #[test]
            fn prop_uvarint_roundtrip(x in any::<u64>()) {
                let mut buf = [0u8; MAX_VARINT_LEN];
                let n = put_uvarint(&mut buf, x);
                let (y, m) = uvarint(&buf).unwrap();
                prop_assert_eq!(x, y);
                prop_assert_eq!(n, m);
            }

            /// Property: every i64 round-trips through zigzag coding.
            #[test]
            fn prop_varint_roundtrip(x in any::<i64>()) {
                let mut buf = [0u8; MAX_VARINT_LEN];
                let n = put_varint(&mut buf, x);
                let (y, m) = varint(&buf).unwrap();
                prop_assert_eq!(x, y);
                prop_assert_eq!(n, m);
            }

            /// Property: fields packed sequentially decode in order.
            #[test]
            fn prop_packed_fields_decode_in_order(
                id in any::<u64>(),
                ns in any::<i64>(),
            ) {
                let mut buf = [0u8; 2 * MAX_VARINT_LEN + 1];
                let n = encode_id_time(&mut buf, id, ns);
                let (id2, ns2) = decode_id_time(&buf[..n]).unwrap();
                prop_assert_eq!(id, id2);
                prop_assert_eq!(ns, ns2);
            }

            /// Property: handshake requests survive any id/count.
            #[test]
            fn prop_handshake_roundtrip(
                session_id in any::<u64>(),
                count in 1u64..1_000_000,
            ) {
                let mut buf = [0u8; 64];
                let n = encode_handshake_request(&mut buf, session_id, count);
                let hs = decode_handshake(&buf[..n]).unwrap();
                prop_assert_eq!(hs.session_id, session_id);
                prop_assert_eq!(hs.expected_count, Some(count));
            }
        }
    }
}
