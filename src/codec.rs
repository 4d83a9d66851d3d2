//! Framed codec: a big-endian 32-bit length prefix followed by that
//! many bytes of a `bincode`-packed record.

use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Upper bound on a single record's packed length, in bytes. Exceeding this
/// is fatal for the connection.
pub const MESSAGE_SIZE_MAX: u32 = 512 * 1024;

/// Length of the big-endian length prefix.
pub const PREFIX_LEN: usize = 4;

/// Encode `msg` as a length-prefixed frame, ready to append to a
/// connection's write queue. Fails if the packed length exceeds
/// [`MESSAGE_SIZE_MAX`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let packed = bincode::serialize(msg)
        .map_err(|e| Error::protocol(format!("failed to encode message: {e}")))?;
    if packed.len() as u64 > MESSAGE_SIZE_MAX as u64 {
        return Err(Error::protocol("message too large to encode"));
    }
    let mut frame = Vec::with_capacity(PREFIX_LEN + packed.len());
    frame.extend_from_slice(&(packed.len() as u32).to_be_bytes());
    frame.extend_from_slice(&packed);
    Ok(frame)
}

/// Outcome of a single decode attempt against a read buffer.
#[derive(Debug)]
pub enum Decoded<T> {
    /// A full message was decoded; `consumed` bytes should be dropped from
    /// the front of the buffer.
    Message { value: T, consumed: usize },
    /// Not enough bytes buffered yet for a complete frame. The event loop
    /// should resume reading.
    NeedMore,
}

/// Attempt to decode one frame from the front of `buf`. Does not mutate
/// `buf`; the caller advances its offset using `consumed` on success.
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<Decoded<T>> {
    if buf.len() < PREFIX_LEN {
        return Ok(Decoded::NeedMore);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MESSAGE_SIZE_MAX {
        return Err(Error::protocol("client message too large"));
    }
    let total = PREFIX_LEN + len as usize;
    if buf.len() < total {
        return Ok(Decoded::NeedMore);
    }
    let body = &buf[PREFIX_LEN..total];
    let value: T = bincode::deserialize(body)
        .map_err(|e| Error::protocol(format!("malformed message payload: {e}")))?;
    Ok(Decoded::Message {
        value,
        consumed: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ClientMessage, StreamId, TimeSpec};

    #[test]
    fn round_trip() {
        let msg = ClientMessage::IoBuffer {
            stream: StreamId::TtyOut,
            delay: TimeSpec::new(0, 100_000_000),
            data: b"hello\n".to_vec(),
        };
        let frame = encode(&msg).unwrap();
        match decode::<ClientMessage>(&frame).unwrap() {
            Decoded::Message { value, consumed } => {
                assert_eq!(consumed, frame.len());
                match value {
                    ClientMessage::IoBuffer { data, .. } => assert_eq!(data, b"hello\n"),
                    _ => panic!("wrong variant"),
                }
            }
            Decoded::NeedMore => panic!("expected a full message"),
        }
    }

    #[test]
    fn need_more_on_partial_prefix() {
        let buf = [0u8, 0];
        match decode::<ClientMessage>(&buf).unwrap() {
            Decoded::NeedMore => {}
            _ => panic!("expected NeedMore"),
        }
    }

    #[test]
    fn need_more_on_partial_body() {
        let msg = ClientMessage::ClientHello {
            client_id: "abc".into(),
        };
        let mut frame = encode(&msg).unwrap();
        frame.truncate(frame.len() - 1);
        match decode::<ClientMessage>(&frame).unwrap() {
            Decoded::NeedMore => {}
            _ => panic!("expected NeedMore"),
        }
    }

    #[test]
    fn oversize_length_prefix_is_protocol_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MESSAGE_SIZE_MAX + 1).to_be_bytes());
        buf.extend(std::iter::repeat(0u8).take(16));
        let err = decode::<ClientMessage>(&buf).unwrap_err();
        assert_eq!(err.category(), "protocol");
    }

    proptest::proptest! {
        #[test]
        fn prop_round_trip_client_hello(id in "[a-zA-Z0-9]{0,64}") {
            let msg = ClientMessage::ClientHello { client_id: id.clone() };
            let frame = encode(&msg).unwrap();
            match decode::<ClientMessage>(&frame).unwrap() {
                Decoded::Message { value: ClientMessage::ClientHello { client_id }, consumed } => {
                    proptest::prop_assert_eq!(client_id, id);
                    proptest::prop_assert_eq!(consumed, frame.len());
                }
                _ => proptest::prop_assert!(false, "expected ClientHello"),
            }
        }
    }
}
