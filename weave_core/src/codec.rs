//! Binary encoding of [`ActionMessage`] frames.
//!
//! The layout is a fixed-size header, a length-prefixed payload, then a
//! length-prefixed string vector. Stream transports wrap each frame in a
//! 4-byte big-endian size prefix via [`ActionCodec`]; datagram transports use
//! [`encode_frame`]/[`decode_frame`] directly, one frame per datagram.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Action, ActionMessage, GlobalId, HandleId, MessageFlags, Time};

/// Bytes in the fixed portion of every frame.
const HEADER_LEN: usize = 54;

/// Frames larger than this are refused outright; a correct peer never sends
/// them and a corrupt length prefix must not trigger a huge allocation.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("frame of {0} bytes exceeds the frame size limit")]
    Oversize(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Serialize a message into `buf` with no outer size prefix.
pub fn encode_frame(msg: &ActionMessage, buf: &mut BytesMut) {
    buf.reserve(encoded_len(msg));
    buf.put_u16(msg.action as u16);
    buf.put_i32(msg.message_id);
    buf.put_i32(msg.source_id.0);
    buf.put_i32(msg.dest_id.0);
    buf.put_i32(msg.source_handle.0);
    buf.put_i32(msg.dest_handle.0);
    buf.put_i32(msg.sequence_id);
    buf.put_i16(msg.counter);
    buf.put_u16(msg.flags.bits());
    buf.put_i64(msg.action_time.ticks());
    buf.put_i64(msg.te.ticks());
    buf.put_i64(msg.tdemin.ticks());
    buf.put_u32(msg.payload.len() as u32);
    buf.put_slice(&msg.payload);
    buf.put_u16(msg.strings.len() as u16);
    for s in &msg.strings {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }
}

/// Exact wire size of `msg` without the stream prefix.
pub fn encoded_len(msg: &ActionMessage) -> usize {
    HEADER_LEN
        + 4
        + msg.payload.len()
        + 2
        + msg.strings.iter().map(|s| 4 + s.len()).sum::<usize>()
}

/// Deserialize one complete frame. All declared lengths are validated
/// against the remaining buffer before any allocation.
pub fn decode_frame(mut buf: Bytes) -> Result<ActionMessage, CodecError> {
    if buf.len() < HEADER_LEN + 4 + 2 {
        return Err(CodecError::Malformed("frame shorter than header"));
    }

    let action = Action::from_tag(buf.get_u16());
    let message_id = buf.get_i32();
    let source_id = GlobalId(buf.get_i32());
    let dest_id = GlobalId(buf.get_i32());
    let source_handle = HandleId(buf.get_i32());
    let dest_handle = HandleId(buf.get_i32());
    let sequence_id = buf.get_i32();
    let counter = buf.get_i16();
    let flags = MessageFlags::from_bits(buf.get_u16());
    let action_time = Time::from_ticks(buf.get_i64());
    let te = Time::from_ticks(buf.get_i64());
    let tdemin = Time::from_ticks(buf.get_i64());

    let payload_len = buf.get_u32() as usize;
    if buf.remaining() < payload_len + 2 {
        return Err(CodecError::Malformed("payload length overruns frame"));
    }
    let payload = buf.split_to(payload_len);

    let string_count = buf.get_u16() as usize;
    let mut strings = Vec::with_capacity(string_count.min(64));
    for _ in 0..string_count {
        if buf.remaining() < 4 {
            return Err(CodecError::Malformed("string table truncated"));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(CodecError::Malformed("string length overruns frame"));
        }
        let raw = buf.split_to(len);
        let s = std::str::from_utf8(&raw)
            .map_err(|_| CodecError::Malformed("string field is not UTF-8"))?;
        strings.push(s.to_owned());
    }

    Ok(ActionMessage {
        action,
        message_id,
        source_id,
        dest_id,
        source_handle,
        dest_handle,
        sequence_id,
        counter,
        flags,
        action_time,
        te,
        tdemin,
        payload,
        strings,
    })
}

/// Length-prefixed [`ActionMessage`] codec for stream transports.
#[derive(Debug, Default)]
pub struct ActionCodec {
    _private: (),
}

impl ActionCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ActionCodec {
    type Item = ActionMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(CodecError::Oversize(frame_len));
        }
        if src.len() < 4 + frame_len {
            // Partial frame: leave the buffer untouched and ask for more.
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let frame = src.split_to(frame_len).freeze();
        decode_frame(frame).map(Some)
    }
}

impl Encoder<ActionMessage> for ActionCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: ActionMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = encoded_len(&msg);
        if len > MAX_FRAME_LEN {
            return Err(CodecError::Oversize(len));
        }
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        encode_frame(&msg, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::protocol;

    fn sample() -> ActionMessage {
        let mut flags = MessageFlags::default();
        flags.set_iteration_requested(true);
        flags.set_indicator(true);
        ActionMessage {
            action: Action::TimeRequest,
            message_id: protocol::CONNECTION_REQUEST,
            source_id: GlobalId(0x0002_0001),
            dest_id: GlobalId::ROOT,
            source_handle: HandleId(3),
            dest_handle: HandleId::INVALID,
            sequence_id: 42,
            counter: 7,
            flags,
            action_time: Time::from_seconds(1.5),
            te: Time::from_seconds(2.0),
            tdemin: Time::EPSILON,
            payload: Bytes::from_static(b"\x00\x01\x02value"),
            strings: vec!["pub/voltage".into(), "".into(), "V".into()],
        }
    }

    #[test]
    fn roundtrip() {
        let msg = sample();
        let mut buf = BytesMut::new();
        encode_frame(&msg, &mut buf);
        assert_eq!(buf.len(), encoded_len(&msg));
        let decoded = decode_frame(buf.freeze()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn roundtrip_over_action_grid() {
        for action in [
            Action::Ignore,
            Action::RegBroker,
            Action::Ack,
            Action::PubData,
            Action::SendMessage,
            Action::TimeRequest,
            Action::TimeGrant,
            Action::Query,
            Action::SetTimeBarrier,
            Action::GlobalError,
        ] {
            for time in [Time::ZERO, Time::NEG_EPSILON, Time::MAX_TIME] {
                let mut msg = ActionMessage::new(action);
                msg.action_time = time;
                msg.te = time;
                msg.payload = Bytes::from(vec![0u8; 17]);
                msg.strings = vec!["a".into(), "bb".into()];
                let mut buf = BytesMut::new();
                encode_frame(&msg, &mut buf);
                assert_eq!(decode_frame(buf.freeze()).unwrap(), msg);
            }
        }
    }

    #[test]
    fn stream_codec_handles_partial_frames() {
        let msg = sample();
        let mut codec = ActionCodec::new();
        let mut full = BytesMut::new();
        codec.encode(msg.clone(), &mut full).unwrap();

        // Feed the frame one byte short: no output, no consumed bytes.
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        let before = partial.len();
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), before);

        // Complete it and decode.
        partial.extend_from_slice(&full[full.len() - 1..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(partial.is_empty());
    }

    #[test]
    fn overrunning_lengths_are_rejected() {
        let msg = sample();
        let mut buf = BytesMut::new();
        encode_frame(&msg, &mut buf);
        // Corrupt the declared payload length to point past the frame end.
        let payload_len_at = HEADER_LEN;
        buf[payload_len_at..payload_len_at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decode_frame(buf.freeze()),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_action_decodes_to_ignore() {
        let msg = sample();
        let mut buf = BytesMut::new();
        encode_frame(&msg, &mut buf);
        buf[0..2].copy_from_slice(&0xfffeu16.to_be_bytes());
        let decoded = decode_frame(buf.freeze()).unwrap();
        assert_eq!(decoded.action, Action::Ignore);
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let a = sample();
        let mut b = ActionMessage::new(Action::Tick);
        b.sequence_id = 9;

        let mut codec = ActionCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(a.clone(), &mut buf).unwrap();
        codec.encode(b.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
