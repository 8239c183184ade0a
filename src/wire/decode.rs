use crate::wire::codec::decode_client_message;
use crate::wire::protocol::{ClientMessage, DecodeError, WireFormat};

/// Handshake state of a session, as seen by the decoder.
///
/// Flips to `Joined` only after the join response bytes have been handed to
/// the transport, and never flips back. While `AwaitingJoin` the client may
/// not yet know the room's negotiated format, so decoding is shape-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingJoin,
    Joined,
}

/// Shape of a frame that parses as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextShape {
    Object,
    Array,
}

/// Cheap shape probe: first non-whitespace byte. Binary frames start with a
/// little-endian u32 enum tag (first byte < 16), so they can never probe as
/// text.
pub fn detect_text_shape(bytes: &[u8]) -> Option<TextShape> {
    for &b in bytes {
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => continue,
            b'{' => return Some(TextShape::Object),
            b'[' => return Some(TextShape::Array),
            _ => return None,
        }
    }
    None
}

/// Decode one inbound frame according to the session's handshake phase.
///
/// Pre-join, clients are expected to speak the portable text format, so
/// object-shaped frames decode as portable text and anything else falls back
/// to the room's negotiated format. Post-join the negotiated format wins;
/// the only fallback is compact text for array-shaped frames, for clients
/// that downgrade mid-session.
pub fn decode_inbound(
    bytes: &[u8],
    phase: SessionPhase,
    negotiated: WireFormat,
) -> Result<ClientMessage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    match phase {
        SessionPhase::AwaitingJoin => {
            if detect_text_shape(bytes) == Some(TextShape::Object) {
                decode_client_message(bytes, WireFormat::Text)
            } else {
                decode_client_message(bytes, negotiated)
            }
        }
        SessionPhase::Joined => match decode_client_message(bytes, negotiated) {
            Ok(msg) => Ok(msg),
            Err(err) => {
                if negotiated != WireFormat::Compact
                    && detect_text_shape(bytes) == Some(TextShape::Array)
                {
                    decode_client_message(bytes, WireFormat::Compact)
                } else {
                    Err(err)
                }
            }
        },
    }
}
