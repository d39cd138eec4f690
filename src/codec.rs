/// Binary frame codec for the worker-facing wire protocol.
///
/// Every frame is a tagged node: one frame-kind byte, a u32 big-endian
/// payload length, then the payload. The payload is a sequence of
/// primitive fields, each one tag byte, a u32 big-endian length, and the
/// value bytes. Strings are UTF-8, u32 fields big-endian. Fields may
/// appear in any order; unknown field tags are skipped so old bridges
/// tolerate new worker SDKs.
use thiserror::Error;

// Frame kind tags (outer node).
pub const FRAME_REGISTER_FUNCTION: u8 = 0x31;
pub const FRAME_UNREGISTER_FUNCTION: u8 = 0x32;
pub const FRAME_FUNCTION_CALL: u8 = 0x33;
pub const FRAME_FUNCTION_RESULT: u8 = 0x34;

// Field tags, per frame kind.
const TAG_REGISTER_APP_ID: u8 = 0x01;
const TAG_REGISTER_NAME: u8 = 0x02;
const TAG_REGISTER_TAG: u8 = 0x03;
const TAG_REGISTER_DEFINITION: u8 = 0x04;

const TAG_UNREGISTER_APP_ID: u8 = 0x01;
const TAG_UNREGISTER_NAME: u8 = 0x02;

const TAG_CALL_APP_ID: u8 = 0x01;
const TAG_CALL_TAG: u8 = 0x02;
const TAG_CALL_REQ_ID: u8 = 0x03;
const TAG_CALL_TOOL_CALL_ID: u8 = 0x04;
const TAG_CALL_ARGUMENTS: u8 = 0x05;
const TAG_CALL_METADATA: u8 = 0x06;

const TAG_RESULT_REQ_ID: u8 = 0x01;
const TAG_RESULT_TOOL_CALL_ID: u8 = 0x02;
const TAG_RESULT_PAYLOAD: u8 = 0x03;
const TAG_RESULT_IS_OK: u8 = 0x04;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Not enough bytes for a complete frame. Callers feeding a growing
    /// buffer should read more and retry.
    #[error("short frame: need {need} bytes, have {have}")]
    ShortFrame { need: usize, have: usize },

    /// The frame is complete but its contents are invalid.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// The outer node tag is not a known frame kind.
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownFrameKind(u8),
}

/// Worker → bridge: announce a tool function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFunctionFrame {
    pub app_id: String,
    pub name: String,
    pub tag: u32,
    /// JSON schema of the function arguments, opaque to the codec.
    pub definition: Vec<u8>,
}

/// Worker → bridge: remove every tool with the given name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnregisterFunctionFrame {
    pub app_id: String,
    pub name: String,
}

/// Bridge → worker: invoke a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCallFrame {
    pub app_id: String,
    pub tag: u32,
    pub req_id: String,
    pub tool_call_id: String,
    pub arguments: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// Worker → bridge: reply for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionResultFrame {
    pub req_id: String,
    pub tool_call_id: String,
    pub result: Vec<u8>,
    pub is_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    RegisterFunction(RegisterFunctionFrame),
    UnregisterFunction(UnregisterFunctionFrame),
    FunctionCall(FunctionCallFrame),
    FunctionResult(FunctionResultFrame),
}

impl Frame {
    pub fn kind(&self) -> u8 {
        match self {
            Frame::RegisterFunction(_) => FRAME_REGISTER_FUNCTION,
            Frame::UnregisterFunction(_) => FRAME_UNREGISTER_FUNCTION,
            Frame::FunctionCall(_) => FRAME_FUNCTION_CALL,
            Frame::FunctionResult(_) => FRAME_FUNCTION_RESULT,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Frame::RegisterFunction(f) => {
                put_str(&mut payload, TAG_REGISTER_APP_ID, &f.app_id);
                put_str(&mut payload, TAG_REGISTER_NAME, &f.name);
                put_u32(&mut payload, TAG_REGISTER_TAG, f.tag);
                put_bytes(&mut payload, TAG_REGISTER_DEFINITION, &f.definition);
            }
            Frame::UnregisterFunction(f) => {
                put_str(&mut payload, TAG_UNREGISTER_APP_ID, &f.app_id);
                put_str(&mut payload, TAG_UNREGISTER_NAME, &f.name);
            }
            Frame::FunctionCall(f) => {
                put_str(&mut payload, TAG_CALL_APP_ID, &f.app_id);
                put_u32(&mut payload, TAG_CALL_TAG, f.tag);
                put_str(&mut payload, TAG_CALL_REQ_ID, &f.req_id);
                put_str(&mut payload, TAG_CALL_TOOL_CALL_ID, &f.tool_call_id);
                put_bytes(&mut payload, TAG_CALL_ARGUMENTS, &f.arguments);
                put_bytes(&mut payload, TAG_CALL_METADATA, &f.metadata);
            }
            Frame::FunctionResult(f) => {
                put_str(&mut payload, TAG_RESULT_REQ_ID, &f.req_id);
                put_str(&mut payload, TAG_RESULT_TOOL_CALL_ID, &f.tool_call_id);
                put_bytes(&mut payload, TAG_RESULT_PAYLOAD, &f.result);
                put_bytes(&mut payload, TAG_RESULT_IS_OK, &[u8::from(f.is_ok)]);
            }
        }

        let mut out = Vec::with_capacity(5 + payload.len());
        out.push(self.kind());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes consumed so read loops
    /// can carve complete frames out of a growing buffer. `ShortFrame`
    /// means "read more and retry", every other error is terminal for
    /// the buffer contents.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize), CodecError> {
        if buf.len() < 5 {
            return Err(CodecError::ShortFrame {
                need: 5,
                have: buf.len(),
            });
        }
        let kind = buf[0];
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        let total = 5 + len;
        if buf.len() < total {
            return Err(CodecError::ShortFrame {
                need: total,
                have: buf.len(),
            });
        }
        let fields = parse_fields(&buf[5..total])?;

        let frame = match kind {
            FRAME_REGISTER_FUNCTION => Frame::RegisterFunction(RegisterFunctionFrame {
                app_id: require_str(&fields, TAG_REGISTER_APP_ID, "register.app_id")?,
                name: require_str(&fields, TAG_REGISTER_NAME, "register.name")?,
                tag: require_u32(&fields, TAG_REGISTER_TAG, "register.tag")?,
                definition: require_bytes(&fields, TAG_REGISTER_DEFINITION, "register.definition")?,
            }),
            FRAME_UNREGISTER_FUNCTION => Frame::UnregisterFunction(UnregisterFunctionFrame {
                app_id: require_str(&fields, TAG_UNREGISTER_APP_ID, "unregister.app_id")?,
                name: require_str(&fields, TAG_UNREGISTER_NAME, "unregister.name")?,
            }),
            FRAME_FUNCTION_CALL => Frame::FunctionCall(FunctionCallFrame {
                app_id: require_str(&fields, TAG_CALL_APP_ID, "call.app_id")?,
                tag: require_u32(&fields, TAG_CALL_TAG, "call.tag")?,
                req_id: require_str(&fields, TAG_CALL_REQ_ID, "call.req_id")?,
                tool_call_id: require_str(&fields, TAG_CALL_TOOL_CALL_ID, "call.tool_call_id")?,
                arguments: require_bytes(&fields, TAG_CALL_ARGUMENTS, "call.arguments")?,
                metadata: require_bytes(&fields, TAG_CALL_METADATA, "call.metadata")?,
            }),
            FRAME_FUNCTION_RESULT => Frame::FunctionResult(FunctionResultFrame {
                req_id: require_str(&fields, TAG_RESULT_REQ_ID, "result.req_id")?,
                tool_call_id: require_str(&fields, TAG_RESULT_TOOL_CALL_ID, "result.tool_call_id")?,
                result: require_bytes(&fields, TAG_RESULT_PAYLOAD, "result.payload")?,
                is_ok: require_bool(&fields, TAG_RESULT_IS_OK, "result.is_ok")?,
            }),
            other => return Err(CodecError::UnknownFrameKind(other)),
        };

        Ok((frame, total))
    }
}

fn put_bytes(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

fn put_str(out: &mut Vec<u8>, tag: u8, value: &str) {
    put_bytes(out, tag, value.as_bytes());
}

fn put_u32(out: &mut Vec<u8>, tag: u8, value: u32) {
    put_bytes(out, tag, &value.to_be_bytes());
}

/// Splits a complete payload into (tag, value) pairs.
///
/// The outer length already promised a complete payload, so running out
/// of bytes mid-field is `Malformed`, not `ShortFrame`.
fn parse_fields(mut payload: &[u8]) -> Result<Vec<(u8, &[u8])>, CodecError> {
    let mut fields = Vec::new();
    while !payload.is_empty() {
        if payload.len() < 5 {
            return Err(CodecError::Malformed("truncated field header"));
        }
        let tag = payload[0];
        let len = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]) as usize;
        if payload.len() < 5 + len {
            return Err(CodecError::Malformed("field value exceeds payload"));
        }
        fields.push((tag, &payload[5..5 + len]));
        payload = &payload[5 + len..];
    }
    Ok(fields)
}

/// Last occurrence wins, matching replace-on-re-registration semantics.
fn field<'a>(fields: &[(u8, &'a [u8])], tag: u8) -> Option<&'a [u8]> {
    fields
        .iter()
        .rev()
        .find(|(t, _)| *t == tag)
        .map(|(_, v)| *v)
}

fn require_str(
    fields: &[(u8, &[u8])],
    tag: u8,
    what: &'static str,
) -> Result<String, CodecError> {
    let raw = field(fields, tag).ok_or(CodecError::Malformed(what))?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::Malformed(what))
}

fn require_u32(fields: &[(u8, &[u8])], tag: u8, what: &'static str) -> Result<u32, CodecError> {
    let raw = field(fields, tag).ok_or(CodecError::Malformed(what))?;
    let bytes: [u8; 4] = raw.try_into().map_err(|_| CodecError::Malformed(what))?;
    Ok(u32::from_be_bytes(bytes))
}

fn require_bytes(
    fields: &[(u8, &[u8])],
    tag: u8,
    what: &'static str,
) -> Result<Vec<u8>, CodecError> {
    field(fields, tag)
        .map(|v| v.to_vec())
        .ok_or(CodecError::Malformed(what))
}

fn require_bool(fields: &[(u8, &[u8])], tag: u8, what: &'static str) -> Result<bool, CodecError> {
    let raw = field(fields, tag).ok_or(CodecError::Malformed(what))?;
    match raw {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(CodecError::Malformed(what)),
    }
}
