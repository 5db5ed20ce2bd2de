use crate::error::Error;
use crate::frame::MAX_CONTROL_FRAME_PAYLOAD;

/// Well-known WebSocket close status codes (RFC 6455 §7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const NORMAL_CLOSURE: StatusCode = StatusCode(1000);
    pub const GOING_AWAY: StatusCode = StatusCode(1001);
    pub const PROTOCOL_ERROR: StatusCode = StatusCode(1002);
    pub const UNSUPPORTED_DATA: StatusCode = StatusCode(1003);
    /// Sentinel meaning "peer sent an empty close payload"; never sent on the wire.
    pub const NO_STATUS_RCVD: StatusCode = StatusCode(1005);
    pub const INVALID_FRAME_PAYLOAD_DATA: StatusCode = StatusCode(1007);
    pub const INTERNAL_ERROR: StatusCode = StatusCode(1011);
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A close frame's decoded payload: status code plus UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseError {
    pub code: StatusCode,
    pub reason: String,
}

impl CloseError {
    pub fn new(code: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Encodes as big-endian status code followed by UTF-8 reason bytes. Errors if the
    /// resulting payload would exceed the control-frame payload limit.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let reason_bytes = self.reason.as_bytes();
        let mut out = Vec::with_capacity(2 + reason_bytes.len());
        out.extend_from_slice(&self.code.0.to_be_bytes());
        out.extend_from_slice(reason_bytes);
        if out.len() as u64 > MAX_CONTROL_FRAME_PAYLOAD {
            return Err(Error::Protocol(format!(
                "close payload of {} bytes exceeds the {} byte control frame limit",
                out.len(),
                MAX_CONTROL_FRAME_PAYLOAD
            )));
        }
        Ok(out)
    }

    /// Decodes a close frame payload. An empty payload yields the `NoStatusRcvd` sentinel.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        if payload.is_empty() {
            return Ok(CloseError::new(StatusCode::NO_STATUS_RCVD, ""));
        }
        if payload.len() < 2 {
            return Err(Error::Protocol(
                "close payload shorter than the 2-byte status code".into(),
            ));
        }
        let code = StatusCode(u16::from_be_bytes([payload[0], payload[1]]));
        let reason = String::from_utf8(payload[2..].to_vec())
            .map_err(|e| Error::Protocol(format!("close reason is not valid UTF-8: {e}")))?;
        Ok(CloseError::new(code, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_decodes_to_no_status_rcvd() {
        let ce = CloseError::decode(&[]).unwrap();
        assert_eq!(ce.code, StatusCode::NO_STATUS_RCVD);
        assert_eq!(ce.reason, "");
    }

    #[test]
    fn roundtrip() {
        let ce = CloseError::new(StatusCode::NORMAL_CLOSURE, "bye");
        let bytes = ce.encode().unwrap();
        let decoded = CloseError::decode(&bytes).unwrap();
        assert_eq!(decoded, ce);
    }

    #[test]
    fn oversize_reason_rejected() {
        let ce = CloseError::new(StatusCode::NORMAL_CLOSURE, "x".repeat(124));
        assert!(ce.encode().is_err());
    }

    #[test]
    fn short_payload_is_protocol_error() {
        assert!(CloseError::decode(&[0x03]).is_err());
    }
}
