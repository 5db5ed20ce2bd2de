use crate::error::Error;
use crate::frame::OpCode;

/// The data-message kind a caller reads or writes. Maps 1:1 onto the text/binary data opcodes;
/// continuation frames never surface here, they're internal to the streaming handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
}

impl MessageType {
    pub(crate) fn opcode(self) -> OpCode {
        match self {
            MessageType::Text => OpCode::Text,
            MessageType::Binary => OpCode::Binary,
        }
    }

    pub(crate) fn from_opcode(opcode: OpCode) -> Result<Self, Error> {
        match opcode {
            OpCode::Text => Ok(MessageType::Text),
            OpCode::Binary => Ok(MessageType::Binary),
            other => Err(Error::Protocol(format!(
                "opcode {other:?} is not a data message type"
            ))),
        }
    }
}
