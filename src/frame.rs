use crate::error::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Control frame payloads must not exceed this many bytes (RFC 6455 §5.5).
pub const MAX_CONTROL_FRAME_PAYLOAD: u64 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::Protocol(format!("unknown opcode {other:#x}"))),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    /// Opcode >= 0x8 is a control opcode.
    pub fn is_control(self) -> bool {
        self.as_u8() >= 0x8
    }
}

/// The role a connection plays determines masking direction: clients mask outgoing frames
/// and expect unmasked frames from the peer; servers never mask and reject unmasked frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn masks_outgoing(self) -> bool {
        matches!(self, Role::Client)
    }

    pub fn expects_masked_incoming(self) -> bool {
        matches!(self, Role::Server)
    }
}

/// Parsed frame header. Does not include the payload bytes.
#[derive(Debug, Clone)]
pub struct Header {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub payload_length: u64,
    pub mask_key: Option<[u8; 4]>,
}

/// Marshals a frame header (not including payload bytes) into wire bytes.
pub fn marshal_header(h: &Header) -> Vec<u8> {
    let mut out = Vec::with_capacity(14);

    let mut b0 = h.opcode.as_u8();
    if h.fin {
        b0 |= 0b1000_0000;
    }
    if h.rsv1 {
        b0 |= 0b0100_0000;
    }
    if h.rsv2 {
        b0 |= 0b0010_0000;
    }
    if h.rsv3 {
        b0 |= 0b0001_0000;
    }
    out.push(b0);

    let mask_bit = if h.masked { 0b1000_0000 } else { 0 };
    if h.payload_length <= 125 {
        out.push(mask_bit | h.payload_length as u8);
    } else if h.payload_length <= u16::MAX as u64 {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(h.payload_length as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&h.payload_length.to_be_bytes());
    }

    if let Some(key) = h.mask_key {
        out.extend_from_slice(&key);
    }

    out
}

/// Reads and parses a frame header from an async byte stream.
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Header, Error> {
    let mut prefix = [0u8; 2];
    reader.read_exact(&mut prefix).await?;

    let fin = prefix[0] & 0b1000_0000 != 0;
    let rsv1 = prefix[0] & 0b0100_0000 != 0;
    let rsv2 = prefix[0] & 0b0010_0000 != 0;
    let rsv3 = prefix[0] & 0b0001_0000 != 0;
    let opcode = OpCode::from_byte(prefix[0] & 0b0000_1111)?;

    if rsv1 || rsv2 || rsv3 {
        return Err(Error::Protocol(format!(
            "read header with rsv bits set: {rsv1}:{rsv2}:{rsv3}"
        )));
    }

    let masked = prefix[1] & 0b1000_0000 != 0;
    let len7 = prefix[1] & 0b0111_1111;

    let payload_length = match len7 {
        126 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf).await?;
            u16::from_be_bytes(buf) as u64
        }
        127 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf).await?;
            let len = u64::from_be_bytes(buf);
            if len & (1 << 63) != 0 {
                return Err(Error::Protocol(
                    "extended payload length has high bit set".into(),
                ));
            }
            len
        }
        n => n as u64,
    };

    let mask_key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    Ok(Header {
        fin,
        rsv1,
        rsv2,
        rsv3,
        opcode,
        masked,
        payload_length,
        mask_key,
    })
}

/// XORs `buf` in place against `key`, starting at rolling offset `pos`, and returns the new
/// rolling offset `(pos + buf.len()) % 4`. Calling this twice with the same key and the
/// positions chained together is an involution: it recovers the original bytes.
pub fn mask(key: &[u8; 4], pos: usize, buf: &mut [u8]) -> usize {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[(pos + i) % 4];
    }
    (pos + buf.len()) % 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrip() {
        for b in [0x0u8, 0x1, 0x2, 0x8, 0x9, 0xA] {
            let op = OpCode::from_byte(b).unwrap();
            assert_eq!(op.as_u8(), b);
        }
        assert!(OpCode::from_byte(0x3).is_err());
    }

    #[test]
    fn is_control_predicate() {
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(!OpCode::Continuation.is_control());
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
    }

    #[test]
    fn mask_is_an_involution() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let original = b"Hello, world! This is a longer payload.".to_vec();
        let mut buf = original.clone();
        let pos1 = mask(&key, 0, &mut buf);
        assert_ne!(buf, original);
        let pos2 = mask(&key, pos1, &mut buf);
        assert_eq!(buf, original);
        assert_eq!(pos2, original.len() % 4);
    }

    #[tokio::test]
    async fn header_roundtrip_small_payload() {
        let h = Header {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: OpCode::Text,
            masked: false,
            payload_length: 5,
            mask_key: None,
        };
        let bytes = marshal_header(&h);
        let mut cursor = std::io::Cursor::new(bytes);
        let parsed = read_header(&mut cursor).await.unwrap();
        assert_eq!(parsed.fin, h.fin);
        assert_eq!(parsed.opcode, h.opcode);
        assert_eq!(parsed.masked, h.masked);
        assert_eq!(parsed.payload_length, h.payload_length);
    }

    #[tokio::test]
    async fn header_roundtrip_extended_16_and_64() {
        for len in [200u64, 70000u64] {
            let h = Header {
                fin: false,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode: OpCode::Binary,
                masked: true,
                payload_length: len,
                mask_key: Some([1, 2, 3, 4]),
            };
            let bytes = marshal_header(&h);
            let mut cursor = std::io::Cursor::new(bytes);
            let parsed = read_header(&mut cursor).await.unwrap();
            assert_eq!(parsed.payload_length, len);
            assert_eq!(parsed.mask_key, Some([1, 2, 3, 4]));
        }
    }

    #[tokio::test]
    async fn rsv_bits_rejected() {
        let mut bytes = marshal_header(&Header {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: OpCode::Text,
            masked: false,
            payload_length: 0,
            mask_key: None,
        });
        bytes[0] |= 0b0100_0000; // set rsv1
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(read_header(&mut cursor).await.is_err());
    }
}
