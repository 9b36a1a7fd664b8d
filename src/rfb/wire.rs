use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const PROTOCOL_VERSION_3_8: &[u8; 12] = b"RFB 003.008\n";
pub const PROTOCOL_VERSION_3_7: &[u8; 12] = b"RFB 003.007\n";

pub const SECURITY_TYPE_NONE: u8 = 1;
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;
pub const CLIENT_INIT_SHARED: u8 = 1;

pub const MSG_SET_PIXEL_FORMAT: u8 = 0;
pub const MSG_SET_ENCODINGS: u8 = 2;
pub const MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
pub const MSG_KEY_EVENT: u8 = 4;
pub const MSG_POINTER_EVENT: u8 = 5;
pub const MSG_CLIENT_CUT_TEXT: u8 = 6;

const SERVER_INIT_HEADER_LEN: usize = 24;
const MAX_DESKTOP_NAME_LEN: usize = 4096;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0:?}")]
    BadVersion(String),
    #[error("no usable security type offered")]
    NoUsableSecurityType,
    #[error("server requires authentication but no password is configured")]
    PasswordRequired,
    #[error("authentication rejected by server (result code {0})")]
    AuthFailed(u32),
    #[error("malformed {0} message")]
    Malformed(&'static str),
}

pub fn is_supported_version(bytes: &[u8]) -> bool {
    bytes == PROTOCOL_VERSION_3_8 || bytes == PROTOCOL_VERSION_3_7
}

/// Pixel format block from a server-init message, captured verbatim from the
/// backend so every viewer sees exactly what the real server announced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_color: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Reads the 13 meaningful bytes of a pixel-format block. The caller must
    /// guarantee at least 13 readable bytes.
    pub fn read_from(buf: &mut impl Buf) -> Self {
        Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian: buf.get_u8() != 0,
            true_color: buf.get_u8() != 0,
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian as u8);
        buf.put_u8(self.true_color as u8);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
    }
}

/// Parsed server-init message. The raw bytes are retained so the message can
/// be replayed to viewers byte-for-byte.
#[derive(Clone, Debug)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: Bytes,
    raw: Bytes,
}

impl ServerInit {
    /// Attempts to decode a server-init from the front of `buf`. Returns
    /// `Ok(None)` when more bytes are needed, and the consumed length on
    /// success.
    pub fn decode(buf: &[u8]) -> Result<Option<(ServerInit, usize)>, ProtocolError> {
        if buf.len() < SERVER_INIT_HEADER_LEN {
            return Ok(None);
        }
        let name_len = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]) as usize;
        if name_len > MAX_DESKTOP_NAME_LEN {
            return Err(ProtocolError::Malformed("server-init"));
        }
        let total = SERVER_INIT_HEADER_LEN + name_len;
        if buf.len() < total {
            return Ok(None);
        }

        let raw = Bytes::copy_from_slice(&buf[..total]);
        let mut cursor = &buf[..];
        let width = cursor.get_u16();
        let height = cursor.get_u16();
        let pixel_format = PixelFormat::read_from(&mut cursor);
        // 3 padding bytes after the 13-byte format block, then the name length
        // already read above.
        let name = raw.slice(SERVER_INIT_HEADER_LEN..total);

        Ok(Some((
            ServerInit {
                width,
                height,
                pixel_format,
                name,
                raw,
            },
            total,
        )))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SERVER_INIT_HEADER_LEN + self.name.len());
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        self.pixel_format.write_to(&mut buf);
        buf.put_bytes(0, 3);
        buf.put_u32(self.name.len() as u32);
        buf.extend_from_slice(&self.name);
        buf.freeze()
    }

    pub fn desktop_name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

/// Result of framing the next client-to-server message in a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    /// Not enough buffered bytes to frame the next message.
    Incomplete,
    Message { kind: u8, len: usize },
    /// Unknown message type; no length is derivable.
    Opaque,
}

pub fn frame_client_message(buf: &[u8]) -> ClientFrame {
    let Some(&kind) = buf.first() else {
        return ClientFrame::Incomplete;
    };
    let len = match kind {
        MSG_SET_PIXEL_FORMAT => 20,
        MSG_SET_ENCODINGS => {
            if buf.len() < 4 {
                return ClientFrame::Incomplete;
            }
            4 + 4 * u16::from_be_bytes([buf[2], buf[3]]) as usize
        }
        MSG_FRAMEBUFFER_UPDATE_REQUEST => 10,
        MSG_KEY_EVENT => 8,
        MSG_POINTER_EVENT => 6,
        MSG_CLIENT_CUT_TEXT => {
            if buf.len() < 8 {
                return ClientFrame::Incomplete;
            }
            8 + u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize
        }
        _ => return ClientFrame::Opaque,
    };
    if buf.len() < len {
        ClientFrame::Incomplete
    } else {
        ClientFrame::Message { kind, len }
    }
}
