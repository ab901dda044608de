//! Wire types for the messages this client sends and receives.

use std::fmt;

/// RFB pixel format descriptor (16 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// 32bpp little-endian true colour with red in bits 16..24. In memory a
    /// pixel is laid out B, G, R, X, which is ffmpeg's `bgr0`.
    pub const BGR0: PixelFormat = PixelFormat {
        bits_per_pixel: 32,
        depth: 24,
        big_endian: false,
        true_colour: true,
        red_max: 255,
        green_max: 255,
        blue_max: 255,
        red_shift: 16,
        green_shift: 8,
        blue_shift: 0,
    };

    pub fn from_bytes(b: &[u8; 16]) -> Self {
        Self {
            bits_per_pixel: b[0],
            depth: b[1],
            big_endian: b[2] != 0,
            true_colour: b[3] != 0,
            red_max: u16::from_be_bytes([b[4], b[5]]),
            green_max: u16::from_be_bytes([b[6], b[7]]),
            blue_max: u16::from_be_bytes([b[8], b[9]]),
            red_shift: b[10],
            green_shift: b[11],
            blue_shift: b[12],
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0] = self.bits_per_pixel;
        b[1] = self.depth;
        b[2] = self.big_endian as u8;
        b[3] = self.true_colour as u8;
        b[4..6].copy_from_slice(&self.red_max.to_be_bytes());
        b[6..8].copy_from_slice(&self.green_max.to_be_bytes());
        b[8..10].copy_from_slice(&self.blue_max.to_be_bytes());
        b[10] = self.red_shift;
        b[11] = self.green_shift;
        b[12] = self.blue_shift;
        b
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}bpp depth {} {}",
            self.bits_per_pixel,
            self.depth,
            if self.big_endian { "BE" } else { "LE" }
        )?;
        if self.true_colour {
            write!(
                f,
                " rgb max {}/{}/{} shift {}/{}/{}",
                self.red_max,
                self.green_max,
                self.blue_max,
                self.red_shift,
                self.green_shift,
                self.blue_shift
            )
        } else {
            write!(f, " colour map")
        }
    }
}

/// Rectangle encodings the decoder understands, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    CopyRect,
    Rre,
    Hextile,
    Zlib,
    Zrle,
}

impl Encoding {
    pub const PREFERRED: [Encoding; 6] = [
        Encoding::CopyRect,
        Encoding::Zrle,
        Encoding::Zlib,
        Encoding::Hextile,
        Encoding::Rre,
        Encoding::Raw,
    ];

    pub fn code(self) -> i32 {
        match self {
            Encoding::Raw => 0,
            Encoding::CopyRect => 1,
            Encoding::Rre => 2,
            Encoding::Hextile => 5,
            Encoding::Zlib => 6,
            Encoding::Zrle => 16,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Encoding::Raw),
            1 => Some(Encoding::CopyRect),
            2 => Some(Encoding::Rre),
            5 => Some(Encoding::Hextile),
            6 => Some(Encoding::Zlib),
            16 => Some(Encoding::Zrle),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Raw => "Raw",
            Encoding::CopyRect => "CopyRect",
            Encoding::Rre => "RRE",
            Encoding::Hextile => "Hextile",
            Encoding::Zlib => "Zlib",
            Encoding::Zrle => "ZRLE",
        }
    }
}

/// Request for the server to send the contents of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferUpdateRequest {
    pub incremental: bool,
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl FramebufferUpdateRequest {
    /// Request covering the whole `width` x `height` screen.
    pub fn full_screen(width: u16, height: u16, incremental: bool) -> Self {
        Self {
            incremental,
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Messages sent from this client to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<Encoding>),
    FramebufferUpdateRequest(FramebufferUpdateRequest),
}

impl ClientMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientMessage::SetPixelFormat(format) => {
                let mut buf = vec![0u8, 0, 0, 0];
                buf.extend_from_slice(&format.to_bytes());
                buf
            }
            ClientMessage::SetEncodings(encodings) => {
                let mut buf = vec![2u8, 0];
                buf.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
                for encoding in encodings {
                    buf.extend_from_slice(&encoding.code().to_be_bytes());
                }
                buf
            }
            ClientMessage::FramebufferUpdateRequest(req) => {
                let mut buf = vec![3u8, req.incremental as u8];
                buf.extend_from_slice(&req.x.to_be_bytes());
                buf.extend_from_slice(&req.y.to_be_bytes());
                buf.extend_from_slice(&req.width.to_be_bytes());
                buf.extend_from_slice(&req.height.to_be_bytes());
                buf
            }
        }
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMessage::SetPixelFormat(_) => write!(f, "SetPixelFormat"),
            ClientMessage::SetEncodings(encodings) => {
                write!(f, "SetEncodings({} encodings)", encodings.len())
            }
            ClientMessage::FramebufferUpdateRequest(req) => write!(
                f,
                "FramebufferUpdateRequest(inc={}, {}x{}+{}+{})",
                req.incremental as u8, req.width, req.height, req.x, req.y
            ),
        }
    }
}

/// Messages received from the server, after their payload has been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// A complete framebuffer update; the canvas already reflects it.
    FramebufferUpdate { rectangles: u16 },
    SetColourMapEntries { first_colour: u16, colours: u16 },
    Bell,
    ServerCutText(String),
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::FramebufferUpdate { rectangles } => {
                write!(f, "FramebufferUpdate({} rectangles)", rectangles)
            }
            ServerMessage::SetColourMapEntries { colours, .. } => {
                write!(f, "SetColourMapEntries({} colours)", colours)
            }
            ServerMessage::Bell => write!(f, "Bell"),
            ServerMessage::ServerCutText(text) => write!(f, "ServerCutText({} bytes)", text.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_request_wire_layout() {
        let msg = ClientMessage::FramebufferUpdateRequest(FramebufferUpdateRequest::full_screen(
            1024, 768, true,
        ));

        assert_eq!(
            msg.encode(),
            vec![3, 1, 0, 0, 0, 0, 0x04, 0x00, 0x03, 0x00]
        );
    }

    #[test]
    fn test_set_encodings_wire_layout() {
        let msg = ClientMessage::SetEncodings(vec![Encoding::Zrle, Encoding::Raw]);

        assert_eq!(msg.encode(), vec![2, 0, 0, 2, 0, 0, 0, 16, 0, 0, 0, 0]);
    }

    #[test]
    fn test_set_pixel_format_has_padding() {
        let bytes = ClientMessage::SetPixelFormat(PixelFormat::BGR0).encode();

        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(bytes[4], 32);
        assert_eq!(bytes[14], 16);
    }

    #[test]
    fn test_pixel_format_bytes_are_symmetric() {
        let raw = PixelFormat::BGR0.to_bytes();
        assert_eq!(PixelFormat::from_bytes(&raw), PixelFormat::BGR0);
    }

    #[test]
    fn test_pixel_format_display() {
        assert_eq!(
            PixelFormat::BGR0.to_string(),
            "32bpp depth 24 LE rgb max 255/255/255 shift 16/8/0"
        );

        let mapped = PixelFormat {
            bits_per_pixel: 8,
            depth: 8,
            true_colour: false,
            ..PixelFormat::BGR0
        };
        assert_eq!(mapped.to_string(), "8bpp depth 8 LE colour map");
    }

    #[test]
    fn test_unknown_encoding_code() {
        assert_eq!(Encoding::from_code(7), None);
        assert_eq!(Encoding::from_code(16), Some(Encoding::Zrle));
    }

    #[test]
    fn test_preferred_encodings_keep_raw_last() {
        let codes: Vec<i32> = Encoding::PREFERRED.iter().map(|e| e.code()).collect();

        assert_eq!(codes, vec![1, 16, 6, 5, 2, 0]);
        for encoding in Encoding::PREFERRED {
            assert_eq!(Encoding::from_code(encoding.code()), Some(encoding));
        }
    }
}
