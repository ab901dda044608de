//! Rectangle decoders writing into the session's back buffer.
//!
//! Every decoder assumes the negotiated [`PixelFormat::BGR0`] layout, so a
//! wire pixel is four bytes and a ZRLE compressed pixel is its low three.
//! Zlib and ZRLE each keep their own zlib stream for the whole connection.
//!
//! [`PixelFormat::BGR0`]: super::messages::PixelFormat::BGR0

use flate2::{Decompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::errors::SessionError;
use super::messages::Encoding;
use crate::canvas::{frame_len, BYTES_PER_PIXEL};

type Pixel = [u8; BYTES_PER_PIXEL];

const HEXTILE_RAW: u8 = 1;
const HEXTILE_BACKGROUND: u8 = 2;
const HEXTILE_FOREGROUND: u8 = 4;
const HEXTILE_ANY_SUBRECTS: u8 = 8;
const HEXTILE_SUBRECTS_COLOURED: u8 = 16;

const ZRLE_TILE: u16 = 64;
const HEXTILE_TILE: u16 = 16;

/// Upper bound on a single compressed Zlib or ZRLE payload.
const MAX_COMPRESSED_PAYLOAD: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Private, mutable image the session decodes into before publishing.
pub struct Framebuffer {
    width: u16,
    height: u16,
    pixels: Vec<u8>,
}

impl Framebuffer {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; frame_len(width, height)],
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    fn check(&self, r: Rect) -> Result<(), SessionError> {
        let fits = r.x as u32 + r.width as u32 <= self.width as u32
            && r.y as u32 + r.height as u32 <= self.height as u32;
        if fits {
            Ok(())
        } else {
            Err(SessionError::RectangleOutOfBounds {
                x: r.x,
                y: r.y,
                width: r.width,
                height: r.height,
                fb_width: self.width,
                fb_height: self.height,
            })
        }
    }

    fn row_offset(&self, x: u16, y: u16) -> usize {
        (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL
    }

    /// Copies `data` (tightly packed rows of `r.width` pixels) into `r`.
    fn blit(&mut self, r: Rect, data: &[u8]) {
        if r.is_empty() {
            return;
        }
        let row_len = r.width as usize * BYTES_PER_PIXEL;
        for (row, src) in data.chunks_exact(row_len).take(r.height as usize).enumerate() {
            let start = self.row_offset(r.x, r.y + row as u16);
            self.pixels[start..start + row_len].copy_from_slice(src);
        }
    }

    fn fill(&mut self, r: Rect, pixel: Pixel) {
        for row in 0..r.height {
            let start = self.row_offset(r.x, r.y + row);
            let end = start + r.width as usize * BYTES_PER_PIXEL;
            for dst in self.pixels[start..end].chunks_exact_mut(BYTES_PER_PIXEL) {
                dst.copy_from_slice(&pixel);
            }
        }
    }

    fn copy_from(&mut self, src_x: u16, src_y: u16, r: Rect) {
        if r.is_empty() {
            return;
        }
        let row_len = r.width as usize * BYTES_PER_PIXEL;
        let mut staged = Vec::with_capacity(row_len * r.height as usize);
        for row in 0..r.height {
            let start = self.row_offset(src_x, src_y + row);
            staged.extend_from_slice(&self.pixels[start..start + row_len]);
        }
        self.blit(r, &staged);
    }
}

/// Stateful decoder holding the per-connection zlib streams.
pub struct RectDecoder {
    zlib: Decompress,
    zrle: Decompress,
}

impl Default for RectDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RectDecoder {
    pub fn new() -> Self {
        Self {
            zlib: Decompress::new(true),
            zrle: Decompress::new(true),
        }
    }

    pub async fn decode<R>(
        &mut self,
        reader: &mut R,
        fb: &mut Framebuffer,
        rect: Rect,
        encoding: i32,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let encoding =
            Encoding::from_code(encoding).ok_or(SessionError::UnsupportedEncoding(encoding))?;
        fb.check(rect)?;

        match encoding {
            Encoding::Raw => {
                let mut data = vec![0u8; rect.area() * BYTES_PER_PIXEL];
                reader.read_exact(&mut data).await?;
                fb.blit(rect, &data);
            }
            Encoding::CopyRect => {
                let src_x = reader.read_u16().await?;
                let src_y = reader.read_u16().await?;
                fb.check(Rect {
                    x: src_x,
                    y: src_y,
                    ..rect
                })?;
                fb.copy_from(src_x, src_y, rect);
            }
            Encoding::Rre => decode_rre(reader, fb, rect).await?,
            Encoding::Hextile => decode_hextile(reader, fb, rect).await?,
            Encoding::Zlib => {
                let compressed = read_compressed(reader, "Zlib").await?;
                let data = inflate(&mut self.zlib, &compressed, "Zlib")?;
                let expected = rect.area() * BYTES_PER_PIXEL;
                if data.len() != expected {
                    return Err(SessionError::malformed(
                        "Zlib",
                        format!("inflated {} bytes, expected {}", data.len(), expected),
                    ));
                }
                fb.blit(rect, &data);
            }
            Encoding::Zrle => {
                let compressed = read_compressed(reader, "ZRLE").await?;
                let data = inflate(&mut self.zrle, &compressed, "ZRLE")?;
                decode_zrle_tiles(&data, fb, rect)?;
            }
        }
        Ok(())
    }
}

/// Reads a length-prefixed compressed payload.
async fn read_compressed<R: AsyncRead + Unpin>(
    reader: &mut R,
    encoding: &'static str,
) -> Result<Vec<u8>, SessionError> {
    let len = reader.read_u32().await?;
    if len > MAX_COMPRESSED_PAYLOAD {
        return Err(SessionError::malformed(
            encoding,
            format!("payload of {} bytes", len),
        ));
    }
    let mut compressed = vec![0u8; len as usize];
    reader.read_exact(&mut compressed).await?;
    Ok(compressed)
}

/// Inflates one payload from a stream that persists across rectangles.
fn inflate(
    stream: &mut Decompress,
    input: &[u8],
    encoding: &'static str,
) -> Result<Vec<u8>, SessionError> {
    let mut out = Vec::with_capacity(input.len().saturating_mul(4).max(4096));
    let mut consumed = 0usize;

    loop {
        if out.capacity() - out.len() < 4096 {
            out.reserve(64 * 1024);
        }
        let in_before = stream.total_in();
        let out_before = out.len();

        let status = stream
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|e| SessionError::malformed(encoding, e.to_string()))?;

        consumed += (stream.total_in() - in_before) as usize;
        let made_progress = stream.total_in() != in_before || out.len() != out_before;
        let output_full = out.len() == out.capacity();

        if matches!(status, Status::StreamEnd)
            || !made_progress
            || (consumed >= input.len() && !output_full)
        {
            break;
        }
    }

    Ok(out)
}

async fn read_pixel<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Pixel, SessionError> {
    let mut px = [0u8; BYTES_PER_PIXEL];
    reader.read_exact(&mut px).await?;
    Ok(px)
}

async fn decode_rre<R: AsyncRead + Unpin>(
    reader: &mut R,
    fb: &mut Framebuffer,
    rect: Rect,
) -> Result<(), SessionError> {
    let count = reader.read_u32().await?;
    let background = read_pixel(reader).await?;
    fb.fill(rect, background);

    for _ in 0..count {
        let pixel = read_pixel(reader).await?;
        let sub = Rect {
            x: reader.read_u16().await?,
            y: reader.read_u16().await?,
            width: reader.read_u16().await?,
            height: reader.read_u16().await?,
        };
        let absolute = within(rect, sub, "RRE")?;
        fb.fill(absolute, pixel);
    }
    Ok(())
}

async fn decode_hextile<R: AsyncRead + Unpin>(
    reader: &mut R,
    fb: &mut Framebuffer,
    rect: Rect,
) -> Result<(), SessionError> {
    let mut background: Pixel = [0; BYTES_PER_PIXEL];
    let mut foreground: Pixel = [0; BYTES_PER_PIXEL];

    for tile in tiles(rect, HEXTILE_TILE) {
        let flags = reader.read_u8().await?;

        if flags & HEXTILE_RAW != 0 {
            let mut data = vec![0u8; tile.area() * BYTES_PER_PIXEL];
            reader.read_exact(&mut data).await?;
            fb.blit(tile, &data);
            continue;
        }

        if flags & HEXTILE_BACKGROUND != 0 {
            background = read_pixel(reader).await?;
        }
        fb.fill(tile, background);

        if flags & HEXTILE_FOREGROUND != 0 {
            foreground = read_pixel(reader).await?;
        }

        if flags & HEXTILE_ANY_SUBRECTS != 0 {
            let count = reader.read_u8().await?;
            for _ in 0..count {
                let pixel = if flags & HEXTILE_SUBRECTS_COLOURED != 0 {
                    read_pixel(reader).await?
                } else {
                    foreground
                };
                let xy = reader.read_u8().await?;
                let wh = reader.read_u8().await?;
                let sub = Rect {
                    x: (xy >> 4) as u16,
                    y: (xy & 0x0F) as u16,
                    width: (wh >> 4) as u16 + 1,
                    height: (wh & 0x0F) as u16 + 1,
                };
                let absolute = within(tile, sub, "Hextile")?;
                fb.fill(absolute, pixel);
            }
        }
    }
    Ok(())
}

/// Splits `rect` into row-major tiles of at most `size` x `size`.
fn tiles(rect: Rect, size: u16) -> impl Iterator<Item = Rect> {
    (0..rect.height).step_by(size as usize).flat_map(move |ty| {
        (0..rect.width).step_by(size as usize).map(move |tx| Rect {
            x: rect.x + tx,
            y: rect.y + ty,
            width: size.min(rect.width - tx),
            height: size.min(rect.height - ty),
        })
    })
}

/// Translates `sub` (relative to `outer`) to absolute coordinates.
fn within(outer: Rect, sub: Rect, encoding: &'static str) -> Result<Rect, SessionError> {
    if sub.x as u32 + sub.width as u32 > outer.width as u32
        || sub.y as u32 + sub.height as u32 > outer.height as u32
    {
        return Err(SessionError::malformed(
            encoding,
            format!("subrectangle {:?} outside {:?}", sub, outer),
        ));
    }
    Ok(Rect {
        x: outer.x + sub.x,
        y: outer.y + sub.y,
        width: sub.width,
        height: sub.height,
    })
}

struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn u8(&mut self) -> Result<u8, SessionError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| SessionError::malformed("ZRLE", "truncated tile data"))?;
        self.pos += 1;
        Ok(b)
    }

    fn cpixel(&mut self) -> Result<Pixel, SessionError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 3)
            .ok_or_else(|| SessionError::malformed("ZRLE", "truncated pixel"))?;
        self.pos += 3;
        Ok([bytes[0], bytes[1], bytes[2], 0])
    }

    fn run_length(&mut self) -> Result<usize, SessionError> {
        let mut len = 1usize;
        loop {
            let b = self.u8()?;
            len += b as usize;
            if b != 255 {
                return Ok(len);
            }
        }
    }
}

fn decode_zrle_tiles(data: &[u8], fb: &mut Framebuffer, rect: Rect) -> Result<(), SessionError> {
    let mut cursor = ByteCursor { data, pos: 0 };

    for tile in tiles(rect, ZRLE_TILE) {
        let count = tile.area();
        let subencoding = cursor.u8()?;

        match subencoding {
            1 => {
                let pixel = cursor.cpixel()?;
                fb.fill(tile, pixel);
                continue;
            }
            0 | 2..=16 | 128 | 130..=255 => {}
            other => {
                return Err(SessionError::malformed(
                    "ZRLE",
                    format!("unknown subencoding {}", other),
                ))
            }
        }

        let mut out: Vec<u8> = Vec::with_capacity(count * BYTES_PER_PIXEL);
        match subencoding {
            0 => {
                for _ in 0..count {
                    out.extend_from_slice(&cursor.cpixel()?);
                }
            }
            2..=16 => {
                let palette = read_palette(&mut cursor, subencoding as usize)?;
                let bits = match subencoding {
                    2 => 1,
                    3 | 4 => 2,
                    _ => 4,
                };
                for _ in 0..tile.height {
                    let mut byte = 0u8;
                    let mut remaining = 0u32;
                    for _ in 0..tile.width {
                        if remaining == 0 {
                            byte = cursor.u8()?;
                            remaining = 8;
                        }
                        remaining -= bits;
                        let index = (byte >> remaining) & ((1u8 << bits) - 1);
                        let pixel = palette.get(index as usize).ok_or_else(|| {
                            SessionError::malformed("ZRLE", "palette index out of range")
                        })?;
                        out.extend_from_slice(pixel);
                    }
                }
            }
            128 => {
                while out.len() < count * BYTES_PER_PIXEL {
                    let pixel = cursor.cpixel()?;
                    let run = cursor.run_length()?;
                    push_run(&mut out, pixel, run, count)?;
                }
            }
            _ => {
                let palette = read_palette(&mut cursor, subencoding as usize - 128)?;
                while out.len() < count * BYTES_PER_PIXEL {
                    let b = cursor.u8()?;
                    let pixel = *palette.get((b & 0x7F) as usize).ok_or_else(|| {
                        SessionError::malformed("ZRLE", "palette index out of range")
                    })?;
                    let run = if b & 0x80 != 0 {
                        cursor.run_length()?
                    } else {
                        1
                    };
                    push_run(&mut out, pixel, run, count)?;
                }
            }
        }
        fb.blit(tile, &out);
    }
    Ok(())
}

fn read_palette(cursor: &mut ByteCursor<'_>, size: usize) -> Result<Vec<Pixel>, SessionError> {
    (0..size).map(|_| cursor.cpixel()).collect()
}

fn push_run(out: &mut Vec<u8>, pixel: Pixel, run: usize, count: usize) -> Result<(), SessionError> {
    if out.len() / BYTES_PER_PIXEL + run > count {
        return Err(SessionError::malformed("ZRLE", "run exceeds tile"));
    }
    for _ in 0..run {
        out.extend_from_slice(&pixel);
    }
    Ok(())
}
