//! Protocol version, security and initialisation phases.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::auth::{vnc_auth_response, CHALLENGE_LEN};
use super::errors::NegotiationError;
use super::messages::PixelFormat;

const SECURITY_NONE: u8 = 1;
const SECURITY_VNC_AUTH: u8 = 2;

/// Upper bound for reason strings and desktop names sent by the server.
const MAX_STRING_LEN: u32 = 64 * 1024;

/// Protocol minor version agreed with the server (major is always 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V3_3,
    V3_7,
    V3_8,
}

impl ProtocolVersion {
    fn banner(self) -> &'static [u8; 12] {
        match self {
            ProtocolVersion::V3_3 => b"RFB 003.003\n",
            ProtocolVersion::V3_7 => b"RFB 003.007\n",
            ProtocolVersion::V3_8 => b"RFB 003.008\n",
        }
    }
}

/// What the server told us about its desktop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub version: ProtocolVersion,
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

/// Runs the handshake up to and including ServerInit.
///
/// Security types are tried in order VNC Authentication, then None.
pub async fn negotiate<S>(stream: &mut S, password: &str) -> Result<ServerInit, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = negotiate_version(stream).await?;
    tracing::debug!(target: "rfb", "[HANDSHAKE] Using protocol {:?}", version);

    let security = negotiate_security_type(stream, version).await?;

    if security == SECURITY_VNC_AUTH {
        let mut challenge = [0u8; CHALLENGE_LEN];
        stream.read_exact(&mut challenge).await?;
        stream
            .write_all(&vnc_auth_response(password, &challenge))
            .await?;
    }

    // 3.3 and 3.7 skip SecurityResult for security type None
    if security == SECURITY_VNC_AUTH || version == ProtocolVersion::V3_8 {
        let result = stream.read_u32().await?;
        if result != 0 {
            let reason = if version == ProtocolVersion::V3_8 {
                read_string(stream).await?
            } else {
                "security handshake rejected".to_string()
            };
            return Err(NegotiationError::AuthenticationFailed(reason));
        }
    }

    // ClientInit: ask to share the desktop with other viewers
    stream.write_u8(1).await?;
    stream.flush().await?;

    let width = stream.read_u16().await?;
    let height = stream.read_u16().await?;
    let mut format = [0u8; 16];
    stream.read_exact(&mut format).await?;
    let name = read_string(stream).await?;

    tracing::info!(target: "rfb", "[HANDSHAKE] Desktop {:?} is {}x{}", name, width, height);

    Ok(ServerInit {
        version,
        width,
        height,
        pixel_format: PixelFormat::from_bytes(&format),
        name,
    })
}

async fn negotiate_version<S>(stream: &mut S) -> Result<ProtocolVersion, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut banner = [0u8; 12];
    stream.read_exact(&mut banner).await?;
    let (major, minor) = parse_banner(&banner)?;

    let version = match (major, minor) {
        (3, 3..=6) => ProtocolVersion::V3_3,
        (3, 7) => ProtocolVersion::V3_7,
        (3, m) if m >= 8 => ProtocolVersion::V3_8,
        (m, _) if m > 3 => ProtocolVersion::V3_8,
        _ => return Err(NegotiationError::UnsupportedVersion { major, minor }),
    };

    stream.write_all(version.banner()).await?;
    stream.flush().await?;
    Ok(version)
}

fn parse_banner(banner: &[u8; 12]) -> Result<(u32, u32), NegotiationError> {
    let invalid = || NegotiationError::InvalidVersion(String::from_utf8_lossy(banner).into_owned());

    if &banner[..4] != b"RFB " || banner[7] != b'.' || banner[11] != b'\n' {
        return Err(invalid());
    }
    let major = std::str::from_utf8(&banner[4..7])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    let minor = std::str::from_utf8(&banner[8..11])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    Ok((major, minor))
}

async fn negotiate_security_type<S>(
    stream: &mut S,
    version: ProtocolVersion,
) -> Result<u8, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if version == ProtocolVersion::V3_3 {
        // The server decides on its own
        let security = stream.read_u32().await?;
        return match security {
            0 => Err(NegotiationError::Refused(read_string(stream).await?)),
            1 | 2 => Ok(security as u8),
            other => Err(NegotiationError::NoSupportedSecurity(vec![other as u8])),
        };
    }

    let count = stream.read_u8().await?;
    if count == 0 {
        return Err(NegotiationError::Refused(read_string(stream).await?));
    }
    let mut offered = vec![0u8; count as usize];
    stream.read_exact(&mut offered).await?;

    let chosen = [SECURITY_VNC_AUTH, SECURITY_NONE]
        .into_iter()
        .find(|t| offered.contains(t))
        .ok_or(NegotiationError::NoSupportedSecurity(offered))?;

    tracing::debug!(target: "rfb", "[HANDSHAKE] Selected security type {}", chosen);
    stream.write_u8(chosen).await?;
    stream.flush().await?;
    Ok(chosen)
}

async fn read_string<S>(stream: &mut S) -> Result<String, NegotiationError>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await?;
    if len > MAX_STRING_LEN {
        return Err(NegotiationError::Refused(format!(
            "server string of {} bytes is too long",
            len
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
