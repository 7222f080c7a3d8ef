//! Client-side RTMP handshake
//!
//! C0/C1 out, S0/S1/S2 in, C2 (echo of S1) out. Runs on the raw I/O
//! object before the transport's writer task takes ownership.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Protocol version carried in C0/S0
pub const RTMP_VERSION: u8 = 3;

/// Size of the C1/S1/C2/S2 packets
pub const HANDSHAKE_SIZE: usize = 1536;

/// Perform the client handshake over the connected channel
pub async fn handshake<C>(io: &mut C) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    // C0 + C1: version byte, then epoch(4) + zero(4) + filler(1528)
    io.write_all(&[RTMP_VERSION]).await?;
    let mut c1 = vec![0u8; HANDSHAKE_SIZE];
    c1[0..4].copy_from_slice(&0u32.to_be_bytes());
    io.write_all(&c1).await?;
    io.flush().await?;

    // S0: version check
    let mut s0 = [0u8; 1];
    io.read_exact(&mut s0).await?;
    if s0[0] != RTMP_VERSION {
        return Err(ProtocolError::UnsupportedVersion(s0[0]).into());
    }

    // S1, echoed back as C2
    let mut s1 = vec![0u8; HANDSHAKE_SIZE];
    io.read_exact(&mut s1).await?;
    io.write_all(&s1).await?;
    io.flush().await?;

    // S2 is read and discarded
    let mut s2 = vec![0u8; HANDSHAKE_SIZE];
    io.read_exact(&mut s2).await?;

    Ok(())
}
