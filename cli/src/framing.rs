//! Wire framing for the peer protocol (spec §6), mirroring `registry-daemon`'s
//! `framing` module: no outer length prefix, so each field is read off the
//! socket one `read_exact` at a time, deducing completion from the same
//! internal length fields the codec itself decodes.

use tokio::io::{AsyncRead, AsyncReadExt};

async fn read_u32<R: AsyncRead + Unpin>(stream: &mut R, out: &mut Vec<u8>) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    out.extend_from_slice(&buf);
    Ok(u32::from_be_bytes(buf))
}

async fn read_fixed<R: AsyncRead + Unpin>(stream: &mut R, n: usize, out: &mut Vec<u8>) -> std::io::Result<()> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await?;
    out.extend_from_slice(&buf);
    Ok(())
}

async fn read_sized<R: AsyncRead + Unpin>(stream: &mut R, out: &mut Vec<u8>) -> std::io::Result<()> {
    let len = read_u32(stream, out).await?;
    read_fixed(stream, len as usize, out).await
}

/// `version(4) || prev_id(32) || uuid(16) || sized(address) ||
/// owners_count(4) || owners_count x sized(owner_der) || sized(signer_der)
/// || sized(signature)`.
pub async fn read_operation_message<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    read_u32(stream, &mut out).await?;
    read_fixed(stream, 32, &mut out).await?;
    read_fixed(stream, 16, &mut out).await?;
    read_sized(stream, &mut out).await?;
    let n_owners = read_u32(stream, &mut out).await?;
    for _ in 0..n_owners {
        read_sized(stream, &mut out).await?;
    }
    read_sized(stream, &mut out).await?;
    read_sized(stream, &mut out).await?;
    Ok(out)
}

/// `op_count(4) || op_count x sized(operation_raw) || <signed block layout>`.
pub async fn read_block_message<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let op_count = read_u32(stream, &mut out).await?;
    for _ in 0..op_count {
        read_sized(stream, &mut out).await?;
    }

    read_u32(stream, &mut out).await?;
    read_fixed(stream, 32, &mut out).await?;
    read_u32(stream, &mut out).await?;
    read_u32(stream, &mut out).await?;
    let n_ids = read_u32(stream, &mut out).await?;
    for _ in 0..n_ids {
        read_fixed(stream, 32, &mut out).await?;
    }
    read_u32(stream, &mut out).await?;
    read_u32(stream, &mut out).await?;
    read_fixed(stream, 32, &mut out).await?;
    read_sized(stream, &mut out).await?;
    read_sized(stream, &mut out).await?;
    Ok(out)
}
