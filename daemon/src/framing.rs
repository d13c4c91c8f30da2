//! Wire framing for the peer protocol (spec §6).
//!
//! There is no outer length prefix: "implementations must deduce
//! completion from internal length fields." These helpers read exactly as
//! many bytes off the socket as each message's own internal structure
//! calls for, by walking the same field layout `registry_core`'s codec
//! uses to decode, one `read_exact` at a time.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads one raw DER-encoded public key: an ASN.1 SEQUENCE whose own
/// tag+length header tells us how many content bytes follow.
pub async fn read_der_pubkey<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let mut out = header.to_vec();

    let length_byte = header[1];
    if length_byte & 0x80 == 0 {
        let len = length_byte as usize;
        let mut content = vec![0u8; len];
        stream.read_exact(&mut content).await?;
        out.extend_from_slice(&content);
    } else {
        let n_length_bytes = (length_byte & 0x7F) as usize;
        let mut length_bytes = vec![0u8; n_length_bytes];
        stream.read_exact(&mut length_bytes).await?;
        out.extend_from_slice(&length_bytes);

        let mut len: usize = 0;
        for b in &length_bytes {
            len = (len << 8) | (*b as usize);
        }
        let mut content = vec![0u8; len];
        stream.read_exact(&mut content).await?;
        out.extend_from_slice(&content);
    }
    Ok(out)
}

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

/// Reads one `Operation.raw()` message body following the `OP` tag:
/// `version(4) || prev_id(32) || uuid(16) || sized(address) ||
/// owners_count(4) || owners_count x sized(owner_der) || sized(signer_der)
/// || sized(signature)`.
pub async fn read_operation_message<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    read_u32(stream, &mut out).await?; // version
    read_fixed(stream, 32, &mut out).await?; // previous_operation_rev id
    read_fixed(stream, 16, &mut out).await?; // uuid
    read_sized(stream, &mut out).await?; // address
    let n_owners = read_u32(stream, &mut out).await?;
    for _ in 0..n_owners {
        read_sized(stream, &mut out).await?; // one owner der
    }
    read_sized(stream, &mut out).await?; // signer der
    read_sized(stream, &mut out).await?; // signature
    Ok(out)
}

/// Reads one `Block.raw_with_operations()` message body following the `BL`
/// tag: `op_count(4) || op_count x sized(operation_raw) ||
/// <signed block layout>`, where the signed block layout is
/// `version(4) || prev_id(32) || timestamp(4) || operations_limit(4) ||
/// op_id_count(4) || op_id_count x fixed(32) || difficulty(4) ||
/// padding(4) || checksum(32) || sized(signer_der) || sized(signature)`.
pub async fn read_block_message<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let op_count = read_u32(stream, &mut out).await?;
    for _ in 0..op_count {
        read_sized(stream, &mut out).await?;
    }

    read_u32(stream, &mut out).await?; // version
    read_fixed(stream, 32, &mut out).await?; // previous_block_rev id
    read_u32(stream, &mut out).await?; // timestamp
    read_u32(stream, &mut out).await?; // operations_limit
    let n_ids = read_u32(stream, &mut out).await?;
    for _ in 0..n_ids {
        read_fixed(stream, 32, &mut out).await?;
    }
    read_u32(stream, &mut out).await?; // difficulty
    read_u32(stream, &mut out).await?; // padding
    read_fixed(stream, 32, &mut out).await?; // checksum
    read_sized(stream, &mut out).await?; // signer der
    read_sized(stream, &mut out).await?; // signature
    Ok(out)
}
