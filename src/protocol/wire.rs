use anyhow::{bail, Result};
use core::str;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length-prefixed strings carry a u16 byte count, so longer names cannot be framed.
pub const MAX_UTF_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProtocolError {
    message: String,
}

impl ProtocolError {
    pub fn new(message: String) -> Self {
        ProtocolError { message }
    }
}

pub fn put_utf(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_UTF_LEN {
        bail!(ProtocolError::new(format!(
            "string of {} bytes does not fit a u16 length prefix",
            bytes.len()
        )));
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub async fn read_u8<R: AsyncRead + Unpin>(r: &mut R) -> Result<u8> {
    let mut buf: [u8; 1] = [0; 1];
    r.read_exact(&mut buf).await?;
    Ok(buf[0])
}

pub async fn read_u16<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16> {
    let mut buf: [u8; 2] = [0; 2];
    r.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

// ids, counts and block indices travel as signed int32; the bit pattern is kept as-is
pub async fn read_u32<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32> {
    let mut buf: [u8; 4] = [0; 4];
    r.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

pub async fn read_u64<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    let mut buf: [u8; 8] = [0; 8];
    r.read_exact(&mut buf).await?;
    Ok(u64::from_be_bytes(buf))
}

pub async fn read_utf<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let len = read_u16(r).await?;
    let mut buf = vec![0; len.into()];
    r.read_exact(&mut buf).await?;
    match str::from_utf8(&buf) {
        Ok(s) => Ok(s.to_string()),
        Err(e) => bail!(ProtocolError::new(format!(
            "length-prefixed string is not valid utf-8: {e}"
        ))),
    }
}

/// Reads a list of int32 values that runs until the peer closes the stream.
pub async fn read_u32_until_eof<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u32>> {
    let mut raw = Vec::new();
    r.read_to_end(&mut raw).await?;
    if raw.len() % 4 != 0 {
        bail!(ProtocolError::new(format!(
            "stream of int32 values ended after {} bytes, not aligned to 4",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
