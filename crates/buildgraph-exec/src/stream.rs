//! Stream forwarding that preserves partial UTF-8 sequences across read
//! boundaries: a multi-byte character split over two reads must never be
//! mangled into replacement characters.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Decode as much of `buffer` as forms complete UTF-8, returning the decoded
/// text and any trailing bytes that start an incomplete sequence. Genuinely
/// invalid bytes are replaced rather than dropped.
pub fn decode_partial_utf8(buffer: &[u8]) -> (String, Vec<u8>) {
    match std::str::from_utf8(buffer) {
        Ok(text) => (text.to_string(), Vec::new()),
        Err(error) => {
            let valid = error.valid_up_to();
            if error.error_len().is_none() {
                let text = std::str::from_utf8(&buffer[..valid])
                    .expect("prefix validated by valid_up_to")
                    .to_string();
                (text, buffer[valid..].to_vec())
            } else {
                (String::from_utf8_lossy(buffer).into_owned(), Vec::new())
            }
        }
    }
}

/// Forward a child stream to a writer, decoding across chunk boundaries.
pub async fn forward_stream<R>(
    mut reader: R,
    mut sink: impl std::io::Write,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..read]);
        let (text, rest) = decode_partial_utf8(&pending);
        pending = rest;
        if !text.is_empty() {
            sink.write_all(text.as_bytes())?;
            sink.flush()?;
        }
    }
    if !pending.is_empty() {
        // The stream ended mid-character.
        sink.write_all(String::from_utf8_lossy(&pending).as_bytes())?;
        sink.flush()?;
    }
    Ok(())
}
