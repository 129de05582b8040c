//! IEEE 488.2 definite-length binary blocks: `#<n><len:n digits><body:len>`.

use scope_core::{ProgressCallback, ScopeError, ScopeResult, Transport};

/// Bytes of vendor prefix (`DAT1,`, `CURV `, ...) tolerated before the `#`.
const MAX_PREFIX: usize = 16;

/// How the header length of a block should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockLength {
    /// The header counts bytes.
    #[default]
    Bytes,
    /// The header counts 16-bit samples (firmware quirk); the body is twice as long.
    Samples16,
}

/// Parse the `<n><len>` part of a header once `#` has been consumed.
pub fn parse_length_digits(ndigits: u8, digits: &[u8]) -> ScopeResult<usize> {
    if !(b'1'..=b'9').contains(&ndigits) {
        return Err(ScopeError::PreambleMalformed(format!(
            "unsupported block length digit '{}'",
            char::from(ndigits)
        )));
    }
    let text = std::str::from_utf8(digits)
        .map_err(|_| ScopeError::PreambleMalformed("non-ASCII block length".into()))?;
    text.parse::<usize>()
        .map_err(|_| ScopeError::PreambleMalformed(format!("bad block length '{}'", text)))
}

/// Read one block from `transport`, including the trailing newline.
pub async fn read_block(
    transport: &mut dyn Transport,
    length: BlockLength,
    progress: Option<&ProgressCallback>,
) -> ScopeResult<Vec<u8>> {
    let mut skipped = 0;
    loop {
        let b = transport.read_raw(1, None).await?;
        if b[0] == b'#' {
            break;
        }
        skipped += 1;
        if skipped > MAX_PREFIX {
            return Err(ScopeError::OutOfSync(
                "expected '#' at start of binary block".into(),
            ));
        }
    }

    let ndigits = transport.read_raw(1, None).await?[0];
    let count = usize::from(ndigits.wrapping_sub(b'0'));
    if count == 0 || count > 9 {
        return Err(ScopeError::PreambleMalformed(format!(
            "unsupported block length digit '{}'",
            char::from(ndigits)
        )));
    }
    let digits = transport.read_raw(count, None).await?;
    let mut len = parse_length_digits(ndigits, &digits)?;
    if length == BlockLength::Samples16 {
        len *= 2;
    }
    tracing::trace!(bytes = len, "binary block header");

    let body = transport.read_raw(len, progress).await?;

    let term = transport.read_raw(1, None).await?;
    if term[0] != b'\n' {
        return Err(ScopeError::OutOfSync(format!(
            "block of {} bytes not followed by newline",
            len
        )));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{encode_block, MockReply, MockTransport};

    fn transport_with(payload: Vec<u8>) -> MockTransport {
        let mut sent = Some(payload);
        MockTransport::new(move |_: &str| match sent.take() {
            Some(p) => vec![MockReply::Raw(p)],
            None => vec![],
        })
    }

    #[tokio::test]
    async fn test_plain_block() {
        let mut t = transport_with(encode_block(b"hello", 5));
        t.send_bytes(b"C1:WF? DAT1\n").await.unwrap();
        let body = read_block(&mut t, BlockLength::Bytes, None).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_vendor_prefix_skipped() {
        let mut payload = b"DAT1,".to_vec();
        payload.extend(encode_block(b"xy", 2));
        let mut t = transport_with(payload);
        t.send_bytes(b"C1:WF? DAT1\n").await.unwrap();
        assert_eq!(read_block(&mut t, BlockLength::Bytes, None).await.unwrap(), b"xy");
    }

    #[tokio::test]
    async fn test_sample_count_header() {
        // 100 000 samples of 16 bits announced as "#9000100000"
        let body = vec![0x5au8; 200_000];
        let encoded = encode_block(&body, 100_000);
        assert_eq!(&encoded[..11], b"#9000100000");
        let mut t = transport_with(encoded);
        t.send_bytes(b"C1:WF? DAT1\n").await.unwrap();
        let read = read_block(&mut t, BlockLength::Samples16, None).await.unwrap();
        assert_eq!(read.len(), 200_000);
    }

    #[tokio::test]
    async fn test_missing_hash() {
        let mut t = transport_with(b"this is definitely not a block\n".to_vec());
        t.send_bytes(b"CURV?\n").await.unwrap();
        let err = read_block(&mut t, BlockLength::Bytes, None).await.unwrap_err();
        assert!(err.requires_resync());
    }

    #[test]
    fn test_length_digits() {
        assert_eq!(parse_length_digits(b'3', b"042").unwrap(), 42);
        assert!(parse_length_digits(b'0', b"").is_err());
        assert!(parse_length_digits(b'2', b"4x").is_err());
    }
}
