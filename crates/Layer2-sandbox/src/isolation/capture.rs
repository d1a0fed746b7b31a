//! Bounded output capture
//!
//! 상한까지만 보관하고 나머지는 읽어서 버린다 (파이프가 막혀 자식이 멈추지 않도록).

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 캡처된 스트림
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Captured {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub total_bytes: u64,
}

impl Captured {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self {
            total_bytes: bytes.len() as u64,
            bytes,
            truncated: false,
        }
    }

    /// 마지막 `max` 바이트를 문자열로 (진단용)
    pub fn tail(&self, max: usize) -> String {
        excerpt(&self.bytes, max)
    }
}

/// 스트림을 끝까지 읽되 `limit` 바이트만 보관
pub async fn drain<R>(mut reader: R, limit: usize) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        captured.total_bytes += n as u64;

        let room = limit.saturating_sub(captured.bytes.len());
        if room >= n {
            captured.bytes.extend_from_slice(&buf[..n]);
        } else {
            captured.bytes.extend_from_slice(&buf[..room]);
            captured.truncated = true;
        }
    }

    Ok(captured)
}

/// 바이트 끝부분을 손실 허용 UTF-8 문자열로
pub fn excerpt(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    let text = String::from_utf8_lossy(&bytes[start..]);
    let text = text.trim();
    if start > 0 {
        format!("...{}", text)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_within_limit() {
        let data: &[u8] = b"Abha=-23.0/18.0/59.2\n";
        let captured = drain(data, 1024).await.unwrap();
        assert_eq!(captured.bytes, data);
        assert!(!captured.truncated);
        assert_eq!(captured.total_bytes, data.len() as u64);
    }

    #[tokio::test]
    async fn test_drain_truncates_but_counts_everything() {
        let data = vec![b'x'; 20_000];
        let captured = drain(data.as_slice(), 100).await.unwrap();
        assert_eq!(captured.bytes.len(), 100);
        assert!(captured.truncated);
        assert_eq!(captured.total_bytes, 20_000);
    }

    #[test]
    fn test_excerpt_keeps_tail() {
        assert_eq!(excerpt(b"  short  ", 100), "short");
        assert_eq!(excerpt(b"0123456789", 4), "...6789");
    }
}
