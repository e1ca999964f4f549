/// Line buffer for Server-Sent Events.
///
/// Network reads may split an event anywhere, so bytes are accumulated until a
/// full line is available. Lines are decoded only once complete, so a
/// multi-byte character split between reads survives. Only `data:` payloads are returned; `event:` lines,
/// comments and blank separators are dropped.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buf: Vec<u8>,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every complete `data:` payload.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(data) = parse_data_line(&String::from_utf8_lossy(&line)) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Flush a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        parse_data_line(&String::from_utf8_lossy(&rest))
    }
}

fn parse_data_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        None
    } else {
        Some(data.to_string())
    }
}

/// Byte stream that replays `parts` as separate network reads.
#[cfg(test)]
pub(crate) fn test_body(
    parts: &[&str],
) -> futures::stream::Iter<std::vec::IntoIter<Result<Vec<u8>, std::io::Error>>> {
    let parts: Vec<_> = parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
    futures::stream::iter(parts)
}
