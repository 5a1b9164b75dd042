//! Splitting artifact content into outbound messages.
//!
//! Without a delimiter the whole content is one message. With one, each
//! non-empty token between delimiters is one message. The recorded ranges
//! tile the content so a partially-sent artifact can be split back into
//! byte-exact children:
//!
//! ```text
//! content:  a b , , c d , e
//! tokens:   [ab]     [cd]  [e]
//! ranges:   [0,3)[3,   7)[7,8)
//! ```
//!
//! A range ends right after its token's trailing delimiter. Delimiters of
//! empty tokens belong to the next range; trailing ones to the last.

use super::range::ByteRange;

/// One outbound message cut from an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSpan {
    /// Bytes sent as the message payload.
    pub payload: ByteRange,
    /// Bytes of the artifact this message accounts for.
    pub range: ByteRange,
}

/// Expand the `\n`, `\r` and `\t` escapes of a configured delimiter.
pub fn parse_delimiter(raw: &str) -> Vec<u8> {
    raw.replace("\\n", "\n")
        .replace("\\r", "\r")
        .replace("\\t", "\t")
        .into_bytes()
}

/// Cut `content` into messages.
///
/// Content made only of delimiters yields no messages.
pub fn split_messages(content: &[u8], delimiter: Option<&[u8]>) -> Vec<MessageSpan> {
    let len = content.len() as u64;

    let delimiter = match delimiter {
        Some(d) if !d.is_empty() => d,
        _ => {
            let whole = ByteRange::new(0, len);
            return vec![MessageSpan {
                payload: whole,
                range: whole,
            }];
        }
    };

    // (token, end of trailing delimiter)
    let mut tokens: Vec<(ByteRange, u64)> = Vec::new();
    let mut cursor = 0usize;
    while cursor <= content.len() {
        let (token_end, next) = match find(&content[cursor..], delimiter) {
            Some(at) => (cursor + at, cursor + at + delimiter.len()),
            None => (content.len(), content.len() + 1),
        };
        if token_end > cursor {
            tokens.push((
                ByteRange::new(cursor as u64, token_end as u64),
                next.min(content.len()) as u64,
            ));
        }
        cursor = next;
    }

    let count = tokens.len();
    let mut spans = Vec::with_capacity(count);
    let mut start = 0u64;
    for (i, (payload, trailing_end)) in tokens.into_iter().enumerate() {
        let end = if i + 1 == count { len } else { trailing_end };
        spans.push(MessageSpan {
            payload,
            range: ByteRange::new(start, end),
        });
        start = end;
    }
    spans
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
