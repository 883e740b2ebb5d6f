use async_stream::try_stream;
use futures::{Stream, StreamExt};

/// Incremental UTF-8 decoder.
///
/// Holds an incomplete multi-byte sequence at the end of one chunk until the next chunk
/// completes it. Invalid sequences decode to U+FFFD, like a non-fatal text decoder.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    if let Ok(valid) = std::str::from_utf8(valid) {
                        out.push_str(valid);
                    }
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Truncated sequence: wait for the next chunk.
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Flushes at end-of-data. A sequence still incomplete here can never be completed.
    pub fn finish(self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

/// Decodes a byte stream into text fragments, one per underlying read.
///
/// Errors from the byte stream end the sequence and are passed through unchanged.
pub fn decode_fragments<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    try_stream! {
        let mut decoder = Utf8Decoder::new();
        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            yield decoder.decode(chunk.as_ref());
        }
        let tail = decoder.finish();
        if !tail.is_empty() {
            yield tail;
        }
    }
}
