pub const EVENT_DELIMITER: &str = "\n\n";
pub const DATA_PREFIX: &str = "data: ";

/// Splits decoded text into SSE event payloads.
///
/// Fragment boundaries are arbitrary, so whatever follows the last delimiter is carried over
/// and prepended to the next fragment. Only delimiter-terminated records are yielded.
#[derive(Debug, Default)]
pub struct EventFramer {
    carry: String,
}

impl EventFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.carry.push_str(fragment);

        let mut payloads = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = self.carry[consumed..].find(EVENT_DELIMITER) {
            let record = &self.carry[consumed..consumed + pos];
            if let Some(payload) = record_payload(record) {
                payloads.push(payload);
            }
            consumed += pos + EVENT_DELIMITER.len();
        }
        self.carry.drain(..consumed);
        payloads
    }

    /// Text received after the last complete record.
    pub fn pending(&self) -> &str {
        &self.carry
    }

    /// Ends the stream, returning the unterminated trailing record if there was one.
    pub fn finish(self) -> Option<String> {
        if self.carry.trim().is_empty() {
            None
        } else {
            Some(self.carry)
        }
    }
}

fn record_payload(record: &str) -> Option<String> {
    let mut payload: Option<String> = None;
    for line in record.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let data = match line.strip_prefix(DATA_PREFIX) {
            Some(rest) => rest,
            None if line == DATA_PREFIX.trim_end() => "",
            None => continue,
        };
        match &mut payload {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(data);
            }
            None => payload = Some(data.to_string()),
        }
    }
    payload
}
