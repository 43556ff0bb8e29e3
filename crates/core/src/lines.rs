/// Splits a byte stream into text lines, holding back the unterminated tail.
///
/// Both `\n` and `\r\n` terminate a line. Bytes are kept raw until a line is
/// complete so multi-byte characters split across reads survive intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

const MAX_PENDING: usize = 64 * 1024;

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                lines.push(self.take_line());
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_PENDING {
                    lines.push(self.take_line());
                }
            }
        }
        lines
    }

    /// Drains whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn take_line(&mut self) -> String {
        if self.pending.last() == Some(&b'\r') {
            self.pending.pop();
        }
        let line = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        line
    }
}
