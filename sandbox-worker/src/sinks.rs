//! Stdout message sink
//!
//! Writes each message as one NDJSON line and flushes immediately, so the
//! host sees output in order even if the worker is killed mid-job.

use sandbox_core::domain::message::Message;
use sandbox_core::protocol::encode_message;
use sandbox_js::MessageSink;
use std::io::Write;
use tracing::warn;

pub struct StdoutSink<W: Write> {
    out: W,
}

impl StdoutSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> StdoutSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> MessageSink for StdoutSink<W> {
    fn write(&mut self, message: &Message) {
        let line = match encode_message(message) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode message {}: {}", message.message_id, e);
                return;
            }
        };

        if let Err(e) = self
            .out
            .write_all(line.as_bytes())
            .and_then(|_| self.out.flush())
        {
            warn!("Failed to write message {}: {}", message.message_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_core::domain::message::MessageType;
    use sandbox_core::protocol::decode_message;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Shared(Rc<RefCell<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_one_line_per_message() {
        let buffer = Shared::default();
        let mut sink = StdoutSink::new(buffer.clone());

        sink.write(&Message::new("job", 1, MessageType::Log, serde_json::json!("multi\nline")));
        sink.write(&Message::new("job", 2, MessageType::Warn, serde_json::json!("second")));

        let output = String::from_utf8(buffer.0.borrow().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(decode_message(lines[0]).unwrap().text(), Some("multi\nline"));
        assert_eq!(decode_message(lines[1]).unwrap().message_id, 2);
    }
}
