//! In-memory ring buffer for log output
//!
//! Plugged into `tracing-subscriber` as a [`MakeWriter`]; the admin log
//! endpoint reads it back with [`LogBuffer::snapshot`].

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

pub const DEFAULT_LOG_BUFFER_SIZE: usize = 100 * 1024;

struct Ring {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl Ring {
    fn push(&mut self, data: &[u8]) {
        let data = &data[data.len().saturating_sub(self.capacity)..];
        let overflow = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            // never keep a partial line at the head
            match self.bytes.iter().position(|b| *b == b'\n') {
                Some(nl) => {
                    self.bytes.drain(..=nl);
                }
                None => self.bytes.clear(),
            }
        }
        self.bytes.extend(data);
    }
}

#[derive(Clone)]
pub struct LogBuffer {
    ring: Arc<Mutex<Ring>>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BUFFER_SIZE)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(Ring {
                bytes: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    /// Up to `logs` lines from the oldest (`from_head`) or newest end
    pub fn snapshot(&self, logs: usize, from_head: bool) -> String {
        let raw: Vec<u8> = self.ring.lock().bytes.iter().copied().collect();
        let text = String::from_utf8_lossy(&raw);
        let lines: Vec<&str> = text.lines().collect();
        let picked = if from_head {
            &lines[..logs.min(lines.len())]
        } else {
            &lines[lines.len().saturating_sub(logs)..]
        };
        let mut out = picked.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.ring.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ring.lock().push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
