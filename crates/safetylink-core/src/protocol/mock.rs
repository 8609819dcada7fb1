//! Scripted in-memory transport for tests.
//!
//! `MockChannel` answers each written frame with the lines registered for
//! it and records everything that crosses the link. Clones share state, so
//! a test can keep a handle while the connection owns the channel.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use super::stream::{LineChannel, PortBackend};
use super::ProtocolError;

#[derive(Default)]
struct MockState {
    /// Scripted replies per written frame; the last one is reused
    replies: HashMap<String, VecDeque<Vec<String>>>,
    /// Lines waiting to be read
    inbox: VecDeque<Vec<u8>>,
    /// Captured writes
    writes: Vec<String>,
    reads: usize,
    /// A frame was written and its reply has not been fully read yet
    in_flight: bool,
    /// Writes that arrived while another cycle was still in flight
    overlaps: usize,
    read_delay: Duration,
    fail_io: bool,
}

/// Mock channel for unit and integration tests
#[derive(Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `frame` with `lines`. Successive calls queue further answers;
    /// the last queued answer keeps being returned.
    pub fn on(&self, frame: &str, lines: &[&str]) -> &Self {
        self.state
            .lock()
            .replies
            .entry(frame.to_string())
            .or_default()
            .push_back(lines.iter().map(|l| l.to_string()).collect());
        self
    }

    /// Forget every scripted answer for `frame`
    pub fn clear_replies(&self, frame: &str) {
        self.state.lock().replies.remove(frame);
    }

    /// Queue an unsolicited line
    pub fn push_line(&self, line: &[u8]) {
        self.state.lock().inbox.push_back(line.to_vec());
    }

    /// Delay applied to every read
    pub fn set_read_delay(&self, delay: Duration) {
        self.state.lock().read_delay = delay;
    }

    /// Make every subsequent read/write fail with an I/O error
    pub fn fail_io(&self, fail: bool) {
        self.state.lock().fail_io = fail;
    }

    /// All frames written so far
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Number of times `frame` was written
    pub fn write_count(&self, frame: &str) -> usize {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.as_str() == frame)
            .count()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Number of `read_line` calls
    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }

    /// Number of writes that interleaved with another request/response cycle
    pub fn overlaps(&self) -> usize {
        self.state.lock().overlaps
    }
}

impl LineChannel for MockChannel {
    fn write_frame(&mut self, frame: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_io {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        if state.in_flight {
            state.overlaps += 1;
        }
        state.in_flight = true;
        state.writes.push(frame.to_string());

        let reply = match state.replies.get_mut(frame) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        for line in reply.unwrap_or_default() {
            state.inbox.push_back(line.into_bytes());
        }
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let delay = self.state.lock().read_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        if state.fail_io {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock read failure"));
        }
        state.reads += 1;
        match state.inbox.pop_front() {
            Some(line) => Ok(line),
            None => {
                state.in_flight = false;
                Ok(Vec::new())
            }
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().inbox.clear();
        Ok(())
    }
}

/// Mock port backend handing out `MockChannel`s
#[derive(Default)]
pub struct MockBackend {
    candidates: Vec<String>,
    channels: HashMap<String, MockChannel>,
    failing: HashSet<String>,
    aliases: HashMap<String, String>,
    opened: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a discoverable port served by `channel`
    pub fn with_port(mut self, port: &str, channel: MockChannel) -> Self {
        self.candidates.push(port.to_string());
        self.channels.insert(port.to_string(), channel);
        self
    }

    /// Register a discoverable port whose open always fails
    pub fn with_failing_port(mut self, port: &str) -> Self {
        self.candidates.push(port.to_string());
        self.failing.insert(port.to_string());
        self
    }

    /// Make `alias` resolve to `target`, like a `/dev/serial/by-id` symlink
    pub fn with_alias(mut self, alias: &str, target: &str) -> Self {
        self.aliases.insert(alias.to_string(), target.to_string());
        self
    }

    /// Ports opened so far, in order
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl PortBackend for MockBackend {
    fn discover(&self) -> Vec<String> {
        self.candidates.clone()
    }

    fn open(
        &self,
        port: &str,
        _baud_rate: u32,
        _read_timeout: Duration,
    ) -> Result<Box<dyn LineChannel>, ProtocolError> {
        self.opened.lock().push(port.to_string());
        if self.failing.contains(port) {
            return Err(ProtocolError::OpenFailed {
                port: port.to_string(),
                reason: "mock open failure".to_string(),
            });
        }
        self.channels
            .get(port)
            .map(|ch| Box::new(ch.clone()) as Box<dyn LineChannel>)
            .ok_or_else(|| ProtocolError::OpenFailed {
                port: port.to_string(),
                reason: "no such device".to_string(),
            })
    }

    fn resolve(&self, port: &str) -> String {
        self.aliases
            .get(port)
            .cloned()
            .unwrap_or_else(|| port.to_string())
    }
}
