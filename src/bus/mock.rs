//! Scripted in-memory transport for exercising the control stack without
//! hardware attached. Commands written to the transport are recorded for
//! assertions; a responder closure scripts the device side of each exchange.

use super::BusTransport;
use crate::error::{SpimError, SpimResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// In-memory [`BusTransport`] with scripted replies.
pub struct MockTransport {
    open: bool,
    fail_open: bool,
    banner: Option<String>,
    open_count: Arc<AtomicUsize>,
    raw_writes: Arc<Mutex<Vec<String>>>,
    commands: Arc<Mutex<Vec<String>>>,
    inbound: VecDeque<String>,
    responder: Option<Responder>,
}

impl MockTransport {
    /// A transport that opens successfully and answers nothing.
    pub fn new() -> Self {
        Self {
            open: false,
            fail_open: false,
            banner: None,
            open_count: Arc::new(AtomicUsize::new(0)),
            raw_writes: Arc::new(Mutex::new(Vec::new())),
            commands: Arc::new(Mutex::new(Vec::new())),
            inbound: VecDeque::new(),
            responder: None,
        }
    }

    /// Make `open()` fail, to exercise connectivity fault paths.
    pub fn fail_to_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Emit `banner` as the first inbound line after opening.
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    /// Script the device: the closure sees each command (terminator stripped)
    /// and returns the reply line, if any.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Handle counting successful opens, for idempotency assertions.
    pub fn open_count(&self) -> Arc<AtomicUsize> {
        self.open_count.clone()
    }

    /// Handle on the recorded commands, terminators stripped.
    pub fn writes(&self) -> Arc<Mutex<Vec<String>>> {
        self.commands.clone()
    }

    /// Handle on the recorded writes exactly as framed on the wire.
    pub fn raw_writes(&self) -> Arc<Mutex<Vec<String>>> {
        self.raw_writes.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BusTransport for MockTransport {
    fn open(&mut self) -> SpimResult<()> {
        if self.fail_open {
            return Err(SpimError::Connectivity {
                device: "mock".to_string(),
                port: "mock".to_string(),
                reason: "scripted open failure".to_string(),
            });
        }
        if !self.open {
            self.open = true;
            self.open_count.fetch_add(1, Ordering::SeqCst);
            if let Some(banner) = self.banner.clone() {
                self.inbound.push_back(format!("{banner}\n"));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write(&mut self, bytes: &[u8]) -> SpimResult<()> {
        if !self.open {
            return Err(SpimError::NotOpen);
        }
        let raw = String::from_utf8_lossy(bytes).to_string();
        let command = raw.trim_end_matches(['\r', '\n']).to_string();
        if let Ok(mut writes) = self.raw_writes.lock() {
            writes.push(raw);
        }
        if let Some(responder) = self.responder.as_mut() {
            if let Some(reply) = responder(&command) {
                self.inbound.push_back(format!("{reply}\n"));
            }
        }
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> SpimResult<String> {
        if !self.open {
            return Err(SpimError::NotOpen);
        }
        self.inbound
            .pop_front()
            .ok_or(SpimError::ReadTimeout(timeout))
    }

    fn flush_input(&mut self) {
        self.inbound.clear();
    }
}
