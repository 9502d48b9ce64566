use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;

/// A byte-stream rewrite applied to traffic flowing from the remote pool to
/// the local service.
pub trait StreamTransform: Send {
    fn transform(&mut self, chunk: Bytes) -> Bytes;

    /// Called once when the remote side ends; returns any held-back bytes.
    fn flush(&mut self) -> Bytes {
        Bytes::new()
    }
}

/// Builds a fresh transform for every piped leg.
pub type TransformFactory = Arc<dyn Fn() -> Box<dyn StreamTransform> + Send + Sync>;

/// Applies transforms in order.
#[derive(Default)]
pub struct TransformChain {
    stages: Vec<Box<dyn StreamTransform>>,
}

impl TransformChain {
    pub fn push(&mut self, stage: Box<dyn StreamTransform>) {
        self.stages.push(stage);
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn transform(&mut self, chunk: Bytes) -> Bytes {
        self.stages
            .iter_mut()
            .fold(chunk, |chunk, stage| stage.transform(chunk))
    }

    pub fn flush(&mut self) -> Bytes {
        let mut carry = Bytes::new();
        for stage in &mut self.stages {
            let head = if carry.is_empty() {
                Bytes::new()
            } else {
                stage.transform(carry)
            };
            let tail = stage.flush();
            carry = concat(head, tail);
        }
        carry
    }
}

fn concat(a: Bytes, b: Bytes) -> Bytes {
    if a.is_empty() {
        return b;
    }
    if b.is_empty() {
        return a;
    }
    let mut out = BytesMut::with_capacity(a.len() + b.len());
    out.extend_from_slice(&a);
    out.extend_from_slice(&b);
    out.freeze()
}

/// Upper bound on bytes held back while looking for the Host line.
const MAX_HELD: usize = 64 * 1024;

fn host_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i-u)\r\nhost:[ \t]*([^\r\n]*)\r\n").expect("valid host line pattern")
    })
}

/// A Host line cut off by the end of the stream.
fn trailing_host_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i-u)\r\nhost:[ \t]*([^\r\n]*)\z").expect("valid trailing host pattern")
    })
}

/// Rewrites the value of the first `Host` header of the first request head.
///
/// Bytes before the value, the header name's case and everything after the
/// line pass through untouched. Only an incomplete trailing line is held back
/// between chunks.
pub struct HostRewrite {
    host: Bytes,
    held: BytesMut,
    done: bool,
}

impl HostRewrite {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: Bytes::from(host.into()),
            held: BytesMut::new(),
            done: false,
        }
    }

    fn give_up(&mut self) -> Bytes {
        self.done = true;
        self.held.split().freeze()
    }

    fn splice(&mut self, start: usize, end: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(self.held.len() + self.host.len());
        out.extend_from_slice(&self.held[..start]);
        out.extend_from_slice(&self.host);
        out.extend_from_slice(&self.held[end..]);
        self.held.clear();
        self.done = true;
        out.freeze()
    }
}

impl StreamTransform for HostRewrite {
    fn transform(&mut self, chunk: Bytes) -> Bytes {
        if self.done {
            return chunk;
        }
        self.held.extend_from_slice(&chunk);

        let head_end = find(&self.held, b"\r\n\r\n");
        let scan = head_end.map_or(self.held.len(), |at| at + 4);
        if let Some(value) = host_line()
            .captures(&self.held[..scan])
            .and_then(|caps| caps.get(1))
        {
            return self.splice(value.start(), value.end());
        }

        if head_end.is_some() || self.held.len() > MAX_HELD {
            return self.give_up();
        }

        // Keep the last line start so a Host line split across chunks is
        // still matched with its leading CRLF.
        match rfind(&self.held, b"\r\n") {
            Some(at) => self.held.split_to(at).freeze(),
            None => Bytes::new(),
        }
    }

    fn flush(&mut self) -> Bytes {
        if self.done {
            return Bytes::new();
        }
        let value = trailing_host_line()
            .captures(&self.held)
            .and_then(|caps| caps.get(1))
            .map(|m| (m.start(), m.end()));
        match value {
            Some((start, end)) => self.splice(start, end),
            None => self.give_up(),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
