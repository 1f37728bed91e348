//! Scripted transport for exercising the programmer without a device

use std::collections::VecDeque;
use std::io::ErrorKind;

use crate::Transport;

enum Reply {
    Data(Vec<u8>),
    Fail(ErrorKind),
}

/// Records every write and replays queued replies to reads.
///
/// A reply larger than the read buffer is split across reads, and an
/// exhausted script reads as a timeout (zero bytes).
pub struct MockTransport {
    pub writes: Vec<Vec<u8>>,
    pub reads: usize,
    script: VecDeque<Reply>,
    write_failures: VecDeque<ErrorKind>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            writes: vec![],
            reads: 0,
            script: VecDeque::new(),
            write_failures: VecDeque::new(),
        }
    }

    /// Queue data for a read, an empty reply reads as a timeout
    pub fn reply(mut self, data: &[u8]) -> Self {
        self.script.push_back(Reply::Data(data.to_vec()));
        self
    }

    /// Fail the next write instead of recording it
    pub fn fail_write(mut self, kind: ErrorKind) -> Self {
        self.write_failures.push_back(kind);
        self
    }

    /// Queue a read failure
    pub fn fail(mut self, kind: ErrorKind) -> Self {
        self.script.push_back(Reply::Fail(kind));
        self
    }
}

impl Transport for MockTransport {
    type Error = ErrorKind;

    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        if let Some(kind) = self.write_failures.pop_front() {
            return Err(kind);
        }

        self.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn read(&mut self, buff: &mut [u8]) -> Result<usize, Self::Error> {
        self.reads += 1;

        match self.script.pop_front() {
            Some(Reply::Data(mut d)) => {
                let n = d.len().min(buff.len());
                buff[..n].copy_from_slice(&d[..n]);

                if d.len() > n {
                    self.script.push_front(Reply::Data(d.split_off(n)));
                }

                Ok(n)
            }
            Some(Reply::Fail(kind)) => Err(kind),
            None => Ok(0),
        }
    }
}
