//! # Message Transport
//!
//! Point-to-point exchange of opaque byte payloads between ranks, and the
//! `Sample` send/receive contract built on it. A receiver probes for the
//! size of the next payload before allocating its buffer.
//!
//! Status codes follow the usual message-passing numbering; any non-success
//! status becomes `EpaError::Transport` with a readable message.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};

use tracing::trace;

use crate::data::Sample;
use crate::error::{EpaError, Result};

pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const ERR_COUNT: i32 = 2;
    pub const ERR_TYPE: i32 = 3;
    pub const ERR_TAG: i32 = 4;
    pub const ERR_COMM: i32 = 5;
    pub const ERR_RANK: i32 = 6;
}

/// Descriptive error for a non-success status
pub fn status_error(code: i32) -> EpaError {
    let message = match code {
        status::SUCCESS => "success",
        status::ERR_COMM => "invalid communicator",
        status::ERR_TYPE => "invalid datatype argument",
        status::ERR_COUNT => "invalid count argument",
        status::ERR_TAG => "invalid tag argument",
        status::ERR_RANK => "invalid source or destination rank",
        _ => "unknown",
    };
    EpaError::Transport {
        status: code,
        message: message.to_string(),
    }
}

/// Translate a transport status into a result
pub fn check_status(code: i32) -> Result<()> {
    if code == status::SUCCESS {
        Ok(())
    } else {
        Err(status_error(code))
    }
}

/// Where a probed message came from and how large it is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub source: usize,
    pub tag: u32,
    pub len: usize,
}

pub trait Transport: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Blocks until the payload is handed to the transport
    fn send(&mut self, dest: usize, tag: u32, payload: &[u8]) -> Result<()>;

    /// Blocks until a message matching `source` / `tag` (`None` = any) is available
    fn probe(&mut self, source: Option<usize>, tag: Option<u32>) -> Result<Envelope>;

    /// Receive the matching message into `buf`, which must have the probed size
    fn recv(&mut self, source: usize, tag: u32, buf: &mut [u8]) -> Result<()>;
}

struct Message {
    source: usize,
    tag: u32,
    payload: Vec<u8>,
}

impl Message {
    fn matches(&self, source: Option<usize>, tag: Option<u32>) -> bool {
        source.map_or(true, |s| s == self.source) && tag.map_or(true, |t| t == self.tag)
    }
}

/// In-process transport: one endpoint per rank, connected by channels
pub struct LocalTransport {
    rank: usize,
    peers: Vec<Sender<Message>>,
    inbox: Receiver<Message>,
    /// Messages already pulled from the inbox but not yet received
    pending: VecDeque<Message>,
}

impl LocalTransport {
    /// Create `size` fully connected endpoints, indexed by rank
    pub fn create(size: usize) -> Vec<LocalTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                rank,
                peers: senders.clone(),
                inbox,
                pending: VecDeque::new(),
            })
            .collect()
    }

    fn find_pending(&self, source: Option<usize>, tag: Option<u32>) -> Option<usize> {
        self.pending.iter().position(|m| m.matches(source, tag))
    }

    /// Pull from the inbox until a matching message is pending
    fn wait_for(&mut self, source: Option<usize>, tag: Option<u32>) -> Result<usize> {
        if let Some(source) = source {
            if source >= self.peers.len() {
                return Err(status_error(status::ERR_RANK));
            }
        }
        loop {
            if let Some(idx) = self.find_pending(source, tag) {
                return Ok(idx);
            }
            match self.inbox.recv() {
                Ok(message) => self.pending.push_back(message),
                Err(_) => return Err(status_error(status::ERR_COMM)),
            }
        }
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&mut self, dest: usize, tag: u32, payload: &[u8]) -> Result<()> {
        let Some(peer) = self.peers.get(dest) else {
            return Err(status_error(status::ERR_RANK));
        };
        trace!(from = self.rank, to = dest, tag, bytes = payload.len(), "send");
        peer.send(Message {
            source: self.rank,
            tag,
            payload: payload.to_vec(),
        })
        .map_err(|_| status_error(status::ERR_COMM))
    }

    fn probe(&mut self, source: Option<usize>, tag: Option<u32>) -> Result<Envelope> {
        let idx = self.wait_for(source, tag)?;
        let message = &self.pending[idx];
        Ok(Envelope {
            source: message.source,
            tag: message.tag,
            len: message.payload.len(),
        })
    }

    fn recv(&mut self, source: usize, tag: u32, buf: &mut [u8]) -> Result<()> {
        let idx = self.wait_for(Some(source), Some(tag))?;
        if self.pending[idx].payload.len() != buf.len() {
            return Err(status_error(status::ERR_COUNT));
        }
        if let Some(message) = self.pending.remove(idx) {
            buf.copy_from_slice(&message.payload);
        }
        Ok(())
    }
}

/// Serialize `sample` and send it to `dest`
pub fn send_sample<T: Transport + ?Sized>(
    transport: &mut T,
    dest: usize,
    tag: u32,
    sample: &Sample,
) -> Result<()> {
    let payload = sample.to_bytes()?;
    transport.send(dest, tag, &payload)
}

/// Probe, allocate, receive and decode the next `Sample` with `tag`.
///
/// Returns the sender's rank with the sample.
pub fn receive_sample<T: Transport + ?Sized>(
    transport: &mut T,
    source: Option<usize>,
    tag: u32,
) -> Result<(usize, Sample)> {
    let envelope = transport.probe(source, Some(tag))?;
    let mut buf = vec![0u8; envelope.len];
    transport.recv(envelope.source, tag, &mut buf)?;
    Ok((envelope.source, Sample::from_bytes(&buf)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BranchIdx, InsertionRecord, Placement};

    fn sample(id: usize) -> Sample {
        let mut sample = Sample::new("(a:1{0},b:1{1},c:1{2});");
        let mut p = Placement::new(id, format!("q{}", id), 3);
        p.push(InsertionRecord::new(BranchIdx::new(1), -3.0, 0.5, 0.1));
        sample.push(p);
        sample
    }

    #[test]
    fn test_status_translation() {
        assert!(check_status(status::SUCCESS).is_ok());
        let messages = [
            (status::ERR_COMM, "invalid communicator"),
            (status::ERR_TYPE, "invalid datatype argument"),
            (status::ERR_COUNT, "invalid count argument"),
            (status::ERR_TAG, "invalid tag argument"),
            (status::ERR_RANK, "invalid source or destination rank"),
            (99, "unknown"),
        ];
        for (code, expected) in messages {
            match check_status(code) {
                Err(EpaError::Transport { status, message }) => {
                    assert_eq!(status, code);
                    assert_eq!(message, expected);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_sample_exchange() {
        let mut ranks = LocalTransport::create(2);
        let mut b = ranks.pop().unwrap();
        let mut a = ranks.pop().unwrap();
        send_sample(&mut a, 1, 7, &sample(3)).unwrap();
        let (source, received) = receive_sample(&mut b, None, 7).unwrap();
        assert_eq!(source, 0);
        assert_eq!(received, sample(3));
    }

    #[test]
    fn test_probe_filters_by_tag() {
        let mut ranks = LocalTransport::create(2);
        let mut b = ranks.pop().unwrap();
        let mut a = ranks.pop().unwrap();
        a.send(1, 1, b"first").unwrap();
        a.send(1, 2, b"second!").unwrap();

        let env = b.probe(None, Some(2)).unwrap();
        assert_eq!(env, Envelope { source: 0, tag: 2, len: 7 });
        let mut buf = vec![0u8; env.len];
        b.recv(0, 2, &mut buf).unwrap();
        assert_eq!(&buf, b"second!");

        // The skipped message is still delivered afterwards
        let env = b.probe(Some(0), None).unwrap();
        assert_eq!(env.tag, 1);
    }

    #[test]
    fn test_errors() {
        let mut ranks = LocalTransport::create(2);
        let mut b = ranks.pop().unwrap();
        let mut a = ranks.pop().unwrap();
        assert!(matches!(
            a.send(5, 0, b"x"),
            Err(EpaError::Transport { status: status::ERR_RANK, .. })
        ));
        a.send(1, 0, b"abc").unwrap();
        let mut small = [0u8; 2];
        assert!(matches!(
            b.recv(0, 0, &mut small),
            Err(EpaError::Transport { status: status::ERR_COUNT, .. })
        ));
    }

    #[test]
    fn test_threads_exchange() {
        let mut ranks = LocalTransport::create(3);
        let mut collector = ranks.remove(0);
        std::thread::scope(|s| {
            for mut worker in ranks {
                s.spawn(move || {
                    let id = worker.rank();
                    send_sample(&mut worker, 0, 1, &sample(id)).unwrap();
                });
            }
            let mut ids: Vec<usize> = (0..2)
                .map(|_| receive_sample(&mut collector, None, 1).unwrap().1.placements()[0].sequence_id())
                .collect();
            ids.sort();
            assert_eq!(ids, vec![1, 2]);
        });
    }
}
