//! # Streaming Query Alignment Reader
//!
//! Presents a query alignment as a sequence of batches without holding the
//! whole file in memory.
//!
//! The reader keeps exactly one prefetch buffer. `read_next` hands that buffer
//! to the caller by swapping it with the caller's `Msa`, then immediately
//! requests the next batch, so the following call usually finds its data
//! already materialised. With prefetching enabled the fill runs on a
//! dedicated thread connected by channels (at most one fill in flight);
//! otherwise it runs inline. Both modes produce identical batches.
//!
//! Positions are absolute sequence indices in the source:
//! - `consumed`: next index handed to the caller (front of the buffer)
//! - `source_pos`: next index the source iterator will yield
//! - `limit`: exclusive ceiling; nothing at or past it is ever produced

use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, instrument};

use crate::data::{Msa, MsaInfo};
use crate::error::{EpaError, Result};
use crate::io::fasta::SequenceSource;

/// Configuration for the streaming reader
#[derive(Clone, Debug)]
pub struct StreamingConfig {
    /// Size of the first batch (later batches use the size passed to `read_next`)
    pub chunk_size: usize,
    /// Keep only the columns not flagged in the gap mask
    pub premask: bool,
    /// Fill the next batch on a background thread
    pub prefetch: bool,
    /// Ceiling on the number of sequences ever produced
    pub max_read: Option<usize>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5000,
            premask: false,
            prefetch: true,
            max_read: None,
        }
    }
}

/// One fill request: advance the source by `skip`, then read up to `number`
#[derive(Clone, Copy, Debug)]
struct FillRequest {
    skip: usize,
    number: usize,
}

/// Owns the source; lives either inline or on the prefetch thread
struct Reader {
    source: SequenceSource,
    info: Arc<MsaInfo>,
    premask: bool,
}

impl Reader {
    fn fill(&mut self, request: FillRequest) -> Result<Msa> {
        for _ in 0..request.skip {
            match self.source.next() {
                Some(seq) => {
                    seq?;
                }
                None => break,
            }
        }

        let sites = self.info.sites();
        let mut batch = Msa::with_capacity(request.number);
        while batch.len() < request.number {
            let Some(seq) = self.source.next() else {
                break;
            };
            let seq = seq?;
            if seq.len() != sites {
                return Err(EpaError::format(format!(
                    "MSA file does not contain equal size sequences: '{}' has {} sites, expected {}",
                    seq.label(),
                    seq.len(),
                    sites
                )));
            }
            if self.premask {
                let masked = self.info.subset_sequence(seq.sites())?;
                batch.append(seq.label(), masked)?;
            } else {
                batch.push(seq)?;
            }
        }
        Ok(batch)
    }
}

enum Filler {
    Inline {
        reader: Reader,
        pending: Option<Result<Msa>>,
    },
    Background {
        requests: Option<Sender<FillRequest>>,
        results: Receiver<Result<Msa>>,
        worker: Option<JoinHandle<()>>,
        in_flight: bool,
    },
}

impl Filler {
    fn new(reader: Reader, prefetch: bool) -> Result<Self> {
        if !prefetch {
            return Ok(Self::Inline {
                reader,
                pending: None,
            });
        }
        let (req_tx, req_rx) = mpsc::channel::<FillRequest>();
        let (res_tx, res_rx): (SyncSender<Result<Msa>>, _) = mpsc::sync_channel(1);
        let worker = thread::Builder::new()
            .name("epa-prefetch".into())
            .spawn(move || {
                let mut reader = reader;
                for request in req_rx {
                    if res_tx.send(reader.fill(request)).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self::Background {
            requests: Some(req_tx),
            results: res_rx,
            worker: Some(worker),
            in_flight: false,
        })
    }

    fn start(&mut self, request: FillRequest) -> Result<()> {
        match self {
            Self::Inline { reader, pending } => {
                *pending = Some(reader.fill(request));
                Ok(())
            }
            Self::Background {
                requests,
                in_flight,
                ..
            } => {
                let sender = requests
                    .as_ref()
                    .ok_or_else(|| EpaError::invalid_input("prefetch thread already shut down"))?;
                sender
                    .send(request)
                    .map_err(|_| EpaError::invalid_input("prefetch thread terminated"))?;
                *in_flight = true;
                Ok(())
            }
        }
    }

    /// Wait for the outstanding fill, if any
    fn join(&mut self) -> Option<Result<Msa>> {
        match self {
            Self::Inline { pending, .. } => pending.take(),
            Self::Background {
                results, in_flight, ..
            } => {
                if !*in_flight {
                    return None;
                }
                *in_flight = false;
                Some(
                    results
                        .recv()
                        .unwrap_or_else(|_| Err(EpaError::invalid_input("prefetch thread terminated"))),
                )
            }
        }
    }
}

impl Drop for Filler {
    fn drop(&mut self) {
        if let Self::Background {
            requests,
            results,
            worker,
            in_flight,
        } = self
        {
            // Finish-then-discard: let an outstanding fill complete
            if *in_flight {
                let _ = results.recv();
            }
            requests.take();
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Chunked, prefetching reader over a query alignment
pub struct MsaStream {
    filler: Filler,
    info: Arc<MsaInfo>,
    chunk_size: usize,
    /// Filled batch waiting for the next `read_next`
    buffer: Msa,
    /// Sequences kept from the buffer across a short forward skip; they precede the next fill
    carry: Msa,
    consumed: usize,
    source_pos: usize,
    limit: usize,
}

impl MsaStream {
    /// Start streaming from `source`. The first fill begins immediately.
    pub fn new(source: SequenceSource, info: MsaInfo, config: &StreamingConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(EpaError::invalid_input("chunk size must be positive"));
        }
        let info = Arc::new(info);
        let reader = Reader {
            source,
            info: Arc::clone(&info),
            premask: config.premask,
        };
        let limit = config
            .max_read
            .unwrap_or(usize::MAX)
            .min(info.sequences());
        let mut stream = Self {
            filler: Filler::new(reader, config.prefetch)?,
            info,
            chunk_size: config.chunk_size,
            buffer: Msa::new(),
            carry: Msa::new(),
            consumed: 0,
            source_pos: 0,
            limit,
        };
        stream.request(0, config.chunk_size)?;
        Ok(stream)
    }

    pub fn info(&self) -> &MsaInfo {
        &self.info
    }

    /// Total sequences in the source
    pub fn num_sequences(&self) -> usize {
        self.info.sequences()
    }

    /// Absolute index of the next sequence `read_next` will return
    pub fn position(&self) -> usize {
        self.consumed
    }

    /// Queue a fill of up to `number` sequences after skipping `skip`
    fn request(&mut self, skip: usize, number: usize) -> Result<()> {
        let start = self.source_pos + skip;
        let budget = number.min(self.limit.saturating_sub(start));
        self.filler.start(FillRequest {
            skip,
            number: budget,
        })?;
        self.source_pos = start;
        Ok(())
    }

    /// Wait for the in-flight fill and move its result into the buffer
    fn complete(&mut self) -> Result<()> {
        if let Some(result) = self.filler.join() {
            let batch = result?;
            self.source_pos += batch.len();
            let mut merged = std::mem::take(&mut self.carry);
            merged.extend(batch)?;
            self.buffer = merged;
        }
        Ok(())
    }

    /// Hand the prefetched batch to the caller and start preparing the next
    /// one of size `number`. Returns the number of sequences in `result`;
    /// zero once the stream is exhausted.
    #[instrument(skip(self, result), level = "debug")]
    pub fn read_next(&mut self, result: &mut Msa, number: usize) -> Result<usize> {
        self.complete()?;
        std::mem::swap(result, &mut self.buffer);
        self.buffer.clear();
        self.consumed += result.len();
        self.request(0, number)?;
        debug!(
            batch = result.len(),
            position = self.consumed,
            "read query batch"
        );
        Ok(result.len())
    }

    /// Reposition to absolute sequence index `n`.
    ///
    /// Fails with `OutOfBounds` when `n` is past the last sequence and with
    /// `BackwardSeek` when `n` was already handed out; both leave the stream
    /// usable.
    pub fn skip_to_sequence(&mut self, n: usize) -> Result<()> {
        self.complete()?;

        if n >= self.num_sequences() {
            self.resume()?;
            return Err(EpaError::OutOfBounds {
                index: n,
                len: self.num_sequences(),
            });
        }
        if n < self.consumed {
            self.resume()?;
            return Err(EpaError::BackwardSeek {
                index: n,
                position: self.consumed,
            });
        }

        let offset = n - self.consumed;
        let skip = if offset <= self.buffer.len() {
            self.buffer.drain_front(offset);
            0
        } else {
            // Past a constrained limit the source may already be ahead of `n`
            let skip = n.saturating_sub(self.source_pos);
            self.buffer.clear();
            skip
        };
        self.consumed = n;
        self.carry = std::mem::take(&mut self.buffer);
        let top_up = self.chunk_size.saturating_sub(self.carry.len());
        self.request(skip, top_up)
    }

    /// Nothing changed; hand the completed buffer back to the next read
    fn resume(&mut self) -> Result<()> {
        self.carry = std::mem::take(&mut self.buffer);
        self.request(0, 0)
    }

    /// Produce at most `max_read` further sequences from the current position
    pub fn constrain(&mut self, max_read: usize) -> Result<()> {
        self.complete()?;
        self.limit = self
            .consumed
            .saturating_add(max_read)
            .min(self.num_sequences());
        let allowed = self.limit - self.consumed;
        if self.buffer.len() > allowed {
            let kept: Vec<_> = self.buffer.sequences()[..allowed].to_vec();
            self.buffer = Msa::from_sequences(kept)?;
        }
        self.resume()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Sequence;

    fn rows(n: usize) -> Vec<Sequence> {
        (0..n)
            .map(|i| Sequence::new(format!("s{}", i), format!("-AC{}-", ["A", "C", "G", "T"][i % 4])))
            .collect()
    }

    fn stream(n: usize, config: StreamingConfig) -> MsaStream {
        let data = rows(n);
        let info = MsaInfo::scan(data.iter().cloned().map(Ok)).unwrap();
        MsaStream::new(Box::new(data.into_iter().map(Ok)), info, &config).unwrap()
    }

    fn labels(msa: &Msa) -> Vec<String> {
        msa.iter().map(|s| s.label().to_string()).collect()
    }

    fn configs() -> Vec<StreamingConfig> {
        [true, false]
            .into_iter()
            .map(|prefetch| StreamingConfig {
                chunk_size: 3,
                prefetch,
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_batches_in_order() {
        for config in configs() {
            let mut s = stream(7, config);
            let mut batch = Msa::new();
            assert_eq!(s.read_next(&mut batch, 3).unwrap(), 3);
            assert_eq!(labels(&batch), vec!["s0", "s1", "s2"]);
            assert_eq!(s.read_next(&mut batch, 3).unwrap(), 3);
            assert_eq!(labels(&batch), vec!["s3", "s4", "s5"]);
            assert_eq!(s.read_next(&mut batch, 3).unwrap(), 1);
            assert_eq!(labels(&batch), vec!["s6"]);
            assert_eq!(s.read_next(&mut batch, 3).unwrap(), 0);
            assert_eq!(s.read_next(&mut batch, 3).unwrap(), 0);
        }
    }

    #[test]
    fn test_ceiling() {
        for mut config in configs() {
            config.max_read = Some(5);
            let mut s = stream(20, config);
            let mut batch = Msa::new();
            // Below the ceiling: full batches
            assert_eq!(s.read_next(&mut batch, 2).unwrap(), 3);
            assert_eq!(s.read_next(&mut batch, 4).unwrap(), 2);
            // Past the ceiling: short batch already delivered, then empty
            assert_eq!(s.read_next(&mut batch, 4).unwrap(), 0);
            assert_eq!(s.read_next(&mut batch, 4).unwrap(), 0);
        }
    }

    #[test]
    fn test_ceiling_short_final_batch() {
        let config = StreamingConfig {
            chunk_size: 4,
            max_read: Some(6),
            ..Default::default()
        };
        let mut s = stream(20, config);
        let mut batch = Msa::new();
        assert_eq!(s.read_next(&mut batch, 4).unwrap(), 4);
        assert_eq!(s.read_next(&mut batch, 4).unwrap(), 2);
        assert_eq!(s.read_next(&mut batch, 4).unwrap(), 0);
    }

    #[test]
    fn test_premask() {
        let config = StreamingConfig {
            chunk_size: 2,
            premask: true,
            ..Default::default()
        };
        let mut s = stream(4, config);
        let mut batch = Msa::new();
        s.read_next(&mut batch, 2).unwrap();
        assert_eq!(batch.num_sites(), s.info().nongap_count());
        assert_eq!(batch.get(0).unwrap().sites(), b"ACA");
    }

    #[test]
    fn test_skip_forward_within_and_beyond_buffer() {
        for config in configs() {
            let mut s = stream(12, config);
            let mut batch = Msa::new();
            s.skip_to_sequence(1).unwrap();
            s.read_next(&mut batch, 3).unwrap();
            assert_eq!(labels(&batch), vec!["s1", "s2", "s3"]);

            s.skip_to_sequence(9).unwrap();
            assert_eq!(s.position(), 9);
            s.read_next(&mut batch, 3).unwrap();
            assert_eq!(labels(&batch), vec!["s9", "s10", "s11"]);
        }
    }

    #[test]
    fn test_skip_errors_leave_stream_usable() {
        for config in configs() {
            let mut s = stream(6, config);
            let mut batch = Msa::new();
            s.read_next(&mut batch, 3).unwrap();

            let err = s.skip_to_sequence(6).unwrap_err();
            assert!(matches!(err, EpaError::OutOfBounds { index: 6, len: 6 }));
            let err = s.skip_to_sequence(1).unwrap_err();
            assert!(matches!(err, EpaError::BackwardSeek { index: 1, position: 3 }));
            assert!(err.is_bounds());

            s.read_next(&mut batch, 3).unwrap();
            assert_eq!(labels(&batch), vec!["s3", "s4", "s5"]);
        }
    }

    #[test]
    fn test_constrain_slice() {
        for config in configs() {
            let mut s = stream(10, config);
            let mut batch = Msa::new();
            s.skip_to_sequence(4).unwrap();
            s.constrain(4).unwrap();
            let mut seen = Vec::new();
            while s.read_next(&mut batch, 3).unwrap() > 0 {
                seen.extend(labels(&batch));
            }
            assert_eq!(seen, vec!["s4", "s5", "s6", "s7"]);
        }
    }

    #[test]
    fn test_length_mismatch_is_fatal() {
        let mut data = rows(3);
        let info = MsaInfo::scan(data.iter().cloned().map(Ok)).unwrap();
        data[1] = Sequence::new("bad", b"AC".to_vec());
        let config = StreamingConfig {
            chunk_size: 10,
            ..Default::default()
        };
        let mut s = MsaStream::new(Box::new(data.into_iter().map(Ok)), info, &config).unwrap();
        let mut batch = Msa::new();
        assert!(matches!(s.read_next(&mut batch, 10), Err(EpaError::Format { .. })));
    }
}
