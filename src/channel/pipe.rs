//! Fixed-width pipe channel
//!
//! The producer writes exactly one payload of `kind.width()` bytes; the
//! consumer reads exactly that many. Anything shorter on either side breaks
//! the contract.

use async_trait::async_trait;
use std::io::{self, Write};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{ChannelViolation, Consumer, Payload, PayloadKind, Producer, ResultValue};
use crate::task::TaskOutput;

/// Worker side: writes one payload to `writer` (stdout in a worker process).
#[derive(Debug)]
pub struct PipeProducer<W: Write> {
    kind: PayloadKind,
    writer: W,
    published: bool,
}

impl<W: Write> PipeProducer<W> {
    pub fn new(kind: PayloadKind, writer: W) -> Self {
        Self {
            kind,
            writer,
            published: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Producer for PipeProducer<W> {
    fn publish(&mut self, output: TaskOutput) -> Result<(), ChannelViolation> {
        if self.published {
            return Err(ChannelViolation::AlreadyPublished);
        }

        let payload = Payload::from_output(self.kind, &output)?;
        let bytes = payload.to_ne_bytes();
        let mut written = 0;
        while written < bytes.len() {
            match self.writer.write(&bytes[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        if written < bytes.len() {
            return Err(ChannelViolation::ShortWrite {
                expected: bytes.len(),
                actual: written,
            });
        }

        self.writer
            .flush()
            .map_err(|e| ChannelViolation::Io(e.to_string()))?;
        self.published = true;
        Ok(())
    }
}

/// Coordinator side: reads one payload of a known kind.
#[derive(Debug, Clone, Copy)]
pub struct PipeConsumer {
    kind: PayloadKind,
}

impl PipeConsumer {
    pub fn new(kind: PayloadKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }
}

#[async_trait]
impl Consumer for PipeConsumer {
    type Source = Box<dyn AsyncRead + Send + Unpin>;

    async fn collect(
        &mut self,
        mut source: Self::Source,
    ) -> Result<Option<ResultValue>, ChannelViolation> {
        let width = self.kind.width();
        let mut buf = vec![0u8; width];
        let mut filled = 0;

        while filled < width {
            match source.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChannelViolation::Io(e.to_string())),
            }
        }

        if filled < width {
            return Err(ChannelViolation::ShortRead {
                expected: width,
                actual: filled,
            });
        }

        Payload::from_ne_bytes(self.kind, &buf).map(|payload| Some(ResultValue::Payload(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Accepts a fixed number of bytes, then reports a closed pipe.
    struct Truncating {
        room: usize,
    }

    impl Write for Truncating {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.room);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn collect_bytes(kind: PayloadKind, bytes: Vec<u8>) -> Result<Option<ResultValue>, ChannelViolation> {
        PipeConsumer::new(kind).collect(Box::new(Cursor::new(bytes))).await
    }

    #[tokio::test]
    async fn test_float_round_trip_is_bit_exact() {
        for x in [0.1f32, -3.75, f32::MIN_POSITIVE, f32::MAX, 1.0e-40] {
            let mut producer = PipeProducer::new(PayloadKind::F32, Vec::new());
            producer.publish(TaskOutput::Float(f64::from(x))).unwrap();
            let bytes = producer.into_inner();
            assert_eq!(bytes.len(), 4);

            let value = collect_bytes(PayloadKind::F32, bytes).await.unwrap();
            match value {
                Some(ResultValue::Payload(Payload::F32(y))) => assert_eq!(y.to_bits(), x.to_bits()),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_f64_round_trip() {
        let mut producer = PipeProducer::new(PayloadKind::F64, Vec::new());
        producer.publish(TaskOutput::Float(std::f64::consts::PI)).unwrap();
        let value = collect_bytes(PayloadKind::F64, producer.into_inner()).await.unwrap();
        assert_eq!(value, Some(ResultValue::Payload(Payload::F64(std::f64::consts::PI))));
    }

    #[tokio::test]
    async fn test_partial_read_is_a_violation() {
        let err = collect_bytes(PayloadKind::F32, vec![1, 2]).await.unwrap_err();
        assert_eq!(err, ChannelViolation::ShortRead { expected: 4, actual: 2 });

        let err = collect_bytes(PayloadKind::I64, Vec::new()).await.unwrap_err();
        assert_eq!(err, ChannelViolation::ShortRead { expected: 8, actual: 0 });
    }

    #[tokio::test]
    async fn test_trailing_bytes_are_ignored() {
        let mut bytes = 7i32.to_ne_bytes().to_vec();
        bytes.extend_from_slice(b"noise");
        let value = collect_bytes(PayloadKind::I32, bytes).await.unwrap();
        assert_eq!(value, Some(ResultValue::Payload(Payload::I32(7))));
    }

    #[test]
    fn test_partial_write_is_a_violation() {
        let mut producer = PipeProducer::new(PayloadKind::F64, Truncating { room: 5 });
        let err = producer.publish(TaskOutput::Float(1.0)).unwrap_err();
        assert_eq!(err, ChannelViolation::ShortWrite { expected: 8, actual: 5 });
    }

    #[test]
    fn test_publish_at_most_once() {
        let mut producer = PipeProducer::new(PayloadKind::I32, Vec::new());
        producer.publish(TaskOutput::Int(1)).unwrap();
        assert_eq!(
            producer.publish(TaskOutput::Int(2)).unwrap_err(),
            ChannelViolation::AlreadyPublished
        );
        assert_eq!(producer.into_inner().len(), 4);
    }
}
