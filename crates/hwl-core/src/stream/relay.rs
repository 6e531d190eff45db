//! Bidirectional copy between two byte streams

use tokio_util::sync::CancellationToken;

use super::ByteStream;
use crate::error::StreamError;
use crate::traits::{StreamReceiver, StreamSender};

/// Bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copy bytes both ways between `a` and `b` until either side ends.
///
/// The relay stops on end-of-stream from either side, on a transport error
/// from either side, or when `cancel` fires. Both write halves are then
/// closed. A chunk that was already read is still written unless `cancel`
/// fired, but no further reads are issued. Order within each direction is
/// preserved.
///
/// Ordinary termination (end of stream, cancellation, a peer that went away)
/// is not an error. The first real failure is returned.
pub async fn relay(
    a: ByteStream,
    b: ByteStream,
    cancel: CancellationToken,
) -> Result<RelayStats, StreamError> {
    let (a_tx, a_rx) = a.split();
    let (b_tx, b_rx) = b.split();
    let stop = cancel.child_token();

    let (forward, backward) = tokio::join!(
        pump(a_rx, b_tx, &stop, &cancel),
        pump(b_rx, a_tx, &stop, &cancel),
    );

    let stats = RelayStats {
        a_to_b: forward.copied,
        b_to_a: backward.copied,
    };
    tracing::debug!(
        "Relay finished: {} bytes a->b, {} bytes b->a",
        stats.a_to_b,
        stats.b_to_a
    );

    match (forward.error, backward.error) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(stats),
    }
}

struct PumpOutcome {
    copied: u64,
    error: Option<StreamError>,
}

async fn pump(
    mut rx: Box<dyn StreamReceiver>,
    mut tx: Box<dyn StreamSender>,
    stop: &CancellationToken,
    cancel: &CancellationToken,
) -> PumpOutcome {
    let mut copied = 0u64;

    let result = loop {
        let received = tokio::select! {
            biased;
            _ = stop.cancelled() => break Ok(()),
            received = rx.receive() => received,
        };

        match received {
            Ok(Some(chunk)) => {
                let len = chunk.len() as u64;
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Ok(()),
                    sent = tx.send(chunk) => sent,
                };
                if let Err(e) = sent {
                    break Err(e);
                }
                copied += len;
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    stop.cancel();
    if let Err(e) = tx.close().await {
        tracing::trace!("Closing relay half failed: {}", e);
    }

    PumpOutcome {
        copied,
        error: result.err().filter(|e: &StreamError| !e.is_termination()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};
    use std::time::Duration;

    const MIB: usize = 1024 * 1024;

    fn random_payload(rng: &mut StdRng, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        data
    }

    async fn send_in_random_chunks(tx: &mut Box<dyn StreamSender>, data: &[u8], seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut offset = 0;
        while offset < data.len() {
            let len = rng.gen_range(1..=8192).min(data.len() - offset);
            tx.send(Bytes::copy_from_slice(&data[offset..offset + len]))
                .await
                .unwrap();
            offset += len;
        }
    }

    async fn read_to_end(mut rx: Box<dyn StreamReceiver>, limit: usize) -> Vec<u8> {
        let mut received = Vec::with_capacity(limit);
        while received.len() < limit {
            match rx.receive().await.unwrap() {
                Some(chunk) => received.extend_from_slice(&chunk),
                None => break,
            }
        }
        received
    }

    #[tokio::test]
    async fn test_relay_symmetric_random_data() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let up = random_payload(&mut rng, MIB + 517);
        let down = random_payload(&mut rng, MIB + 3);

        let (left, relay_a) = ByteStream::pair(64);
        let (relay_b, right) = ByteStream::pair(64);
        let handle = tokio::spawn(relay(relay_a, relay_b, CancellationToken::new()));

        let (mut left_tx, left_rx) = left.split();
        let (mut right_tx, right_rx) = right.split();

        let up_sent = up.clone();
        let left_writer = tokio::spawn(async move {
            send_in_random_chunks(&mut left_tx, &up_sent, 1).await;
            left_tx
        });
        let down_sent = down.clone();
        let right_writer = tokio::spawn(async move {
            send_in_random_chunks(&mut right_tx, &down_sent, 2).await;
            right_tx
        });
        let left_reader = tokio::spawn(read_to_end(left_rx, down.len()));
        let right_reader = tokio::spawn(read_to_end(right_rx, up.len()));

        assert_eq!(right_reader.await.unwrap(), up);
        assert_eq!(left_reader.await.unwrap(), down);

        let mut left_tx = left_writer.await.unwrap();
        let _right_tx = right_writer.await.unwrap();
        left_tx.close().await.unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.a_to_b, up.len() as u64);
        assert_eq!(stats.b_to_a, down.len() as u64);
    }

    #[tokio::test]
    async fn test_half_close_delivers_everything_received() {
        let mut rng = StdRng::seed_from_u64(42);
        let payload = random_payload(&mut rng, 256 * 1024);

        let (left, relay_a) = ByteStream::pair(16);
        let (relay_b, mut right) = ByteStream::pair(16);
        let handle = tokio::spawn(relay(relay_a, relay_b, CancellationToken::new()));

        let (mut left_tx, _left_rx) = left.split();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            send_in_random_chunks(&mut left_tx, &sent, 9).await;
            left_tx.close().await.unwrap();
            left_tx
        });

        let mut received = Vec::new();
        while let Some(chunk) = right.receive().await.unwrap() {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, payload);

        let _left = writer.await.unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.a_to_b, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_cancellation_closes_both_sides() {
        let (mut left, relay_a) = ByteStream::pair(4);
        let (relay_b, mut right) = ByteStream::pair(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relay(relay_a, relay_b, cancel.clone()));

        left.send(Bytes::from_static(b"before")).await.unwrap();
        assert_eq!(right.receive().await.unwrap().unwrap(), "before");

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        assert!(right.receive().await.unwrap().is_none());
        assert!(left.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        struct Failing;

        #[async_trait::async_trait]
        impl StreamReceiver for Failing {
            async fn receive(&mut self) -> Result<Option<Bytes>, StreamError> {
                Err(StreamError::Transport("reset by peer".to_string()))
            }
        }

        let (sink, _unused) = ByteStream::pair(1);
        let (sink_tx, _) = sink.split();
        let broken = ByteStream::new(sink_tx, Box::new(Failing));
        let (relay_b, mut right) = ByteStream::pair(4);

        let result = relay(broken, relay_b, CancellationToken::new()).await;
        assert!(matches!(result, Err(StreamError::Transport(_))));
        assert!(right.receive().await.unwrap().is_none());
    }
}
