use tracing::{trace, warn};

use crate::channel::{DatagramChannel, Readiness, Received};
use crate::config::ProbeConfig;
use crate::hex;

/// Counts from one probe run. `attempted` is the number of datagrams the
///  caller asked for, `expected` the number actually handed to the kernel,
///  `confirmed` the number of byte-identical echoes that came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeOutcome {
    pub attempted: u64,
    pub expected: u64,
    pub confirmed: u64,
}

impl ProbeOutcome {
    /// Loss is measured against what the caller attempted: a datagram that
    ///  could not even be sent is as lost as one that was never echoed.
    pub fn loss(&self) -> u64 {
        self.attempted - self.confirmed
    }

    pub fn merge(&mut self, other: ProbeOutcome) {
        self.attempted += other.attempted;
        self.expected += other.expected;
        self.confirmed += other.confirmed;
    }
}

/// Send `count` copies of `payload` and wait for an equal number of
///  confirming echoes.
///
/// Every anomaly - send failure, timeout, corrupt reply - is logged and
///  folded into the outcome; this function never fails.
///
/// Each confirmation-loop iteration re-arms the same fixed
///  `config.reply_timeout` rather than keeping an overall deadline, so the
///  total wait can exceed the nominal bound when replies arrive just under
///  the wire. See ProbeConfig::reply_timeout.
pub async fn probe(
    channel: &DatagramChannel,
    payload: &[u8],
    count: u32,
    config: &ProbeConfig,
) -> ProbeOutcome {
    let mut expected = 0u64;
    for _ in 0..count {
        match channel.send(payload).await {
            Ok(n) if n == payload.len() => expected += 1,
            Ok(n) => warn!("short write: {} of {} octets", n, payload.len()),
            Err(e) => warn!("send failed: {}", e),
        }
    }
    trace!("sent {} of {} datagrams", expected, count);

    let mut confirmed = 0u64;
    let mut outstanding = expected;
    while outstanding > 0 {
        match channel.readiness(Some(config.reply_timeout)).await {
            Ok(Readiness::TimedOut) => break,
            Ok(Readiness::Readable) => match channel.try_recv(config.max_reply_len) {
                Ok(Some(reply)) => {
                    outstanding -= 1;
                    if confirms(payload, &reply) {
                        confirmed += 1;
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!("recv failed: {}", e);
                    break;
                }
            },
            Err(e) => {
                warn!("wait for replies failed: {}", e);
                break;
            }
        }
    }

    ProbeOutcome {
        attempted: count as u64,
        expected,
        confirmed,
    }
}

/// Like [probe], but chunks large repeat counts into
///  `config.batch_size`-sized batches and sums the outcomes, bounding the
///  number of replies in flight at any time.
pub async fn probe_batched(
    channel: &DatagramChannel,
    payload: &[u8],
    total: u32,
    config: &ProbeConfig,
) -> ProbeOutcome {
    // a zero batch size would never make progress; treat it as 1 rather
    // than hang, matching the never-fails contract of probe()
    let batch_size = config.batch_size.max(1);

    let mut acc = ProbeOutcome::default();
    let mut remaining = total;
    while remaining > 0 {
        let batch = remaining.min(batch_size);
        acc.merge(probe(channel, payload, batch, config).await);
        remaining -= batch;
    }
    acc
}

/// A reply confirms its probe iff it arrived whole and matches
///  byte-for-byte. Anything else arrived but is wrong, which is worth a log
///  line but counts as unconfirmed.
fn confirms(payload: &[u8], reply: &Received) -> bool {
    if reply.truncated {
        warn!("reply from {:?} was truncated", reply.from);
        return false;
    }
    if reply.payload.len() != payload.len() {
        warn!(
            "sent {} octets but got {}",
            payload.len(),
            reply.payload.len()
        );
        return false;
    }
    if reply.payload.as_ref() != payload {
        warn!("rx data differs: {}", hex::encode(&reply.payload, 48).0);
        return false;
    }
    true
}
