use std::time::Duration;
use anyhow::bail;

/// Tuning knobs for the loss-measuring prober.
pub struct ProbeConfig {
    /// How long each confirmation-loop iteration waits for a reply. The
    ///  timeout is re-armed per iteration, so a batch can wait longer than
    ///  this in total when replies trickle in just under the bound.
    pub reply_timeout: Duration,

    /// Large repeat counts are chunked into batches of this size; loss is
    ///  summed across batches. Bounds in-flight state and gives periodic
    ///  progress, with no effect on the measured loss itself.
    pub batch_size: u32,

    /// Receive limit for replies. A reply larger than this counts as
    ///  corrupt, not confirmed.
    pub max_reply_len: usize,
}

impl Default for ProbeConfig {
    fn default() -> ProbeConfig {
        ProbeConfig {
            reply_timeout: Duration::from_millis(500),
            batch_size: 100,
            max_reply_len: 9000,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            bail!("probe batch size must be non-zero");
        }
        if self.max_reply_len == 0 {
            bail!("max reply length must be non-zero");
        }
        Ok(())
    }
}

/// Tuning knobs for the reflector.
pub struct ReflectorConfig {
    /// Receive limit per datagram. Anything larger is counted as errored
    ///  and not reflected.
    pub max_datagram: usize,

    /// Upper bound on datagrams gathered per pass by the batching drain
    ///  strategy. Irrelevant to the single-receive strategy.
    pub batch_size: usize,
}

impl Default for ReflectorConfig {
    fn default() -> ReflectorConfig {
        ReflectorConfig {
            max_datagram: 9000,
            batch_size: 16,
        }
    }
}

impl ReflectorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram == 0 {
            bail!("max datagram size must be non-zero");
        }
        if self.batch_size == 0 {
            bail!("drain batch size must be non-zero");
        }
        Ok(())
    }
}
