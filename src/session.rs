use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{info, warn};

use crate::channel::DatagramChannel;
use crate::config::ProbeConfig;
use crate::hex;
use crate::probe::{probe_batched, ProbeOutcome};

/// Accumulated result of one line-oriented probing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSummary {
    pub lines: u64,
    pub parse_errors: u64,
    pub attempted: u64,
    pub expected: u64,
    pub confirmed: u64,
}

impl SessionSummary {
    pub fn loss(&self) -> u64 {
        self.attempted - self.confirmed
    }

    /// The uniform exit-code mapping of the probing tools: 0 only when
    ///  nothing was lost.
    pub fn exit_code(&self) -> i32 {
        if self.loss() == 0 {
            0
        } else {
            1
        }
    }

    fn merge(&mut self, outcome: ProbeOutcome) {
        self.attempted += outcome.attempted;
        self.expected += outcome.expected;
        self.confirmed += outcome.confirmed;
    }
}

/// Read hex lines until EOF and probe each decoded datagram `repeat` times
///  through `channel`.
///
/// A line that fails to decode is logged with its 1-based line number and
///  skipped; it contributes nothing to the totals beyond the error count.
/// Per-line loss is logged the same way. Only reader I/O errors fail the
///  session.
pub async fn run<R>(
    reader: R,
    channel: &DatagramChannel,
    repeat: u32,
    config: &ProbeConfig,
) -> anyhow::Result<SessionSummary>
where
    R: AsyncBufRead + Unpin,
{
    config.validate()?;

    let mut summary = SessionSummary::default();
    let mut lines: Lines<R> = reader.lines();

    while let Some(line) = lines.next_line().await? {
        summary.lines += 1;
        let lineno = summary.lines;

        let payload = match hex::decode_line(&line, lineno) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{}", e);
                summary.parse_errors += 1;
                continue;
            }
        };

        let outcome = probe_batched(channel, &payload, repeat, config).await;
        if outcome.loss() > 0 {
            warn!("line {}: {} packets lost", lineno, outcome.loss());
        }
        summary.merge(outcome);
    }

    info!(
        "session done: {} line(s), {} attempted, {} confirmed, {} lost",
        summary.lines,
        summary.attempted,
        summary.confirmed,
        summary.loss()
    );
    Ok(summary)
}
