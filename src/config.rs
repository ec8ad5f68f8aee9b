use std::time::Duration;

use anyhow::bail;

/// The protocol-standard block size, used whenever no other size was negotiated.
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Bounds for a negotiable block size (RFC 2348).
pub const MIN_BLOCK_SIZE: u16 = 8;
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Tuning knobs for a single transfer, validated at session start.
///
/// The retry / timeout values are deliberately configuration rather than constants baked
///  into the state machine: deployments on lossy links want a different budget than
///  loopback tests.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// The payload size per Data command.
    ///
    /// A client with a non-standard value asks the server for it via option negotiation
    ///  and falls back to the standard 512 if the server does not answer with an
    ///  Option-Acknowledgment. For a server this is the upper bound granted to
    ///  requesting clients.
    pub block_size: u16,

    /// How long to wait for the peer's answer before retransmitting the last
    ///  unacknowledged command.
    pub retry_timeout: Duration,

    /// How many retransmissions of the same command to attempt before the transfer
    ///  fails as timed out.
    pub max_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            retry_timeout: Duration::from_secs(2),
            max_retries: 5,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || self.block_size > MAX_BLOCK_SIZE {
            bail!("block size {} is outside the negotiable range {}..={}",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
        }
        if self.retry_timeout.is_zero() {
            bail!("retry timeout must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::standard(512, 2000, true)]
    #[case::min(8, 1, true)]
    #[case::max(65464, 2000, true)]
    #[case::too_small(7, 2000, false)]
    #[case::too_big(65465, 2000, false)]
    #[case::zero_timeout(512, 0, false)]
    fn test_validate(#[case] block_size: u16, #[case] timeout_millis: u64, #[case] expected_ok: bool) {
        let config = TransferConfig {
            block_size,
            retry_timeout: Duration::from_millis(timeout_millis),
            max_retries: 5,
        };
        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}
