use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::TransferError;
use crate::indicator::Indicator;
use crate::transfer::Driver;

/// Longest payload accepted by `write`; anything larger is truncated.
pub const MAX_WRITE_LEN: usize = 128;

/// Build the wire frame for `payload`: one length byte, then the payload
/// truncated to [`MAX_WRITE_LEN`]. Returns the frame and the accepted
/// payload byte count.
pub fn frame_payload(payload: &[u8]) -> Result<(Vec<u8>, usize), TransferError> {
    let accepted = payload.len().min(MAX_WRITE_LEN);
    let mut frame = Vec::new();
    frame
        .try_reserve_exact(accepted + 1)
        .map_err(|_| TransferError::AllocationExhausted)?;
    frame.push(accepted as u8);
    frame.extend_from_slice(&payload[..accepted]);
    Ok((frame, accepted))
}

/// One open handle on the driver, the userspace face of the device node.
/// Tracks its own read cursor so a "read until empty" loop sees the
/// status line once and then stops, instead of toggling the LED forever.
pub struct Session {
    driver: Arc<Driver>,
    indicator: Arc<dyn Indicator>,
    pos: u64,
}

impl Session {
    pub fn open(driver: Arc<Driver>, indicator: Arc<dyn Indicator>) -> Self {
        info!("session opened");
        Session {
            driver,
            indicator,
            pos: 0,
        }
    }

    /// Flip the indicator and report the transition, e.g. `LED_ON,0`
    /// when it was off. Repeating the call without `rewind` returns
    /// nothing and leaves the indicator alone.
    pub fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransferError> {
        if self.pos != 0 {
            return Ok(Vec::new());
        }

        let previous = self.indicator.get_state();
        self.indicator.set_state(!previous);
        let status = format!(
            "LED_{},{}\n",
            if previous { "OFF" } else { "ON" },
            previous as u8
        );
        debug!("read reports {}", status.trim_end());

        let len = status.len().min(max_len);
        let mut out = Vec::new();
        out.try_reserve_exact(len)
            .map_err(|_| TransferError::AllocationExhausted)?;
        out.extend_from_slice(&status.as_bytes()[..len]);
        // The logical read is consumed even if the caller's buffer was
        // shorter than the status line.
        self.pos += status.len() as u64;
        Ok(out)
    }

    /// Reset the read cursor, as a fresh open of the node would.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Frame and transmit `payload`. The return value is the payload
    /// byte count accepted for transmission; a failed exchange is logged
    /// and does not change it.
    pub async fn write(&mut self, payload: &[u8]) -> Result<usize, TransferError> {
        let (frame, accepted) = frame_payload(payload)?;
        if accepted < payload.len() {
            warn!(
                "write truncated from {} to {} bytes",
                payload.len(),
                accepted
            );
        }

        match self.driver.transfer(&frame).await {
            Ok(inbound) => debug!(
                "wrote {} bytes, peripheral answered {:?}",
                accepted,
                &inbound[..inbound.len() - 1]
            ),
            Err(err) => warn!("transfer failed: {}", err),
        }
        Ok(accepted)
    }

    pub fn close(self) {
        info!("session closed");
    }
}
