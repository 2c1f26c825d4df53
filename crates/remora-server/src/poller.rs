//! Completion polling.
//!
//! Waits for a fixed number of completions on the connection's queue.
//! Arming is one-shot and a completion may land between a drain and the
//! re-arm, so each round drains, arms, and drains again before sleeping
//! on the channel. The whole wait is bounded by a deadline.

use std::time::Duration;

use remora_fabric::{WcStatus, WorkCompletion};
use tokio::time::Instant;

use crate::error::ServerError;
use crate::resources::ConnectionResources;

/// Wait for exactly `expected` successful completions, in retirement
/// order. Any error-status completion or a deadline miss fails the wait.
pub async fn wait_for_completions(
    res: &ConnectionResources,
    expected: usize,
    timeout: Duration,
) -> Result<Vec<WorkCompletion>, ServerError> {
    let deadline = Instant::now() + timeout;
    let mut collected: Vec<WorkCompletion> = Vec::with_capacity(expected);

    loop {
        drain(res, expected, &mut collected)?;
        if collected.len() >= expected {
            return Ok(collected);
        }

        res.cq.req_notify();
        // A completion may have slipped in before the arm took effect.
        drain(res, expected, &mut collected)?;
        if collected.len() >= expected {
            return Ok(collected);
        }

        match tokio::time::timeout_at(deadline, res.channel.wait()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(ServerError::Io(err)),
            Err(_elapsed) => {
                return Err(ServerError::CompletionTimeout {
                    expected,
                    got: collected.len(),
                });
            }
        }
    }
}

fn drain(
    res: &ConnectionResources,
    expected: usize,
    collected: &mut Vec<WorkCompletion>,
) -> Result<(), ServerError> {
    for wc in res.cq.poll(expected - collected.len()) {
        if wc.status != WcStatus::Success {
            return Err(ServerError::CompletionFailed {
                wr_id: wc.wr_id,
                status: wc.status,
            });
        }
        collected.push(wc);
    }
    Ok(())
}
