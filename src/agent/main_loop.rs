//! Timed main loop
//!
//! Runs a step repeatedly until the step asks to stop, the step fails or the
//! shutdown handle is raised. Ctrl-C handlers and remote `shutdown`/`restart`
//! commands both raise that handle. With a non-zero period each iteration
//! starts at most once per period; a zero period runs iterations back to back.

use super::Agent;
use crate::agent::lifecycle::Operation;
use crate::error::AgentResult;
use crate::transport::Transport;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// What the loop does after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Break,
}

/// Future of one loop step, borrowing the agent while it runs
pub type LoopStep<'a> = Pin<Box<dyn Future<Output = AgentResult<LoopControl>> + 'a>>;

impl<T: Transport> Agent<T> {
    /// Run `step` every `time_step` milliseconds until stopped
    ///
    /// Returns the number of completed iterations.
    pub async fn run_loop<F>(&mut self, step: F) -> AgentResult<u64>
    where
        F: for<'a> FnMut(&'a mut Agent<T>) -> LoopStep<'a>,
    {
        let period = self.time_step();
        self.run_loop_every(period, step).await
    }

    /// Run `step` once per `period` until stopped
    ///
    /// A step error ends the loop and is returned as is.
    pub async fn run_loop_every<F>(&mut self, period: Duration, mut step: F) -> AgentResult<u64>
    where
        F: for<'a> FnMut(&'a mut Agent<T>) -> LoopStep<'a>,
    {
        let result = self.state.require(Operation::RunLoop);
        self.track(result)?;

        let shutdown = self.shutdown.clone();
        let mut ticker = (!period.is_zero()).then(|| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        info!(
            agent = %self.name,
            period_ms = period.as_millis() as u64,
            "Entering main loop"
        );

        let mut iterations = 0u64;
        while !shutdown.is_triggered() {
            match ticker.as_mut() {
                Some(ticker) => {
                    tokio::select! {
                        _ = shutdown.triggered() => break,
                        _ = ticker.tick() => {}
                    }
                }
                None => tokio::task::yield_now().await,
            }

            let control = step(self).await?;
            iterations += 1;
            if control == LoopControl::Break {
                break;
            }
        }

        info!(agent = %self.name, iterations, "Main loop stopped");
        Ok(iterations)
    }
}
