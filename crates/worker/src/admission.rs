//! Multi-slot admission control for superscalar stages.
//!
//! An admission controller holds `width` slots. Each operation claims
//! 1..=width slots before it may enter the stage, and the slots stay held
//! until the stage's handler finishes with the operation. Claims are taken
//! one at a time; a caller cancelled mid-acquisition releases every claim it
//! took in that call, so the held count always returns to its pre-call value.

use std::sync::Mutex;

use ffx_common::metrics::global_metrics;
use ffx_common::{FfxError, Result};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Width-N claim controller for one stage.
pub struct Admission {
    name: &'static str,
    width: usize,
    held: Mutex<usize>,
    changed: Notify,
}

impl Admission {
    /// Build a controller with `width` slots, labeled `name` in metrics.
    pub fn new(name: &'static str, width: usize) -> Self {
        Self {
            name,
            width: width.max(1),
            held: Mutex::new(0),
            changed: Notify::new(),
        }
    }

    /// Configured slot count.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Currently held claims.
    pub fn held(&self) -> usize {
        *self.held.lock().expect("claims lock")
    }

    /// Whether any claims are held.
    pub fn is_claimed(&self) -> bool {
        self.held() > 0
    }

    /// Whether every slot is held.
    pub fn is_full(&self) -> bool {
        self.held() == self.width
    }

    /// Acquire `claims` slots one at a time, waiting for capacity.
    ///
    /// Cancelling `token` mid-acquisition releases every slot this call has
    /// taken and raises `Cancelled`. Requests larger than the width never
    /// complete; they wait until cancelled.
    pub async fn acquire(&self, claims: usize, token: &CancellationToken) -> Result<()> {
        let mut taken = ClaimGuard {
            admission: self,
            acquired: 0,
            armed: true,
        };
        while taken.acquired < claims {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if token.is_cancelled() {
                return Err(FfxError::cancelled());
            }
            if self.try_take_one() {
                taken.acquired += 1;
                continue;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = token.cancelled() => return Err(FfxError::cancelled()),
            }
        }
        taken.armed = false;
        Ok(())
    }

    /// Release `claims` previously acquired slots.
    pub fn release(&self, claims: usize) {
        {
            let mut held = self.held.lock().expect("claims lock");
            *held = held.saturating_sub(claims);
            global_metrics().set_stage_claims(self.name, *held as u64);
        }
        self.changed.notify_waiters();
    }

    /// Wait until every slot is held.
    pub async fn wait_full(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_full() {
                return;
            }
            notified.await;
        }
    }

    fn try_take_one(&self) -> bool {
        let took = {
            let mut held = self.held.lock().expect("claims lock");
            if *held < self.width {
                *held += 1;
                global_metrics().set_stage_claims(self.name, *held as u64);
                true
            } else {
                false
            }
        };
        if took {
            self.changed.notify_waiters();
        }
        took
    }
}

/// Rolls partially acquired claims back unless the acquisition completed.
struct ClaimGuard<'a> {
    admission: &'a Admission,
    acquired: usize,
    armed: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.acquired > 0 {
            self.admission.release(self.acquired);
        }
    }
}
