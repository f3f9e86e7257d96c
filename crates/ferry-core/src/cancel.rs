use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Cancellation hook for a long-running server-side call.
///
/// Armed when the call starts and disarmed when its [`Armed`] guard drops.
/// Firing is idempotent and safe from any task; firing while nothing is
/// armed does nothing.
#[derive(Default)]
pub struct CancelTrigger {
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    token: Option<CancellationToken>,
}

impl CancelTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) -> Armed<'_> {
        let token = CancellationToken::new();
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.token = Some(token.clone());
        Armed {
            trigger: self,
            generation: slot.generation,
            token,
        }
    }

    /// Returns whether a call was armed when fired.
    pub fn fire(&self) -> bool {
        match self.slot.lock().token.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().token.is_some()
    }
}

/// Guard for one armed call.
pub struct Armed<'a> {
    trigger: &'a CancelTrigger,
    generation: u64,
    token: CancellationToken,
}

impl Armed<'_> {
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        let mut slot = self.trigger.slot.lock();
        // A newer call may have re-armed the slot in the meantime.
        if slot.generation == self.generation {
            slot.token = None;
        }
    }
}
