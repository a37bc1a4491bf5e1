/// What happens when a subscribed callback panics during delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallbackPanics {
    /// Unwind into the thread delivering the callback. Callbacks not yet
    /// popped stay queued and may never run.
    #[default]
    Propagate,
    /// Catch the panic, log it and keep delivering.
    Isolate,
}

/// Per-promise settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    pub callback_panics: CallbackPanics,
}

impl Options {
    pub fn with_callback_panics(mut self, policy: CallbackPanics) -> Self {
        self.callback_panics = policy;
        self
    }
}
