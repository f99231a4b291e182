use crate::errors::VMError;
use tokio::sync::watch;

/// One-shot completion carrying a terminal result
///
/// The first [Completion::signal()] wins and later ones are ignored. Any
/// number of tasks may [Completion::wait()], before or after the signal,
/// and all of them observe the same result.
#[derive(Debug)]
pub struct Completion {
    state: watch::Sender<Option<Result<(), VMError>>>,
}

impl Default for Completion {
    fn default() -> Self {
        let (state, _) = watch::channel(None);
        Completion { state }
    }
}

impl Completion {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record the terminal result. Returns false if one was already recorded.
    pub fn signal(&self, result: Result<(), VMError>) -> bool {
        self.state.send_if_modified(move |slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        })
    }

    /// The recorded result, if the signal has fired
    pub fn peek(&self) -> Option<Result<(), VMError>> {
        self.state.borrow().clone()
    }

    pub fn is_signalled(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Park until the signal fires, then return the recorded result
    pub async fn wait(&self) -> Result<(), VMError> {
        let mut receiver = self.state.subscribe();
        let result = match receiver.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        result.unwrap_or(Err(VMError::SignalDropped))
    }
}
