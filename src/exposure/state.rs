//! Observable controller state

use serde::Serialize;
use tokio::sync::watch;

/// What a controller reports to the outside
///
/// Readers always get a whole snapshot, so `active` and `public_address`
/// never come from different updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExposureState {
    /// The method is currently exposing the service
    pub active: bool,
    /// `host:port` reachable from the internet
    pub public_address: Option<String>,
    /// Most recent failure
    pub last_error: Option<String>,
}

/// Single-writer, many-reader value
///
/// Writes happen on the owning controller's worker; reads are lock-free
/// clones from any thread.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> SnapshotCell<T> {
    /// Create with an initial value
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current value
    pub fn snapshot(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Modify in place and notify subscribers
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Replace the value
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Watch for changes
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl SnapshotCell<ExposureState> {
    /// Record a failure and deactivate
    pub fn fail(&self, error: impl ToString) {
        let message = error.to_string();
        self.update(|state| {
            state.active = false;
            state.public_address = None;
            state.last_error = Some(message);
        });
    }

    /// Mark active at `public_address`, clearing the last error
    pub fn activate(&self, public_address: Option<String>) {
        self.update(|state| {
            state.active = true;
            state.public_address = public_address;
            state.last_error = None;
        });
    }

    /// Mark inactive, keeping the last error
    pub fn deactivate(&self) {
        self.update(|state| {
            state.active = false;
            state.public_address = None;
        });
    }
}
