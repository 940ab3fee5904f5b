//! Most recent location fix.

use tokio::sync::watch;

use airtrack_types::LocationFix;

/// Source of location fixes.
pub trait LocationProvider: Send + Sync {
    /// The most recent fix, if any.
    fn current_fix(&self) -> Option<LocationFix>;

    /// Stream of fix updates.
    fn subscribe(&self) -> watch::Receiver<Option<LocationFix>>;
}

/// Location provider holding only the latest fix.
///
/// Producers (the gpsd client, tests) call [`LocationFeed::update`].
#[derive(Debug)]
pub struct LocationFeed {
    latest: watch::Sender<Option<LocationFix>>,
}

impl LocationFeed {
    /// Create an empty feed.
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self { latest }
    }

    /// Publish a new fix.
    pub fn update(&self, fix: LocationFix) {
        self.latest.send_replace(Some(fix));
    }

    /// Forget the current fix.
    pub fn clear(&self) {
        self.latest.send_if_modified(|fix| fix.take().is_some());
    }
}

impl Default for LocationFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationProvider for LocationFeed {
    fn current_fix(&self) -> Option<LocationFix> {
        self.latest.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<LocationFix>> {
        self.latest.subscribe()
    }
}
