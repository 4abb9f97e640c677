//! User presence notifications.

/// Receives user presence changes as the session sees them.
pub trait UserObserver {
    fn on_user_detected(&mut self, id: u16);
    fn on_user_lost(&mut self, id: u16);
}

/// Logs presence changes at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl UserObserver for LogObserver {
    fn on_user_detected(&mut self, id: u16) {
        tracing::info!(user = id, "new user");
    }

    fn on_user_lost(&mut self, id: u16) {
        tracing::info!(user = id, "lost user");
    }
}

/// Ignores presence changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl UserObserver for NoopObserver {
    fn on_user_detected(&mut self, _id: u16) {}
    fn on_user_lost(&mut self, _id: u16) {}
}
