//! Hook into the host application's navigation.

/// The screen the user signs in on.
pub trait LoginSurface: Send + Sync {
    /// True when the login screen is already showing.
    fn is_active(&self) -> bool;

    fn redirect_to_login(&self);
}

/// For hosts without navigation (CLIs, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLoginSurface;

impl LoginSurface for NoopLoginSurface {
    fn is_active(&self) -> bool {
        false
    }

    fn redirect_to_login(&self) {
        log::debug!("[Auth] Login required");
    }
}
