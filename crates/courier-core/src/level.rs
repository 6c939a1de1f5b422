//! User authorization levels.

use crate::event::UserId;

/// Resolves the authorization level of a user.
///
/// Commands may require a minimum level; the router consults this provider
/// before invoking them.
pub trait UserLevelProvider: Send + Sync + 'static {
    /// Returns the level of `user_id`. Higher is more privileged.
    fn user_level(&self, user_id: UserId) -> u32;
}

/// Gives every user the same level.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformLevel(pub u32);

impl UserLevelProvider for UniformLevel {
    fn user_level(&self, _user_id: UserId) -> u32 {
        self.0
    }
}
