use crate::controllers::ControllerError;
use crate::models::UserId;

/// Source of the identity that scopes category and task access.
pub trait UserStore: Send + Sync {
    fn current_user_id(&self) -> Result<UserId, ControllerError>;
}

/// Identity resolved once at startup, e.g. from `--user` or `default-user`.
#[derive(Debug, Clone, Default)]
pub struct StaticUser(Option<UserId>);

impl StaticUser {
    pub fn new(user: Option<String>) -> Self {
        Self(user.filter(|u| !u.trim().is_empty()))
    }
}

impl UserStore for StaticUser {
    fn current_user_id(&self) -> Result<UserId, ControllerError> {
        self.0.clone().ok_or(ControllerError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_user() {
        assert_eq!(
            StaticUser::new(Some("u1".to_string())).current_user_id().unwrap(),
            "u1"
        );
        assert!(matches!(
            StaticUser::new(Some(" ".to_string())).current_user_id(),
            Err(ControllerError::Unauthenticated)
        ));
        assert!(StaticUser::default().current_user_id().is_err());
    }
}
