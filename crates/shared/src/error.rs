use thiserror::Error;

/// Rejected user input for group and profile actions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("a group needs at least one member id")]
    NoMembers,
    #[error("profile name must not be blank")]
    BlankProfileName,
}
