// Service layer errors.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid service configuration: {0}")]
    ConfigValidation(String),
    #[error("{0} is required")]
    ArgRequired(&'static str),
    #[error("cannot respond: request has no reply subject")]
    Respond,
    #[error("failed to marshal response: {0}")]
    MarshalResponse(String),
    #[error(transparent)]
    Client(#[from] lariat_client::Error),
}
