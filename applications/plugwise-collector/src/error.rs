use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },
    #[error("XML error: {0}")]
    Xml(#[from] serde_xml_rs::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("home location {0} not found in domain objects")]
    MissingLocation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("DB error: {0}")]
    Db(#[from] sqlx::Error),
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Http(e.to_string())
    }
}
