use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("Required input missing: {0}")]
    MissingInput(String),

    #[error("Movement source '{source_name}' is missing required columns: {}", fields.join(", "))]
    MissingColumns {
        source_name: String,
        fields: Vec<String>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReconciliationError>;
