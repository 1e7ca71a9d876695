use std::fmt;

#[derive(Debug)]
pub enum StoreError {
    IOError(String),
    SQLError(String),
    SQLPoolError(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::IOError(e) => write!(f, "io error: {}", e),
            StoreError::SQLError(e) => write!(f, "sql error: {}", e),
            StoreError::SQLPoolError(e) => write!(f, "sql pool error: {}", e),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IOError(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::SQLError(e.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::SQLPoolError(e.to_string())
    }
}
