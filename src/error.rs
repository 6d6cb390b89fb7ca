use std::num::{ParseFloatError, ParseIntError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("parser error: {0}")]
    Parser(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("parse float error: {0}")]
    ParseFloat(#[from] ParseFloatError),
}

pub type Result<T> = std::result::Result<T, TsError>;
