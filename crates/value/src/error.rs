use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("cannot convert {found} to {wanted}")]
    Conversion { found: &'static str, wanted: &'static str },
    #[error("unknown collation `{0}`")]
    UnknownCollation(String),
}
