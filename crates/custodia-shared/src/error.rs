use thiserror::Error;

/// A command line could not be split into arguments.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenizeError {
    #[error("Comilla sin cerrar en la posición {0}")]
    UnterminatedQuote(usize),

    #[error("Línea de comando vacía")]
    Empty,
}

/// A client-supplied file name is not acceptable for the flat store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("El nombre de archivo está vacío")]
    Empty,

    #[error("El nombre de archivo es demasiado largo ({len} > {max})")]
    TooLong { len: usize, max: usize },

    #[error("El nombre de archivo contiene un carácter no permitido: {0:?}")]
    ForbiddenChar(char),

    #[error("Nombre de archivo reservado: {0}")]
    Reserved(String),
}

/// A textual value did not parse into one of the shared enums.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Valor no válido para {kind}: {value}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
