use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use ndarray::ShapeError;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    LabelOutOfRange {
        label: usize,
        classes: usize,
    },
    UnknownSegment(String),
    Shape(ShapeError),
    Dataset {
        line: usize,
        reason: String,
    },
    Io(io::Error),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::LabelOutOfRange { label, classes } => write!(
                f,
                "Label {label} is out of range for a model with {classes} classes"
            ),
            MlErr::UnknownSegment(name) => {
                write!(f, "The parameter layout has no segment named {name}")
            }
            MlErr::Shape(e) => write!(f, "Invalid tensor shape: {e}"),
            MlErr::Dataset { line, reason } => {
                write!(f, "Malformed dataset at line {line}: {reason}")
            }
            MlErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            MlErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<io::Error> for MlErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
