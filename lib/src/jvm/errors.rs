use super::class_file::{Constant, ConstantIndex, ConstantPoolOverflow};
use super::code::SynLabel;
use crate::util::Offset;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),

    /// Class file is structurally invalid
    MalformedClassFile(String),

    ConstantPoolOverflow {
        constant: Constant,
        offset: usize,
    },
    MissingConstant(ConstantIndex),
    UnexpectedConstant {
        index: ConstantIndex,
        expected: &'static str,
    },
    BadName(String),
    BadDescriptor(String),

    /// Opcode that doesn't exist
    InvalidOpcode {
        opcode: u8,
        offset: usize,
    },

    /// Opcode that exists but that code rewriting doesn't handle (`jsr`, `ret`)
    UnsupportedOpcode {
        opcode: u8,
        offset: usize,
    },

    /// Branch, exception handler, or debug table points somewhere that isn't an instruction
    InvalidCodeOffset(usize),

    /// A label is used but never placed
    UnplacedLabel(SynLabel),

    MethodCodeMaxStackOverflow(usize),
    MethodCodeMaxLocalsOverflow(usize),
    MethodCodeOverflow(Offset),

    /// Error trying to verify
    VerifierError {
        node: usize,
        instruction: String,
        kind: VerifierErrorKind,
    },
}

#[derive(Debug)]
pub enum VerifierErrorKind {
    EmptyStack,
    InvalidWidth(usize),
    NotArrayType,
    InvalidIndex,
    InvalidType,
    MissingConstant(ConstantIndex),
    NotLoadableConstant(Constant),
    IncompatibleTypes(String, String),
    StackHeightMismatch(usize, usize),
    BadDescriptor(String),
    BadConstant(String),

    /// Control reaches the end of the code
    FallsOffEnd,

    /// Returns while `this` is still uninitialized
    UninitializedThis,
}

impl From<ConstantPoolOverflow> for Error {
    fn from(overflow: ConstantPoolOverflow) -> Error {
        Error::ConstantPoolOverflow {
            constant: overflow.constant,
            offset: overflow.offset,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}
