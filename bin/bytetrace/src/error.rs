use crate::probes::ProbeFileError;
use bytetrace::{instrument, jvm};
use std::io;

/// Ways running the tool can go wrong
#[derive(Debug)]
pub enum CliError {
    Io(io::Error),
    Probes(ProbeFileError),
    Instrument(instrument::Error),
    Jvm(jvm::Error),
}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> CliError {
        CliError::Io(err)
    }
}

impl From<ProbeFileError> for CliError {
    fn from(err: ProbeFileError) -> CliError {
        CliError::Probes(err)
    }
}

impl From<instrument::Error> for CliError {
    fn from(err: instrument::Error) -> CliError {
        CliError::Instrument(err)
    }
}

impl From<jvm::Error> for CliError {
    fn from(err: jvm::Error) -> CliError {
        CliError::Jvm(err)
    }
}
