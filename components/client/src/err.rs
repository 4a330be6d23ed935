use snafu::{Location, Snafu};
use sorafs_proto::status;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("invalid parameters"))]
    Parameters {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("writer is busy, try again"))]
    TryAgain {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("internal fault"))]
    Fault {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("file does not exist"))]
    NoEntry {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("block is read-only"))]
    ReadOnly {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("non-sequential write is not supported"))]
    Seek {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("i/o error"))]
    Io {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("write failed, status: {status}"))]
    Status {
        status: i32,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("writer task is gone"))]
    Gone {
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps a wire status code onto the matching variant; unknown codes keep
    /// their numeric value.
    pub fn from_code(code: i32) -> Error {
        let code = status::normalize(code);
        match code {
            status::PARAMETERS => ParametersSnafu.build(),
            status::TRY_AGAIN => TryAgainSnafu.build(),
            status::FAULT => FaultSnafu.build(),
            status::NO_ENTRY => NoEntrySnafu.build(),
            status::READ_ONLY => ReadOnlySnafu.build(),
            status::SEEK => SeekSnafu.build(),
            status::IO => IoSnafu.build(),
            _ => StatusSnafu { status: code }.build(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Error::Parameters { .. } => status::PARAMETERS,
            Error::TryAgain { .. } => status::TRY_AGAIN,
            Error::Fault { .. } => status::FAULT,
            Error::NoEntry { .. } => status::NO_ENTRY,
            Error::ReadOnly { .. } => status::READ_ONLY,
            Error::Seek { .. } => status::SEEK,
            Error::Io { .. } => status::IO,
            Error::Status { status, .. } => *status,
            Error::Gone { .. } => status::FAULT,
        }
    }

    pub fn to_errno(&self) -> libc::c_int {
        let code = self.code();
        // Anything outside the errno range (e.g. transport codes) maps to a
        // generic i/o failure.
        if code < 0 && -code < 4096 {
            -code
        } else {
            libc::EIO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for code in [
            status::PARAMETERS,
            status::TRY_AGAIN,
            status::FAULT,
            status::NO_ENTRY,
            status::READ_ONLY,
            status::SEEK,
            status::IO,
        ] {
            assert_eq!(Error::from_code(code).code(), code);
        }
        assert_eq!(Error::from_code(-12345).code(), -12345);
        // Positive statuses are folded into the negative convention.
        assert_eq!(Error::from_code(libc::EIO).code(), status::IO);
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::from_code(status::SEEK).to_errno(), libc::ESPIPE);
        assert_eq!(Error::from_code(-99999).to_errno(), libc::EIO);
    }
}
