use core::fmt;

/// Kernel error codes. System calls report them as negative integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Error {
    Unspecified = 1,
    BadEnv = 2,
    Inval = 3,
    NoMem = 4,
    NoSys = 5,
    NoFreeEnv = 6,
    IpcNotRecv = 7,
    /// the environment was terminated by an unrecoverable fault.
    Fault = 15,
}

/// Coarse classification of [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    BadTarget,
    InvalidArgument,
    ResourceExhausted,
    RendezvousMiss,
    Unrecoverable,
}

impl Error {
    pub const fn kind(self) -> ErrorKind {
        match self {
            Error::BadEnv => ErrorKind::BadTarget,
            Error::Inval | Error::NoSys => ErrorKind::InvalidArgument,
            Error::NoMem | Error::NoFreeEnv => ErrorKind::ResourceExhausted,
            Error::IpcNotRecv => ErrorKind::RendezvousMiss,
            Error::Unspecified | Error::Fault => ErrorKind::Unrecoverable,
        }
    }

    /// the negative code placed in `v0`.
    #[inline]
    pub const fn code(self) -> i32 {
        -(self as i32)
    }

    /// decode a negative return code.
    pub fn from_code(code: i32) -> Option<Self> {
        match -code {
            1 => Some(Error::Unspecified),
            2 => Some(Error::BadEnv),
            3 => Some(Error::Inval),
            4 => Some(Error::NoMem),
            5 => Some(Error::NoSys),
            6 => Some(Error::NoFreeEnv),
            7 => Some(Error::IpcNotRecv),
            15 => Some(Error::Fault),
            _ => None,
        }
    }
}

impl From<Error> for i32 {
    fn from(value: Error) -> Self {
        value.code()
    }
}

impl From<Error> for isize {
    fn from(value: Error) -> Self {
        value.code() as isize
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Unspecified => "unspecified error",
            Error::BadEnv => "bad environment",
            Error::Inval => "invalid parameter",
            Error::NoMem => "out of memory",
            Error::NoSys => "no such system call",
            Error::NoFreeEnv => "out of environments",
            Error::IpcNotRecv => "env is not recving",
            Error::Fault => "environment killed by fault",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_decode_back() {
        for e in [Error::BadEnv, Error::Inval, Error::NoMem, Error::NoFreeEnv, Error::IpcNotRecv, Error::Fault] {
            let code: i32 = e.into();
            assert!(code < 0);
            assert_eq!(Error::from_code(code), Some(e));
        }
        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(-99), None);
    }

    #[test]
    fn taxonomy() {
        assert_eq!(Error::BadEnv.kind(), ErrorKind::BadTarget);
        assert_eq!(Error::NoFreeEnv.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(Error::NoMem.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(Error::IpcNotRecv.kind(), ErrorKind::RendezvousMiss);
        assert_eq!(Error::Inval.kind(), ErrorKind::InvalidArgument);
    }
}
