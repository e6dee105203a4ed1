use thiserror::Error;

pub type Result<T> = std::result::Result<T, HandelError>;

/// Status codes returned by every operation.
///
/// The numeric values are stable so that callers which only see the raw
/// status (for example a control system record) can map them back with
/// `ErrorKind::from`.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ErrorKind {
    // file and codec
    OpenFile = 1,
    BadFileRead = 2,
    NoSection = 3,
    FormatError = 4,
    IllegalOperation = 5,
    FileRa = 6,
    SetPos = 7,
    BadFileWrite = 8,
    FileType = 9,
    Encode = 10,
    Decode = 11,
    Eof = 12,
    End = 13,
    // input
    NullAlias = 201,
    NullName = 202,
    NullValue = 203,
    BadName = 204,
    BadValue = 205,
    AliasSize = 206,
    BadIndex = 207,
    // state
    AliasExists = 301,
    NoAlias = 302,
    NeedsBoardType = 303,
    NoModify = 304,
    NoRemove = 305,
    // lookup
    UnknownItem = 321,
    UnknownBoard = 322,
    BadChannel = 323,
    InvalidDetChan = 324,
    MissingInterface = 325,
    WrongInterface = 326,
    BadInterface = 327,
    MissingType = 328,
    MissingPol = 329,
    MissingGain = 330,
    MissingFirm = 331,
    NoFilename = 332,
    NoTmpPath = 333,
    // firmware
    BadPtrr = 351,
    PtrOverlap = 352,
    FirmBoth = 353,
    LookingPtrr = 354,
    // runtime
    NoMem = 401,
    NoModule = 402,
    NoDetChans = 403,
    InfiniteLoop = 404,
    BadType = 405,
    WrongType = 406,
    NoInterface = 407,
    Unknown = 501,
}

impl From<i32> for ErrorKind {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::OpenFile,
            2 => Self::BadFileRead,
            3 => Self::NoSection,
            4 => Self::FormatError,
            5 => Self::IllegalOperation,
            6 => Self::FileRa,
            7 => Self::SetPos,
            8 => Self::BadFileWrite,
            9 => Self::FileType,
            10 => Self::Encode,
            11 => Self::Decode,
            12 => Self::Eof,
            13 => Self::End,
            201 => Self::NullAlias,
            202 => Self::NullName,
            203 => Self::NullValue,
            204 => Self::BadName,
            205 => Self::BadValue,
            206 => Self::AliasSize,
            207 => Self::BadIndex,
            301 => Self::AliasExists,
            302 => Self::NoAlias,
            303 => Self::NeedsBoardType,
            304 => Self::NoModify,
            305 => Self::NoRemove,
            321 => Self::UnknownItem,
            322 => Self::UnknownBoard,
            323 => Self::BadChannel,
            324 => Self::InvalidDetChan,
            325 => Self::MissingInterface,
            326 => Self::WrongInterface,
            327 => Self::BadInterface,
            328 => Self::MissingType,
            329 => Self::MissingPol,
            330 => Self::MissingGain,
            331 => Self::MissingFirm,
            332 => Self::NoFilename,
            333 => Self::NoTmpPath,
            351 => Self::BadPtrr,
            352 => Self::PtrOverlap,
            353 => Self::FirmBoth,
            354 => Self::LookingPtrr,
            401 => Self::NoMem,
            402 => Self::NoModule,
            403 => Self::NoDetChans,
            404 => Self::InfiniteLoop,
            405 => Self::BadType,
            406 => Self::WrongType,
            407 => Self::NoInterface,
            _ => Self::Unknown,
        }
    }
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct HandelError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandelError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.kind.code()
    }

    /// Prefix the message with the caller's context, keeping the kind.
    pub fn context(mut self, context: impl std::fmt::Display) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }
}

impl From<std::io::Error> for HandelError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                ErrorKind::OpenFile
            }
            std::io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
            _ => ErrorKind::BadFileRead,
        };
        Self::new(kind, err.to_string())
    }
}

/// Shorthand for `Err(HandelError::new(kind, format!(...)))`.
macro_rules! bail {
    ($kind:ident, $($arg:tt)*) => {
        return Err($crate::HandelError::new(
            $crate::ErrorKind::$kind,
            format!($($arg)*),
        ))
    };
}

/// Build a `HandelError` of the given kind from a format string.
macro_rules! err {
    ($kind:ident, $($arg:tt)*) => {
        $crate::HandelError::new($crate::ErrorKind::$kind, format!($($arg)*))
    };
}
