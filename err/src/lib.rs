/// Error kinds surfaced by the volume engine. Callers match on the kind and
/// usually display it; only `Io` carries a platform error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unrecognized volume")]
    UnrecognizedVolume,
    #[error("No such file or directory")]
    NoSuchFileOrDirectory,
    #[error("File exists")]
    FileExists,
    #[error("Is a directory")]
    IsADirectory,
    #[error("Directory not empty")]
    DirectoryNotEmpty,
    #[error("No space left on device")]
    NoSpaceOnDevice,
    #[error("Disk corrupt")]
    DiskCorrupt,
    #[error("Not supported")]
    NotSupported,
    #[error("Operation canceled")]
    OperationCanceled,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Read-only volume")]
    ReadOnly,
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
