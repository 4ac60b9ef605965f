#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SysError {
    /// Device or resource is busy
    Busy = 1,
    /// Cannot allocate memory
    NoMem = 2,
    /// Invalid argument
    Invalid = 3,
    /// Bytecode image was rejected by the VM loader
    BadImage = 4,
    /// No task matches the given handle
    NoTask = 5,
}

pub type SysResult<T> = Result<T, SysError>;
