use std::io;

/// Converts a C return value to an `io::Result`.
///
/// Verbs post operations return the errno directly rather than setting
/// `errno`, hence `from_raw_os_error` on the return value.
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

/// The current `errno` as an `io::Error`, for calls that return pointers.
pub(crate) fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}
