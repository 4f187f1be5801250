#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Not enough free sectors for the request. Requests that would push an
    /// inode past [`MAX_LENGTH`](crate::MAX_LENGTH) surface the same way.
    #[error("out of disk space")]
    OutOfSpace,
    /// Directory metadata operation on a non-directory inode.
    #[error("not a directory")]
    NotADirectory,
}
