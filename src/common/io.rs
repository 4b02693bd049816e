//! Small I/O helpers shared by the server and client paths.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::common::num;
use crate::error::Error;

/// Sends a whole buffer with an offset cursor; no byte shifting, and the
/// offset advances through checked arithmetic.
pub(crate) async fn write_all_offset<I>(io: &mut I, bytes: &[u8]) -> crate::Result<()>
where
    I: AsyncWrite + Unpin,
{
    let mut offset = 0usize;
    while offset < bytes.len() {
        let n = io
            .write(&bytes[offset..])
            .await
            .map_err(Error::new_io)?;
        if n == 0 {
            return Err(Error::new_io(std::io::ErrorKind::WriteZero.into()));
        }
        num::add_assign(&mut offset, n)?;
    }
    io.flush().await.map_err(Error::new_io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_everything() {
        let mut sink = Vec::new();
        write_all_offset(&mut sink, b"hello world").await.unwrap();
        assert_eq!(sink, b"hello world");
    }
}
