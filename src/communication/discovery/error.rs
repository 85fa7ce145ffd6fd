use bytes::Buf;
use num_traits::FromPrimitive;

use crate::util::BufExt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("the remote device returned an error: {0:?}")]
    Remote(ErrorCode),

    #[error("the packet was malformed")]
    PacketMalformed,

    #[error("the response is already complete")]
    NotReady,

    #[error("the response is too large to be reassembled")]
    NotSupported,

    #[error("invalid parameters")]
    InvalidParameters,

    #[error("the transaction timed out")]
    TimedOut,

    #[error("the channel was disconnected")]
    LinkDisconnected,

    #[error("the transaction was canceled")]
    Canceled,

    #[error("no transaction identifiers are available")]
    TransactionIdsExhausted,

    #[error("the operation failed")]
    Failed,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum ErrorCode {
    Reserved = 0x0000,
    UnsupportedSdpVersion,
    InvalidServiceRecordHandle,
    InvalidRequestSyntax,
    InvalidPduSize,
    InvalidContinuationState,
    InsufficientResources,
}

impl ErrorCode {
    pub fn from_buf<B: Buf>(buf: &mut B) -> Option<Self> {
        FromPrimitive::from_u16(buf.get_u16_checked()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn error_code_from_buf() {
        let mut buf = &[0x00u8, 0x05][..];
        assert_eq!(
            ErrorCode::from_buf(&mut buf),
            Some(ErrorCode::InvalidContinuationState)
        );

        let mut buf = &[0x00u8, 0x07][..];
        assert_eq!(ErrorCode::from_buf(&mut buf), None);

        let mut buf = &[0x00u8][..];
        assert_eq!(ErrorCode::from_buf(&mut buf), None);
    }
}
