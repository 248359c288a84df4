// ===== Types and Structures =====

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    InvalidObject,
    InvalidParameter,
    NotSupported,
    NoDevice,
    DeviceBusy,
    SwitchFailure,
    Timeout,
    AllocationFailure,
    IoError,
    DecodeInvalid,
    // Reported by the bus controller for a single command
    CmdTimeout,
    CmdCrc,
    DataTimeout,
    DataCrc,
    CardError(u32), // R1 status word with error bits set
}

impl SdError {
    /// Errors raised by the bus controller while executing one command.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SdError::CmdTimeout
                | SdError::CmdCrc
                | SdError::DataTimeout
                | SdError::DataCrc
                | SdError::CardError(_)
                | SdError::IoError
        )
    }
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdError::InvalidObject => write!(f, "Invalid or unallocated object"),
            SdError::InvalidParameter => write!(f, "Invalid parameter"),
            SdError::NotSupported => write!(f, "Operation not supported"),
            SdError::NoDevice => write!(f, "No device present"),
            SdError::DeviceBusy => write!(f, "Device or controller busy"),
            SdError::SwitchFailure => write!(f, "Device rejected mode switch"),
            SdError::Timeout => write!(f, "Timed out waiting for device"),
            SdError::AllocationFailure => write!(f, "Allocation failure"),
            SdError::IoError => write!(f, "I/O error"),
            SdError::DecodeInvalid => write!(f, "Unexpected register structure"),
            SdError::CmdTimeout => write!(f, "Command timeout error"),
            SdError::CmdCrc => write!(f, "Command CRC error"),
            SdError::DataTimeout => write!(f, "Data timeout error"),
            SdError::DataCrc => write!(f, "Data CRC error"),
            SdError::CardError(status) => write!(f, "Card error: status 0x{:X}", status),
        }
    }
}

impl std::error::Error for SdError {}
