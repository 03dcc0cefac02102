//! AHCI Port Error Types
//!
//! Hardware-protocol conditions the port reports back to its callers.
//! Programmer errors (two requests in flight, slot bookkeeping) are not
//! represented here; those are assertions in the port code.

use core::fmt;

/// AHCI port error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhciError {
    /// Firmware left the port's interface disabled; the port is never touched
    FirmwareDisabled,

    /// The link never reached "device present, phy enabled" within the retry budget
    LinkNotReady,

    /// Page allocation for the command list, FIS area or DMA pool failed
    ResourceExhaustion,

    /// SATA error register was non-zero after a command (raw SError value)
    CommandError(u32),

    /// Task file error reported by the device (status byte)
    TaskFileError(u8),

    /// Interface fatal error; the port has been shut down
    FatalInterfaceError,

    /// Copying to or from the caller's buffer failed
    MemoryFault,

    /// Device did not drop BSY/DRQ before command issue
    DeviceNotReady,

    /// Hardware did not finish within the configured budget
    Timeout,

    /// Every command slot has its issue bit set
    NoAvailableSlots,

    /// Request outside the device range or the transfer limits
    InvalidParameters,

    /// Device type is detected but not driven by this port (ATAPI)
    UnsupportedDevice,

    /// The port is not operable or has no identified device
    NoDevice,

    /// Buffer size mismatch between the request and the scatter list
    BufferError,
}

impl AhciError {
    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AhciError::FatalInterfaceError => ErrorSeverity::Critical,
            AhciError::ResourceExhaustion => ErrorSeverity::Critical,
            AhciError::CommandError(_) => ErrorSeverity::Error,
            AhciError::TaskFileError(_) => ErrorSeverity::Error,
            AhciError::Timeout => ErrorSeverity::Error,
            AhciError::LinkNotReady => ErrorSeverity::Warning,
            AhciError::FirmwareDisabled => ErrorSeverity::Info,
            AhciError::UnsupportedDevice => ErrorSeverity::Info,
            _ => ErrorSeverity::Warning,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Port cannot continue
    Critical,
    /// Command failed, device may be unusable
    Error,
    /// Operation failed but the port can continue
    Warning,
    /// Informational, expected condition
    Info,
}

impl ErrorSeverity {
    /// Log level the port reports an error of this severity at
    pub fn level(&self) -> log::Level {
        match self {
            ErrorSeverity::Critical | ErrorSeverity::Error => log::Level::Error,
            ErrorSeverity::Warning => log::Level::Warn,
            ErrorSeverity::Info => log::Level::Info,
        }
    }
}

impl fmt::Display for AhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AhciError::FirmwareDisabled =>
                write!(f, "Port interface disabled by firmware"),
            AhciError::LinkNotReady =>
                write!(f, "SATA link did not come up"),
            AhciError::ResourceExhaustion =>
                write!(f, "Failed to allocate port DMA memory"),
            AhciError::CommandError(serr) =>
                write!(f, "Command failed, SError 0x{:08X}", serr),
            AhciError::TaskFileError(status) =>
                write!(f, "Device task file error: 0x{:02X}", status),
            AhciError::FatalInterfaceError =>
                write!(f, "Interface fatal error, port shut down"),
            AhciError::MemoryFault =>
                write!(f, "Fault while copying request buffer"),
            AhciError::DeviceNotReady =>
                write!(f, "Device is busy and did not accept the command"),
            AhciError::Timeout =>
                write!(f, "Command execution timeout"),
            AhciError::NoAvailableSlots =>
                write!(f, "All command slots are busy"),
            AhciError::InvalidParameters =>
                write!(f, "Invalid request parameters"),
            AhciError::UnsupportedDevice =>
                write!(f, "Unsupported device type"),
            AhciError::NoDevice =>
                write!(f, "No operable device on the port"),
            AhciError::BufferError =>
                write!(f, "Buffer size mismatch"),
        }
    }
}

/// AHCI Result type alias
pub type AhciResult<T> = Result<T, AhciError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_error_classification() {
        assert_eq!(AhciError::FatalInterfaceError.severity(), ErrorSeverity::Critical);
        assert_eq!(AhciError::FirmwareDisabled.severity(), ErrorSeverity::Info);
        assert_eq!(AhciError::MemoryFault.severity(), ErrorSeverity::Warning);
        assert_eq!(AhciError::Timeout.severity().level(), log::Level::Error);
        assert_eq!(AhciError::NoDevice.severity().level(), log::Level::Warn);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            AhciError::CommandError(0x0400_0000).to_string(),
            "Command failed, SError 0x04000000"
        );
        assert_eq!(AhciError::TaskFileError(0x51).to_string(), "Device task file error: 0x51");
    }
}
