//! Application status codes carried by channel close.
//!
//! Codes are HRESULT-compatible: the customer bit is set and bits 16..27 name
//! the facility that produced the code, so a close status identifies both the
//! originating subsystem and the condition.

/// Successful completion.
pub const SUCCESS: u32 = 0;

/// Upload target exists and overwrite was not requested.
pub const FILE_EXISTS: u32 = 0xA002_0001;

/// Download source or listed directory does not exist.
pub const FILE_NOT_FOUND: u32 = 0xA002_0002;

/// Unspecified PTY failure.
pub const PTY_GENERIC_ERROR: u32 = 0xA003_0001;

/// The shell command line could not be parsed.
pub const PTY_FAILED_TO_PARSE_ARGUMENTS: u32 = 0xA003_0100;

/// Base for exit codes reported by the Linux PTY helper.
pub const PTY_LINUX_EXIT_CODE: u32 = 0xA003_9900;

const CUSTOMER_BIT: u32 = 0x2000_0000;
const SEVERITY_BIT: u32 = 0x8000_0000;

/// Facility that produced an application status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facility {
    /// Custom file transfers (upload, download, listing).
    FileTransfer,
    /// Pseudo-terminal support.
    Pty,
}

impl Facility {
    /// Facility number encoded in bits 16..27.
    pub const fn number(self) -> u32 {
        match self {
            Facility::FileTransfer => 0x002,
            Facility::Pty => 0x003,
        }
    }

    /// Decode the facility of an application status code.
    ///
    /// Plain process exit codes (no severity and customer bits) yield `None`.
    pub fn of(code: u32) -> Option<Self> {
        if code & (SEVERITY_BIT | CUSTOMER_BIT) != (SEVERITY_BIT | CUSTOMER_BIT) {
            return None;
        }
        match (code >> 16) & 0x0FFF {
            0x002 => Some(Facility::FileTransfer),
            0x003 => Some(Facility::Pty),
            _ => None,
        }
    }
}

/// Returns true when `code` is an application error rather than a process exit code.
pub fn is_application_error(code: u32) -> bool {
    Facility::of(code).is_some()
}

/// Human-readable description for well-known codes.
pub fn describe(code: u32) -> Option<&'static str> {
    match code {
        SUCCESS => Some("success"),
        FILE_EXISTS => Some("file already exists"),
        FILE_NOT_FOUND => Some("file not found"),
        PTY_GENERIC_ERROR => Some("pty failure"),
        PTY_FAILED_TO_PARSE_ARGUMENTS => Some("failed to parse pty arguments"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_codes_belong_to_file_transfer() {
        assert_eq!(Facility::of(FILE_EXISTS), Some(Facility::FileTransfer));
        assert_eq!(Facility::of(FILE_NOT_FOUND), Some(Facility::FileTransfer));
    }

    #[test]
    fn pty_codes_belong_to_pty() {
        for code in [
            PTY_GENERIC_ERROR,
            PTY_FAILED_TO_PARSE_ARGUMENTS,
            PTY_LINUX_EXIT_CODE,
        ] {
            assert_eq!(Facility::of(code), Some(Facility::Pty));
        }
    }

    #[test]
    fn exit_codes_have_no_facility() {
        assert_eq!(Facility::of(0), None);
        assert_eq!(Facility::of(1), None);
        assert_eq!(Facility::of(255), None);
        assert!(!is_application_error(42));
    }

    #[test]
    fn codes_are_distinct() {
        let codes = [
            FILE_EXISTS,
            FILE_NOT_FOUND,
            PTY_GENERIC_ERROR,
            PTY_FAILED_TO_PARSE_ARGUMENTS,
            PTY_LINUX_EXIT_CODE,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn describe_known_codes() {
        assert_eq!(describe(FILE_EXISTS), Some("file already exists"));
        assert_eq!(describe(7), None);
    }
}
