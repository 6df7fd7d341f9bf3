//! Exit code constants for stepwright.
//!
//! # Exit Code Table
//!
//! | Code | Constant | Description |
//! |------|----------|-------------|
//! | 0 | `SUCCESS` | Every step succeeded |
//! | 1 | `STEP_FAILED` | Generic step failure |
//! | 2 | `CLI_ARGS` | Invalid CLI arguments, configuration or script |
//! | 130 | `CANCELLED` | Operator interrupt |
//!
//! A step that fails with an outcome code in `1..=255` (other than 2 and 130)
//! terminates the process with that same code; see [`ExitCode::for_step_code`].

/// Process exit code.
///
/// Use the named constants, or [`as_i32()`](Self::as_i32) for
/// `std::process::exit()`.
///
/// # Example
///
/// ```rust
/// use stepwright_utils::ExitCode;
///
/// assert_eq!(ExitCode::SUCCESS.as_i32(), 0);
/// assert_eq!(ExitCode::for_step_code(3), ExitCode::from_i32(3));
/// assert_eq!(ExitCode::for_step_code(-1), ExitCode::STEP_FAILED);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitCode(i32);

impl ExitCode {
    /// All steps succeeded
    pub const SUCCESS: ExitCode = ExitCode(0);

    /// A step failed and no more specific code applies
    pub const STEP_FAILED: ExitCode = ExitCode(1);

    /// Invalid CLI arguments, configuration, or step script
    pub const CLI_ARGS: ExitCode = ExitCode(2);

    /// The operator interrupted the run
    pub const CANCELLED: ExitCode = ExitCode(130);

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn from_i32(code: i32) -> Self {
        ExitCode(code)
    }

    /// Exit code for a step that finished with outcome `code != 0`.
    ///
    /// The failing code is passed through when it is a valid process status
    /// and cannot be mistaken for success, a usage error or cancellation.
    #[must_use]
    pub const fn for_step_code(code: i32) -> Self {
        if code >= 1 && code <= 255 && code != Self::CLI_ARGS.0 && code != Self::CANCELLED.0 {
            ExitCode(code)
        } else {
            Self::STEP_FAILED
        }
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        // Codes are constructed in 0..=255 except via from_i32; clamp the rest.
        let byte = u8::try_from(code.0).unwrap_or(1);
        std::process::ExitCode::from(byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_constants() {
        assert_eq!(ExitCode::SUCCESS.as_i32(), 0);
        assert_eq!(ExitCode::STEP_FAILED.as_i32(), 1);
        assert_eq!(ExitCode::CLI_ARGS.as_i32(), 2);
        assert_eq!(ExitCode::CANCELLED.as_i32(), 130);
    }

    #[test]
    fn test_step_code_passthrough() {
        assert_eq!(ExitCode::for_step_code(1).as_i32(), 1);
        assert_eq!(ExitCode::for_step_code(42).as_i32(), 42);
        assert_eq!(ExitCode::for_step_code(255).as_i32(), 255);
    }

    #[test]
    fn test_step_code_out_of_range_is_generic_failure() {
        assert_eq!(ExitCode::for_step_code(0), ExitCode::STEP_FAILED);
        assert_eq!(ExitCode::for_step_code(-9), ExitCode::STEP_FAILED);
        assert_eq!(ExitCode::for_step_code(256), ExitCode::STEP_FAILED);
    }

    #[test]
    fn test_step_code_never_impersonates_cancellation() {
        assert_eq!(ExitCode::for_step_code(130), ExitCode::STEP_FAILED);
    }

    #[test]
    fn test_step_code_never_impersonates_usage_error() {
        assert_eq!(ExitCode::for_step_code(2), ExitCode::STEP_FAILED);
        assert_eq!(ExitCode::for_step_code(3).as_i32(), 3);
    }

    #[test]
    fn test_is_success() {
        assert!(ExitCode::SUCCESS.is_success());
        assert!(!ExitCode::CANCELLED.is_success());
    }
}
