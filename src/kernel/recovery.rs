//! Panic recovery at dispatch boundaries.
//!
//! Extension callbacks, magic handlers and execution bodies are foreign code.
//! A panic in one of them is captured here, logged, and turned into an error
//! so the pump, worker or sibling callbacks keep running.

use crate::types::{Error, Result};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::interrupts::InterruptSignal;

/// Execute a function with panic recovery.
///
/// A panic carrying [`InterruptSignal`] becomes [`Error::Interrupted`]; any
/// other panic becomes [`Error::Internal`] with the panic message.
///
/// # Example
/// ```
/// use cellkernel::kernel::with_recovery;
///
/// let result = with_recovery(|| Ok(42), "my_operation");
/// assert_eq!(result.unwrap(), 42);
/// ```
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            if panic_payload.is::<InterruptSignal>() {
                tracing::debug!("interrupt_unwound: operation={}", operation_name);
                return Err(Error::Interrupted);
            }

            let panic_msg = extract_panic_message(&*panic_payload);
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );

            Err(Error::internal(format!(
                "Panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Extract panic message from panic payload.
pub(crate) fn extract_panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_recovery_success() {
        let result = with_recovery(|| Ok(42), "test_operation");
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_recovery_preserves_error_details() {
        let result: Result<()> = with_recovery(
            || Err(Error::validation("specific validation error")),
            "test_operation",
        );
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("specific validation error"));
    }

    #[test]
    fn test_with_recovery_panic_str() {
        let result: Result<()> = with_recovery(|| -> Result<()> { panic!("test panic") }, "test_operation");

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Panic in test_operation"));
        assert!(err_msg.contains("test panic"));
    }

    #[test]
    fn test_with_recovery_panic_string() {
        let result: Result<()> = with_recovery(
            || -> Result<()> { panic!("{}", "dynamic panic message") },
            "test_operation",
        );

        assert!(result
            .unwrap_err()
            .to_string()
            .contains("dynamic panic message"));
    }

    #[test]
    fn test_interrupt_signal_maps_to_interrupted() {
        let result: Result<()> = with_recovery(|| -> Result<()> { InterruptSignal::raise() }, "cell");
        assert!(matches!(result, Err(Error::Interrupted)));
    }

    #[test]
    fn test_extract_panic_message_unknown_payload() {
        let payload = std::panic::catch_unwind(|| std::panic::panic_any(17u32)).unwrap_err();
        assert_eq!(extract_panic_message(&*payload), "Unknown panic (no message)");
    }
}
