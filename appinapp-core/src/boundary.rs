// appinapp-core/src/boundary.rs
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::error;

/// Terminal failure of one widget instance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Widget crashed: {message}")]
pub struct RenderCrash {
    pub message: String,
}

/// Fault containment around one instance's render and update calls.
///
/// The first error or panic latches the boundary; every later call returns
/// the same crash without running the closure. Only a new boundary (a
/// remount) clears it.
#[derive(Debug, Default)]
pub struct CrashBoundary {
    name: String,
    crash: Option<RenderCrash>,
}

impl CrashBoundary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            crash: None,
        }
    }

    pub fn crashed(&self) -> Option<&RenderCrash> {
        self.crash.as_ref()
    }

    pub fn guard<T, E: std::fmt::Display>(
        &mut self,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, RenderCrash> {
        if let Some(crash) = &self.crash {
            return Err(crash.clone());
        }

        let message = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        error!(widget = %self.name, error = %message, "widget crashed");
        let crash = RenderCrash { message };
        self.crash = Some(crash.clone());
        Err(crash)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passes_values_through() {
        let mut boundary = CrashBoundary::new("Clock");
        assert_eq!(boundary.guard(|| Ok::<_, String>(3)).unwrap(), 3);
        assert!(boundary.crashed().is_none());
    }

    #[test]
    fn test_error_latches() {
        let mut boundary = CrashBoundary::new("Clock");
        let crash = boundary.guard(|| Err::<(), _>("boom")).unwrap_err();
        assert_eq!(crash.message, "boom");

        let mut ran = false;
        let again = boundary.guard(|| {
            ran = true;
            Ok::<_, String>(())
        });
        assert_eq!(again.unwrap_err(), crash);
        assert!(!ran);
    }

    #[test]
    fn test_panic_is_contained() {
        let mut boundary = CrashBoundary::new("Clock");
        let crash = boundary
            .guard(|| -> Result<(), String> { panic!("render exploded") })
            .unwrap_err();
        assert_eq!(crash.message, "render exploded");
        assert!(boundary.crashed().is_some());
    }
}
