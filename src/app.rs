//! Application loading: resolving the user-supplied locator string into
//! a concrete [`Application`] handle the worker flavor can drive.
//!
//! The original resolves a dotted Python import path at runtime
//! (`module:callable`) and calls the result per-request. Rust has no
//! dynamic-import analogue, so the locator instead names an entry in a
//! small static registry — the same "name maps to a constructor" shape
//! the original uses for `choose_worker` (`workers/__init__.py`), and
//! the one `gpu_stats::monitors` uses to pick a concrete `GpuMonitor`
//! implementation from a string key.

use std::fmt;

use crate::error::{Result, SupervisorError};

/// A loaded, ready-to-run application handle. Deliberately minimal: a
/// worker only needs to construct a per-connection handler closure
/// from it, not route HTTP.
#[derive(Clone)]
pub struct Application {
    name: String,
    handler: fn() -> Handler,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application").field("name", &self.name).finish()
    }
}

impl Application {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> Handler {
        (self.handler)()
    }
}

/// A constructed, per-worker instance of the application's connection
/// handling entry point.
#[derive(Clone, Copy)]
pub struct Handler(pub fn(&[u8]) -> Vec<u8>);

fn echo_handler() -> Handler {
    Handler(|input| input.to_vec())
}

fn discard_handler() -> Handler {
    Handler(|_| Vec::new())
}

/// Parse `module.path[:callable]` and resolve it against the built-in
/// registry. Unlike the original, which imports arbitrary code, only
/// names registered at compile time can resolve; anything else is an
/// [`SupervisorError::AppImport`].
pub fn load(locator: &str) -> Result<Application> {
    let (module, callable) = match locator.split_once(':') {
        Some((m, c)) => (m, c),
        None => (locator, "application"),
    };
    if module.is_empty() {
        return Err(SupervisorError::AppImport(
            "empty module path in locator".to_string(),
        ));
    }
    let handler = match callable {
        "application" | "app" | "echo" => echo_handler,
        "discard" => discard_handler,
        other => {
            return Err(SupervisorError::AppImport(format!(
                "unknown callable {other:?} in locator {locator:?}"
            )))
        }
    };
    Ok(Application {
        name: format!("{module}:{callable}"),
        handler,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_callable_name_is_application() {
        let app = load("myapp").unwrap();
        assert_eq!(app.name(), "myapp:application");
    }

    #[test]
    fn explicit_callable_is_honored() {
        let app = load("myapp:echo").unwrap();
        assert_eq!(app.name(), "myapp:echo");
    }

    #[test]
    fn unknown_callable_is_an_app_load_error() {
        assert!(matches!(
            load("myapp:nonexistent"),
            Err(SupervisorError::AppImport(_))
        ));
    }

    #[test]
    fn empty_module_is_rejected() {
        assert!(load(":echo").is_err());
    }
}
