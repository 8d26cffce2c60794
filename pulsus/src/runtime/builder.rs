use crate::error::{Error, Result};
use crate::reactor::Driver;
use crate::reactor::backend::{Backend, BackendKind};

/// Selects the backend used when `PULSUS_DRIVER` is set.
pub const DRIVER_ENV: &str = "PULSUS_DRIVER";

/// Enables call-site tracing when set to anything but `0` or `false`.
pub const TRACE_ENV: &str = "PULSUS_DRIVER_DEBUG_TRACE";

enum Selection {
    Best,
    Kind(BackendKind),
    Custom(Box<dyn Backend>),
}

/// Builder for configuring and creating a driver.
///
/// `DriverBuilder` chooses the polling backend and whether callback
/// call-sites are traced. Without explicit configuration it picks the
/// best backend the platform supports.
///
/// # Examples
///
/// ```rust,ignore
/// let driver = DriverBuilder::new()
///     .backend(BackendKind::Poll)
///     .tracing(true)
///     .build()?;
/// ```
pub struct DriverBuilder {
    backend: Selection,
    tracing: bool,
}

impl DriverBuilder {
    /// Creates a builder with default configuration: the best available
    /// backend and no tracing.
    pub fn new() -> Self {
        Self {
            backend: Selection::Best,
            tracing: false,
        }
    }

    /// Creates a builder configured from `PULSUS_DRIVER` and
    /// `PULSUS_DRIVER_DEBUG_TRACE`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownBackend`] when `PULSUS_DRIVER` names no
    /// known backend.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Self::new();

        if let Some(name) = lookup(DRIVER_ENV).filter(|name| !name.trim().is_empty()) {
            builder = builder.backend(name.parse()?);
        }

        if let Some(flag) = lookup(TRACE_ENV) {
            let flag = flag.trim();
            builder = builder.tracing(
                !flag.is_empty() && flag != "0" && !flag.eq_ignore_ascii_case("false"),
            );
        }

        Ok(builder)
    }

    /// Uses one of the built-in backends.
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = Selection::Kind(kind);
        self
    }

    /// Uses a caller-provided backend.
    pub fn with_backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backend = Selection::Custom(backend);
        self
    }

    /// Records where callbacks are created and cancelled, for diagnostics.
    pub fn tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    /// Builds the driver with the configured options.
    ///
    /// A built-in backend that fails to start falls back to the next more
    /// portable one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedBackend`] when the requested backend is
    /// not available on this platform, and [`Error::Backend`] when no
    /// backend could be started.
    pub fn build(self) -> Result<Driver> {
        let kind = match self.backend {
            Selection::Custom(backend) => return Ok(Driver::from_backend(backend, self.tracing)),
            Selection::Kind(kind) => kind,
            Selection::Best => BackendKind::best_available(),
        };

        if !kind.is_supported() {
            return Err(Error::UnsupportedBackend(kind.name()));
        }

        let mut kind = kind;
        loop {
            match kind.create() {
                Ok(backend) => return Ok(Driver::from_backend(backend, self.tracing)),
                Err(e) => match kind.fallback() {
                    Some(next) => {
                        log::warn!("{kind} backend failed to start ({e}); falling back to {next}");
                        kind = next;
                    }
                    None => return Err(Error::Backend(e)),
                },
            }
        }
    }
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn environment_selects_backend_and_tracing() {
        let builder =
            DriverBuilder::from_lookup(lookup(&[(DRIVER_ENV, "Virtual"), (TRACE_ENV, "1")]))
                .unwrap();
        assert!(builder.tracing);
        assert!(matches!(builder.backend, Selection::Kind(BackendKind::Virtual)));

        let driver = builder.build().unwrap();
        assert_eq!(driver.backend_name(), "virtual");
    }

    #[test]
    fn falsy_trace_values_disable_tracing() {
        for value in ["", "0", "false", "FALSE"] {
            let builder = DriverBuilder::from_lookup(lookup(&[(TRACE_ENV, value)])).unwrap();
            assert!(!builder.tracing, "{value:?} should not enable tracing");
        }
    }

    #[test]
    fn empty_environment_uses_best_backend() {
        let builder = DriverBuilder::from_lookup(lookup(&[(DRIVER_ENV, "  ")])).unwrap();
        assert!(matches!(builder.backend, Selection::Best));

        let driver = builder.build().unwrap();
        assert_eq!(driver.backend_name(), BackendKind::best_available().name());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let error = DriverBuilder::from_lookup(lookup(&[(DRIVER_ENV, "kqueue")]))
            .err()
            .unwrap();
        assert!(matches!(error, Error::UnknownBackend(name) if name == "kqueue"));
    }
}
