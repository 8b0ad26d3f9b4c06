use std::path::PathBuf;

/// Decides which allocated classes get traced, by prefix of their user form
/// name (`java.lang.String[]`). Excludes win over includes; an empty include
/// list admits everything not excluded.
#[derive(Debug, Clone, Default)]
pub struct InstrumentationFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl InstrumentationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, prefix: impl Into<String>) -> Self {
        self.include.push(prefix.into());
        self
    }

    pub fn exclude(mut self, prefix: impl Into<String>) -> Self {
        self.exclude.push(prefix.into());
        self
    }

    pub fn passes(&self, class_name: &str) -> bool {
        if self.exclude.iter().any(|p| class_name.starts_with(p.as_str())) {
            return false;
        }

        self.include.is_empty() || self.include.iter().any(|p| class_name.starts_with(p.as_str()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstrumentConfig {
    /// Where class bytes are written when instrumentation meets content it
    /// does not understand. Nothing is written when unset.
    pub dump_dir: Option<PathBuf>,
    pub filter: InstrumentationFilter,
    /// Instrument `HttpServlet.do*` so requests can be attributed.
    pub servlet_tracking: bool,
    /// Trace allocations from inside `java.lang.Object.<init>` as well.
    pub track_object_ctor: bool,
    /// Call into the sampled CPU runtime instead of the full one.
    pub cpu_sampled: bool,
}

#[cfg(test)]
mod tests {
    use super::InstrumentationFilter;

    #[test]
    fn it_filters_by_prefix() {
        let filter = InstrumentationFilter::new()
            .include("com.acme.")
            .exclude("com.acme.internal.");

        assert!(filter.passes("com.acme.Widget"));
        assert!(filter.passes("com.acme.Widget[]"));
        assert!(!filter.passes("com.acme.internal.Cache"));
        assert!(!filter.passes("java.lang.String"));

        assert!(InstrumentationFilter::new().passes("int[]"));
    }
}
