//! Predicates over import names and export names (`spec.md` §6, §9
//! "Polymorphism"). Kept as a small capability set — `match(module, name)`
//! for imports, `match(name)` for exports — so callers can compose exact,
//! wildcard, Component-Model WIT-style, and custom matchers uniformly.
//!
//! Grounded on `crates/wasmi/src/engine/config.rs`'s builder-of-small-enums
//! style; matcher variants themselves have no direct teacher counterpart
//! (the teacher never filters imports by name pattern) so they are new glue
//! grounded directly in `spec.md` §6's bullet list of "commonly provided
//! variants".

/// Matches `(module_name, import_name)` pairs, used to decide whether an
/// imported function is an async import (`spec.md` §6 `import_matcher`).
#[derive(Clone)]
pub enum ImportMatcher {
    /// Exact match on the full `module.name` pair.
    Exact { module: String, name: String },
    /// Exact match on the import name alone, any module.
    ExactName(String),
    /// `module.*` — matches any import name within one module.
    WildcardModule(String),
    /// `prefix*` — matches any `module.name` pair whose `"module.name"`
    /// string starts with `prefix`.
    WildcardPrefix(String),
    /// Component-Model WIT-style `namespace/interface@version#function`.
    /// Version is stripped before comparison; `prefix*` globbing is
    /// supported on the pre-version portion.
    Wit { pattern: String },
    /// Matches if any of the inner matchers match (composite/union).
    Any(Vec<ImportMatcher>),
    /// An arbitrary caller-supplied predicate.
    Custom(std::sync::Arc<dyn Fn(&str, &str) -> bool + Send + Sync>),
}

impl std::fmt::Debug for ImportMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact { module, name } => {
                f.debug_struct("Exact").field("module", module).field("name", name).finish()
            }
            Self::ExactName(name) => f.debug_tuple("ExactName").field(name).finish(),
            Self::WildcardModule(m) => f.debug_tuple("WildcardModule").field(m).finish(),
            Self::WildcardPrefix(p) => f.debug_tuple("WildcardPrefix").field(p).finish(),
            Self::Wit { pattern } => f.debug_struct("Wit").field("pattern", pattern).finish(),
            Self::Any(inner) => f.debug_tuple("Any").field(inner).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ImportMatcher {
    pub fn matches(&self, module: &str, name: &str) -> bool {
        match self {
            Self::Exact { module: m, name: n } => m == module && n == name,
            Self::ExactName(n) => n == name,
            Self::WildcardModule(m) => m == module,
            Self::WildcardPrefix(prefix) => {
                let full = format!("{module}.{name}");
                full.starts_with(prefix.as_str())
            }
            Self::Wit { pattern } => wit_matches(pattern, module, name),
            Self::Any(matchers) => matchers.iter().any(|m| m.matches(module, name)),
            Self::Custom(f) => f(module, name),
        }
    }
}

/// Matches a WIT-style import against a pattern of the form
/// `namespace/interface@version#function`, where `@version` may be absent
/// on either side (stripped before comparison) and the pre-`#` portion may
/// end in `*` to match any interface/namespace prefix.
fn wit_matches(pattern: &str, module: &str, name: &str) -> bool {
    let strip_version = |s: &str| -> &str { s.split('@').next().unwrap_or(s) };

    let (pat_iface, pat_func) = pattern.split_once('#').unwrap_or((pattern, ""));
    if !pat_func.is_empty() && pat_func != name {
        return false;
    }

    let pat_iface = strip_version(pat_iface);
    let mod_iface = strip_version(module);

    if let Some(prefix) = pat_iface.strip_suffix('*') {
        mod_iface.starts_with(prefix)
    } else {
        pat_iface == mod_iface
    }
}

/// Matches an export name alone, used for `add_list`/`remove_list`/
/// `only_list` (`spec.md` §4.5 step 7, §6).
#[derive(Clone)]
pub enum NameMatcher {
    Exact(String),
    WildcardPrefix(String),
    Any(Vec<NameMatcher>),
    Custom(std::sync::Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl std::fmt::Debug for NameMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(n) => f.debug_tuple("Exact").field(n).finish(),
            Self::WildcardPrefix(p) => f.debug_tuple("WildcardPrefix").field(p).finish(),
            Self::Any(inner) => f.debug_tuple("Any").field(inner).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl NameMatcher {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(n) => n == name,
            Self::WildcardPrefix(prefix) => {
                if let Some(prefix) = prefix.strip_suffix('*') {
                    name.starts_with(prefix)
                } else {
                    prefix == name
                }
            }
            Self::Any(matchers) => matchers.iter().any(|m| m.matches(name)),
            Self::Custom(f) => f(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_requires_both_fields() {
        let m = ImportMatcher::Exact { module: "env".into(), name: "sleep".into() };
        assert!(m.matches("env", "sleep"));
        assert!(!m.matches("env", "other"));
        assert!(!m.matches("host", "sleep"));
    }

    #[test]
    fn wildcard_module_matches_any_name() {
        let m = ImportMatcher::WildcardModule("asyncify".into());
        assert!(m.matches("asyncify", "anything"));
        assert!(!m.matches("env", "anything"));
    }

    #[test]
    fn wildcard_prefix_matches_full_string() {
        let m = ImportMatcher::WildcardPrefix("env.async_".into());
        assert!(m.matches("env", "async_sleep"));
        assert!(!m.matches("env", "sync_call"));
    }

    #[test]
    fn wit_pattern_strips_version_and_globs_prefix() {
        let m = ImportMatcher::Wit { pattern: "wasi:io/poll@*#poll".into() };
        // note: `@*` is not meaningful version syntax, exercised instead via
        // `wit_matches`' direct version-stripping path below.
        let _ = m;
        assert!(wit_matches("wasi:io/poll#poll", "wasi:io/poll@0.2.0", "poll"));
        assert!(wit_matches("wasi:io/*#poll", "wasi:io/streams@0.2.0", "poll"));
        assert!(!wit_matches("wasi:io/poll#poll", "wasi:io/poll@0.2.0", "other"));
    }

    #[test]
    fn name_matcher_wildcard_prefix() {
        let m = NameMatcher::WildcardPrefix("test_*".into());
        assert!(m.matches("test_foo"));
        assert!(!m.matches("other"));
    }
}
