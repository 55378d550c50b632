//! Directory/file inclusion rules compiled from an effective [`PathConfig`].
//! `Filter` is stateless once built — callers build one per walk.

use glob::Pattern;

use crate::types::PathConfig;

/// A glob-capable token: either an exact name or a `*`-pattern, matched
/// with `filepath.Match`-equivalent semantics.
#[derive(Debug, Clone)]
struct Token {
    raw: String,
    pattern: Option<Pattern>,
}

impl Token {
    fn compile(raw: &str) -> Self {
        let pattern = if raw.contains('*') || raw.contains('?') || raw.contains('[') {
            Pattern::new(raw).ok()
        } else {
            None
        };
        Self { raw: raw.to_string(), pattern }
    }

    fn matches(&self, candidate: &str) -> bool {
        match &self.pattern {
            Some(p) => p.matches(candidate),
            None => self.raw == candidate,
        }
    }
}

fn compile_all(tokens: &[String]) -> Vec<Token> {
    tokens.iter().map(|t| Token::compile(t)).collect()
}

fn normalize_ext(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

/// Extension tokens are matched case-insensitively with leading dots
/// normalized away, so compile them through the same normalization the
/// candidate extension goes through at match time.
fn compile_extensions(tokens: &[String]) -> Vec<Token> {
    tokens.iter().map(|t| Token::compile(&normalize_ext(t))).collect()
}

/// Compiled include/skip rules, ready to evaluate directory and file names
/// during a traversal.
#[derive(Clone)]
pub struct Filter {
    skip_hidden: bool,
    skip_extensions: Vec<Token>,
    skip_directories: Vec<Token>,
    skip_files: Vec<Token>,
    include_extensions: Vec<Token>,
    include_directories: Vec<Token>,
    include_files: Vec<Token>,
}

impl Filter {
    pub fn from_config(config: &PathConfig) -> Self {
        Self {
            skip_hidden: config.skip_hidden_effective(),
            skip_extensions: compile_extensions(&config.skip_extensions),
            skip_directories: compile_all(&config.skip_directories),
            skip_files: compile_all(&config.skip_files),
            include_extensions: compile_extensions(&config.include_extensions),
            include_directories: compile_all(&config.include_directories),
            include_files: compile_all(&config.include_files),
        }
    }

    pub fn default_filter() -> Self {
        Self::from_config(&PathConfig::default())
    }

    fn is_hidden(name: &str) -> bool {
        name.starts_with('.')
    }

    /// Precedence: `include_directories` name beats hidden, beats
    /// `skip_directories`.
    pub fn should_process_dir(&self, name: &str) -> bool {
        if self.include_directories.iter().any(|t| t.matches(name)) {
            return true;
        }
        if self.skip_hidden && Self::is_hidden(name) {
            return false;
        }
        if self.skip_directories.iter().any(|t| t.matches(name)) {
            return false;
        }
        true
    }

    /// Precedence (high → low): `include_files` name, `include_extensions`
    /// ext, `include_directories` name (a file sharing a name with an
    /// include-directories token is treated as included too, matching the
    /// source's single combined include pass), `skip_files`,
    /// `skip_extensions`, `skip_directories`, hidden.
    ///
    /// Includes override skips for files that match them; a file matching
    /// no include rule still falls through to the skip checks rather than
    /// being excluded outright, so declaring `include_*` rules narrows what
    /// skips can't touch without turning into a default-deny allowlist.
    pub fn should_process_file(&self, name: &str, ext: &str) -> bool {
        let norm_ext = normalize_ext(ext);

        if self.include_files.iter().any(|t| t.matches(name)) {
            return true;
        }
        if self.include_extensions.iter().any(|t| t.matches(&norm_ext)) {
            return true;
        }
        if self.include_directories.iter().any(|t| t.matches(name)) {
            return true;
        }

        if self.skip_files.iter().any(|t| t.matches(name)) {
            return false;
        }
        if self.skip_extensions.iter().any(|t| t.matches(&norm_ext)) {
            return false;
        }
        if self.skip_hidden && Self::is_hidden(name) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for_precedence_walkthrough() -> PathConfig {
        PathConfig {
            skip_extensions: vec![".log".into()],
            include_files: vec!["important.log".into()],
            skip_hidden: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn precedence_order_matches_include_then_skip_then_hidden() {
        let filter = Filter::from_config(&config_for_precedence_walkthrough());
        assert!(filter.should_process_file("a.txt", "txt"));
        assert!(!filter.should_process_file("b.log", "log"));
        assert!(filter.should_process_file("important.log", "log"));
        assert!(!filter.should_process_dir(".hidden"));
    }

    #[test]
    fn glob_star_pattern_matches() {
        let config = PathConfig { skip_files: vec!["*.tmp".into()], ..Default::default() };
        let filter = Filter::from_config(&config);
        assert!(!filter.should_process_file("scratch.tmp", "tmp"));
        assert!(filter.should_process_file("scratch.rs", "rs"));
    }

    #[test]
    fn extension_matching_is_case_insensitive_and_dot_normalized() {
        let config = PathConfig { skip_extensions: vec!["LOG".into()], ..Default::default() };
        let filter = Filter::from_config(&config);
        assert!(!filter.should_process_file("a.LOG", "LOG"));
        assert!(!filter.should_process_file("a.log", ".log"));
    }

    #[test]
    fn declared_includes_override_skips_but_dont_exclude_unmatched_files() {
        let config = PathConfig {
            include_extensions: vec!["rs".into()],
            skip_extensions: vec!["md".into()],
            ..Default::default()
        };
        let filter = Filter::from_config(&config);
        assert!(filter.should_process_file("main.rs", "rs"));
        assert!(!filter.should_process_file("readme.md", "md"));
        assert!(filter.should_process_file("notes.txt", "txt"));
    }

    #[test]
    fn default_filter_skips_hidden_but_nothing_else() {
        let filter = Filter::default_filter();
        assert!(!filter.should_process_dir(".git"));
        assert!(filter.should_process_dir("src"));
        assert!(filter.should_process_file("main.rs", "rs"));
    }
}
