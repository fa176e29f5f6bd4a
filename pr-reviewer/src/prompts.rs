//! Prompt template loading and rendering.
//!
//! Templates are static text files (exact names, no extension) in a
//! templates directory, cached by name after first read. Placeholders use
//! `{name}` syntax; a placeholder with no bound variable fails fast with
//! a descriptive error. The renderer never inspects model outputs.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

use regex::Regex;

use crate::errors::TemplateError;

/// Variables bound for one render call.
pub type TemplateVars<'a> = BTreeMap<&'a str, String>;

/// Disk-backed template renderer with an in-memory cache.
#[derive(Debug)]
pub struct PromptRenderer {
    dir: PathBuf,
    cache: RwLock<HashMap<String, String>>,
    placeholder_re: Regex,
}

impl PromptRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> PromptRenderer {
        PromptRenderer {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
            placeholder_re: Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}")
                .unwrap_or_else(|e| unreachable!("static regex: {e}")),
        }
    }

    /// True when a template file with this name exists.
    pub fn exists(&self, name: &str) -> bool {
        if self
            .cache
            .read()
            .map(|c| c.contains_key(name))
            .unwrap_or(false)
        {
            return true;
        }
        self.dir.join(name).is_file()
    }

    /// Renders `name` with the given variables.
    ///
    /// # Errors
    /// - [`TemplateError::NotFound`] when no such template file exists
    /// - [`TemplateError::MissingVariable`] when the template references a
    ///   placeholder absent from `vars`
    pub fn render(&self, name: &str, vars: &TemplateVars<'_>) -> Result<String, TemplateError> {
        let template = self.load(name)?;

        let mut out = String::with_capacity(template.len());
        let mut last = 0usize;
        for caps in self.placeholder_re.captures_iter(&template) {
            let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
            let key = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let value = vars
                .get(key)
                .ok_or_else(|| TemplateError::MissingVariable {
                    name: name.to_string(),
                    variable: key.to_string(),
                })?;
            out.push_str(&template[last..whole.0]);
            out.push_str(value);
            last = whole.1;
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    fn load(&self, name: &str) -> Result<String, TemplateError> {
        if let Ok(cache) = self.cache.read() {
            if let Some(t) = cache.get(name) {
                return Ok(t.clone());
            }
        }
        let path = self.dir.join(name);
        if !path.is_file() {
            return Err(TemplateError::NotFound(name.to_string()));
        }
        let text = std::fs::read_to_string(&path).map_err(|source| TemplateError::Io {
            name: name.to_string(),
            source,
        })?;
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(name.to_string(), text.clone());
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn renderer_with(name: &str, body: &str) -> (tempfile::TempDir, PromptRenderer) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(name), body).unwrap();
        let r = PromptRenderer::new(dir.path());
        (dir, r)
    }

    #[test]
    fn fills_named_placeholders() {
        let (_d, r) = renderer_with("greeting", "Review {file_path} at {line}.");
        let mut vars = TemplateVars::new();
        vars.insert("file_path", "src/a.rs".into());
        vars.insert("line", "12".into());
        assert_eq!(
            r.render("greeting", &vars).unwrap(),
            "Review src/a.rs at 12."
        );
    }

    #[test]
    fn missing_variable_fails_fast() {
        let (_d, r) = renderer_with("t", "needs {thing}");
        let err = r.render("t", &TemplateVars::new()).unwrap_err();
        match err {
            TemplateError::MissingVariable { name, variable } => {
                assert_eq!(name, "t");
                assert_eq!(variable, "thing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_template_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let r = PromptRenderer::new(dir.path());
        assert!(matches!(
            r.render("missing", &TemplateVars::new()),
            Err(TemplateError::NotFound(_))
        ));
        assert!(!r.exists("missing"));
    }

    #[test]
    fn caches_after_first_read() {
        let (dir, r) = renderer_with("t", "v1 {x}");
        let mut vars = TemplateVars::new();
        vars.insert("x", "a".into());
        assert_eq!(r.render("t", &vars).unwrap(), "v1 a");
        // Changing the file on disk does not affect the cached copy.
        fs::write(dir.path().join("t"), "v2 {x}").unwrap();
        assert_eq!(r.render("t", &vars).unwrap(), "v1 a");
    }

    #[test]
    fn extra_vars_are_ignored() {
        let (_d, r) = renderer_with("t", "no placeholders");
        let mut vars = TemplateVars::new();
        vars.insert("unused", "x".into());
        assert_eq!(r.render("t", &vars).unwrap(), "no placeholders");
    }
}
