// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Include and exclude rules for directory sections.
//!
//! Both rule sets use gitignore syntax. Exclude rules behave exactly like a
//! gitignore file. Include rules are read with inverted semantics: a path is
//! tracked only if some include rule would have _ignored_ it. No include rules
//! at all means everything is tracked.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

/// Compiled include/exclude rules of one section.
#[derive(Clone, Debug, Default)]
pub struct SectionFilter {
    include: Option<Gitignore>,
    exclude: Option<Gitignore>,
}

impl SectionFilter {
    /// Compile rules relative to section root.
    ///
    /// # Errors
    ///
    /// - Return [`ignore::Error`] if a rule is not valid gitignore syntax.
    pub fn new(
        root: impl AsRef<Path>,
        include: &[String],
        exclude: &[String],
    ) -> Result<Self, ignore::Error> {
        Ok(Self {
            include: compile(root.as_ref(), include)?,
            exclude: compile(root.as_ref(), exclude)?,
        })
    }

    /// Check whether path relative to section root is tracked.
    pub fn allows(&self, relative: impl AsRef<Path>) -> bool {
        let relative = relative.as_ref();
        if let Some(exclude) = &self.exclude {
            if exclude.matched_path_or_any_parents(relative, false).is_ignore() {
                return false;
            }
        }

        // INVARIANT: Invert gitignore logic for include rules.
        match &self.include {
            Some(include) => include
                .matched_path_or_any_parents(relative, false)
                .is_ignore(),
            None => true,
        }
    }
}

fn compile(root: &Path, rules: &[String]) -> Result<Option<Gitignore>, ignore::Error> {
    if rules.is_empty() {
        return Ok(None);
    }

    let mut builder = GitignoreBuilder::new(root);
    for rule in rules {
        builder.add_line(None, rule)?;
    }

    builder.build().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    fn rules(rules: &[&str]) -> Vec<String> {
        rules.iter().map(ToString::to_string).collect()
    }

    #[test_case(&[], &[], "init.lua", true; "no rules tracks all")]
    #[test_case(&[], &["cache/"], "cache/blob", false; "excluded directory")]
    #[test_case(&[], &["*.log"], "deep/nested/run.log", false; "excluded glob")]
    #[test_case(&["*.lua"], &[], "lua/plugins.lua", true; "included glob")]
    #[test_case(&["*.lua"], &[], "README.md", false; "not included")]
    #[test_case(&["lua/"], &["lua/secret.lua"], "lua/secret.lua", false; "exclude wins")]
    #[test]
    fn filter_paths(include: &[&str], exclude: &[&str], path: &str, expect: bool) {
        let filter = SectionFilter::new("/home/blah/.config/nvim", &rules(include), &rules(exclude))
            .expect("rules compile");
        assert_eq!(filter.allows(path), expect);
    }
}
